//! Health monitor: one check loop per supervised profile.

mod backoff;
mod probe;

pub use backoff::Backoff;
pub use probe::{Probe, ProbeContext, ProbeTable};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::RestartSettings;
use crate::core::error::{AgentvisorError, Result};
use crate::core::lifecycle::LifecycleComponent;
use crate::core::profile::{HealthConfig, RestartPolicy};
use crate::core::state::{HealthState, HealthStatus, ProcessRecord, ProcessStatus, ProfileKey};
use crate::core::supervisor::Supervisor;

const SCAN_INTERVAL: Duration = Duration::from_secs(2);

/// What a single check cycle concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No record, or the record is `Stopped`; the profile's loop ends.
    Inactive,
    InGrace(Duration),
    Healthy,
    Unhealthy,
    Crashed,
    Restarted,
}

pub struct HealthMonitor {
    supervisor: Arc<Supervisor>,
    probes: ProbeTable,
    backoff: Backoff,
    reset_after: Duration,
    tasks: Mutex<HashMap<ProfileKey, JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl HealthMonitor {
    pub fn new(supervisor: Arc<Supervisor>, restart: &RestartSettings) -> Self {
        Self::with_probes(supervisor, restart, ProbeTable::standard())
    }

    pub fn with_probes(
        supervisor: Arc<Supervisor>,
        restart: &RestartSettings,
        probes: ProbeTable,
    ) -> Self {
        Self {
            supervisor,
            probes,
            backoff: Backoff::from_settings(restart),
            reset_after: Duration::from_secs(restart.reset_after_seconds),
            tasks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Rescan every `SCAN_INTERVAL` until shutdown.
    pub fn spawn_scan_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = monitor.scan().await {
                    warn!("Health scan failed: {}", e);
                }
                tokio::select! {
                    _ = monitor.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(SCAN_INTERVAL) => {}
                }
            }
        })
    }

    /// Start a check loop for every non-stopped profile that lacks one.
    pub async fn scan(self: &Arc<Self>) -> Result<usize> {
        let records = self.supervisor.list().await?;
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|_, handle| !handle.is_finished());

        let mut spawned = 0;
        for record in records {
            if record.status == ProcessStatus::Stopped {
                continue;
            }
            let key = record.key();
            if tasks.contains_key(&key) {
                continue;
            }
            debug!(profile = %key, "Watching profile health");
            let monitor = self.clone();
            let task_key = key.clone();
            tasks.insert(key, tokio::spawn(monitor.watch_profile(task_key)));
            spawned += 1;
        }
        Ok(spawned)
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut tasks = self.tasks.lock().await;
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }

    async fn watch_profile(self: Arc<Self>, key: ProfileKey) {
        loop {
            let config = self.config_for(&key);
            let mut wait = Duration::from_secs(config.interval_seconds.max(1));
            match self.check_once(&key).await {
                Ok(CycleOutcome::Inactive) => break,
                Ok(CycleOutcome::InGrace(remaining)) => {
                    wait = wait.min(remaining + Duration::from_millis(100));
                }
                Ok(_) => {}
                Err(e) => warn!(profile = %key, "Health cycle failed: {}", e),
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!(profile = %key, "Health loop finished");
    }

    fn config_for(&self, key: &ProfileKey) -> HealthConfig {
        self.supervisor.declarations().current().health_for(key)
    }

    /// Run one check cycle for `key`.
    pub async fn check_once(&self, key: &ProfileKey) -> Result<CycleOutcome> {
        let Some(record) = self.supervisor.status(&key.agent_id, &key.label).await? else {
            return Ok(CycleOutcome::Inactive);
        };
        let config = self.config_for(key);

        match record.status {
            ProcessStatus::Stopped
                if record.exited_cleanly() && config.restart_policy == RestartPolicy::Always =>
            {
                return match self.restart(key, &record, "exited").await? {
                    true => Ok(CycleOutcome::Restarted),
                    false => Ok(CycleOutcome::Inactive),
                };
            }
            ProcessStatus::Stopped => return Ok(CycleOutcome::Inactive),
            ProcessStatus::Crashed => return self.on_crashed(key, &config).await,
            ProcessStatus::Starting | ProcessStatus::Running => {}
        }

        let now = Utc::now();
        let age = (now - record.start_time).to_std().unwrap_or_default();
        let grace = Duration::from_secs(config.grace_period_seconds);
        if age < grace {
            return Ok(CycleOutcome::InGrace(grace - age));
        }

        let alive = self.supervisor.is_alive(&record);
        if !alive {
            // adopted processes have no waiter to report their exit
            if let Some(pid) = record.pid {
                self.supervisor.mark_exited(key, pid).await?;
            }
            return self.on_crashed(key, &config).await;
        }

        let ctx = ProbeContext {
            target: config.probe_target.clone(),
            port: record.port,
            cwd: record.cwd.clone(),
            alive,
            timeout: Duration::from_secs(config.probe_timeout_seconds.max(1)),
        };
        match self.probes.run(config.probe_kind, &ctx).await {
            Ok(()) => {
                self.on_healthy(key, &record, now).await;
                if record.status == ProcessStatus::Starting
                    && let Some(pid) = record.pid
                {
                    self.supervisor.mark_running(key, pid).await?;
                }
                Ok(CycleOutcome::Healthy)
            }
            Err(e) => {
                warn!(profile = %key, "Probe failed: {}", e);
                self.record_health(key, |health| {
                    health.status = HealthStatus::Unhealthy;
                    health.last_check_time = Some(now);
                    health.last_log_time = log_mtime(&record);
                    health.healthy_since = None;
                    health.last_error = Some(e.to_string());
                })
                .await;
                if config.restart_policy == RestartPolicy::Always
                    && self.restart(key, &record, "unhealthy").await?
                {
                    return Ok(CycleOutcome::Restarted);
                }
                Ok(CycleOutcome::Unhealthy)
            }
        }
    }

    /// Restart path for a profile whose process is gone, e.g. after
    /// reconciliation found it dead.
    pub async fn handle_crashed(&self, key: &ProfileKey) -> Result<bool> {
        let config = self.config_for(key);
        let outcome = self.on_crashed(key, &config).await?;
        Ok(outcome == CycleOutcome::Restarted)
    }

    /// Hand every crashed profile to its own restart task and return at once,
    /// so their backoffs run concurrently and never hold up the caller.
    pub fn recover_crashed(self: &Arc<Self>, keys: Vec<ProfileKey>) -> Vec<JoinHandle<()>> {
        keys.into_iter()
            .map(|key| {
                let monitor = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = monitor.handle_crashed(&key).await {
                        warn!(profile = %key, "Crash handling failed: {}", e);
                    }
                })
            })
            .collect()
    }

    async fn on_crashed(&self, key: &ProfileKey, config: &HealthConfig) -> Result<CycleOutcome> {
        let Some(record) = self.supervisor.status(&key.agent_id, &key.label).await? else {
            return Ok(CycleOutcome::Inactive);
        };
        if record.status != ProcessStatus::Crashed {
            return Ok(CycleOutcome::Inactive);
        }
        let now = Utc::now();
        self.record_health(key, |health| {
            health.status = HealthStatus::Crashed;
            health.last_check_time = Some(now);
            health.last_log_time = log_mtime(&record);
            health.healthy_since = None;
            health.last_error = record.last_error.clone();
        })
        .await;

        let permitted = matches!(
            config.restart_policy,
            RestartPolicy::OnCrash | RestartPolicy::Always
        );
        if permitted && self.restart(key, &record, "crashed").await? {
            return Ok(CycleOutcome::Restarted);
        }
        Ok(CycleOutcome::Crashed)
    }

    async fn on_healthy(&self, key: &ProfileKey, record: &ProcessRecord, now: DateTime<Utc>) {
        let reset_after = chrono::Duration::from_std(self.reset_after).unwrap_or_default();
        self.record_health(key, |health| {
            health.status = HealthStatus::Healthy;
            health.last_check_time = Some(now);
            health.last_log_time = log_mtime(record);
            health.last_error = None;
            let since = *health.healthy_since.get_or_insert(now);
            if health.consecutive_restarts > 0 && now - since >= reset_after {
                info!(profile = %key, "Healthy long enough, resetting restart backoff");
                health.consecutive_restarts = 0;
            }
        })
        .await;
    }

    /// Wait out the backoff, then replace the process `observed` describes.
    /// Returns false when the restart was cancelled or superseded, e.g. by a
    /// start that landed during the backoff.
    async fn restart(
        &self,
        key: &ProfileKey,
        observed: &ProcessRecord,
        reason: &str,
    ) -> Result<bool> {
        let token = self.supervisor.backoff_token(key);
        let consecutive = self
            .supervisor
            .store()
            .load()
            .await?
            .health(key)
            .map(|h| h.consecutive_restarts)
            .unwrap_or(0);
        let delay = self.backoff.delay(consecutive);
        let due = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        self.record_health(key, |health| health.next_restart_at = Some(due))
            .await;
        info!(profile = %key, reason, delay_secs = delay.as_secs(), "Scheduling restart");

        tokio::select! {
            _ = token.cancelled() => {
                info!(profile = %key, "Restart cancelled");
                self.record_health(key, |health| health.next_restart_at = None).await;
                return Ok(false);
            }
            _ = self.shutdown.cancelled() => return Ok(false),
            _ = tokio::time::sleep(delay) => {}
        }

        let current = self.supervisor.status(&key.agent_id, &key.label).await?;
        let Some(record) = current.filter(|record| {
            (record.status != ProcessStatus::Stopped || record.exited_cleanly())
                && record.pid == observed.pid
                && record.start_time == observed.start_time
        }) else {
            info!(profile = %key, "Record changed during backoff, skipping restart");
            self.record_health(key, |health| health.next_restart_at = None).await;
            return Ok(false);
        };
        if self.supervisor.is_alive(&record) {
            self.supervisor.terminate(key, "restart").await?;
        }

        match self.supervisor.start(&key.agent_id, &key.label).await {
            Ok(_) => {
                self.record_health(key, |health| {
                    health.restart_count += 1;
                    health.consecutive_restarts += 1;
                    health.next_restart_at = None;
                    health.status = HealthStatus::Unknown;
                })
                .await;
                info!(profile = %key, "Restarted run profile");
                Ok(true)
            }
            Err(AgentvisorError::AlreadyRunning(_)) => Ok(false),
            Err(e) => {
                let message = e.to_string();
                self.record_health(key, |health| {
                    health.next_restart_at = None;
                    health.last_error = Some(message.clone());
                })
                .await;
                Err(e)
            }
        }
    }

    /// Health writes are best effort; failures are logged and the next
    /// cycle tries again.
    async fn record_health<F>(&self, key: &ProfileKey, update: F)
    where
        F: FnOnce(&mut HealthState),
    {
        let result = self
            .supervisor
            .store()
            .mutate(|snap| {
                update(snap.health_mut(key));
                Ok(())
            })
            .await;
        if let Err(e) = result {
            warn!(profile = %key, "Failed to write health state: {}", e);
        }
    }
}

fn log_mtime(record: &ProcessRecord) -> Option<DateTime<Utc>> {
    std::fs::metadata(&record.log_path)
        .and_then(|meta| meta.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// Lifecycle wrapper that owns the monitor's scan loop.
pub struct MonitorService {
    monitor: Arc<HealthMonitor>,
    scan_loop: Option<JoinHandle<()>>,
}

impl MonitorService {
    pub fn new(monitor: Arc<HealthMonitor>) -> Self {
        Self {
            monitor,
            scan_loop: None,
        }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for MonitorService {
    async fn on_init(&mut self) -> anyhow::Result<()> {
        info!("Health monitor initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> anyhow::Result<()> {
        self.scan_loop = Some(self.monitor.spawn_scan_loop());
        Ok(())
    }

    async fn on_shutdown(&mut self) -> anyhow::Result<()> {
        info!("Health monitor shutting down...");
        self.monitor.shutdown().await;
        if let Some(handle) = self.scan_loop.take() {
            handle.abort();
        }
        Ok(())
    }
}

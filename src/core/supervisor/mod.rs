//! Process supervisor: owns every `ProcessRecord` transition.

mod spawn;

pub(crate) use spawn::log_path;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::config::Paths;
use crate::core::error::{AgentvisorError, Result};
use crate::core::profile::Declarations;
use crate::core::state::{EXITED_REASON, ProcessRecord, ProcessStatus, ProfileKey, StateStore};
use crate::platform::{self, NativePlatform, Platform};

/// Allowed drift between the recorded and the observed process start time.
const FINGERPRINT_TOLERANCE_SECS: u64 = 2;
const STOP_POLL: Duration = Duration::from_millis(200);
/// A `Starting` claim that never received a pid is considered abandoned
/// after this long.
const CLAIM_TIMEOUT_SECS: i64 = 30;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub adopted: Vec<ProfileKey>,
    pub crashed: Vec<ProfileKey>,
}

pub struct Supervisor {
    store: Arc<StateStore>,
    declarations: Arc<Declarations>,
    paths: Paths,
    stop_timeout: Duration,
    backoff_tokens: StdMutex<HashMap<ProfileKey, CancellationToken>>,
}

impl Supervisor {
    pub fn new(
        store: Arc<StateStore>,
        declarations: Arc<Declarations>,
        paths: Paths,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            store,
            declarations,
            paths,
            stop_timeout,
            backoff_tokens: StdMutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn declarations(&self) -> &Arc<Declarations> {
        &self.declarations
    }

    /// Spawn the profile's command and return the `Starting` record without
    /// waiting for the process to come up.
    pub async fn start(&self, agent_id: &str, label: &str) -> Result<ProcessRecord> {
        let key = ProfileKey::new(agent_id, label);
        let catalog = self.declarations.current();
        let profile = catalog
            .profile(&key)
            .cloned()
            .ok_or_else(|| AgentvisorError::ProfileNotFound(key.clone()))?;
        let grace = Duration::from_secs(catalog.health_for(&key).grace_period_seconds);

        let cwd = self.paths.agent_dir(agent_id);
        let started_at = Utc::now();
        let log_path = spawn::log_path(&self.paths.logs_dir, &key, started_at);

        let claimed = self
            .store
            .mutate(|snap| {
                if let Some(existing) = snap.process(&key)
                    && holds_slot(existing, started_at)
                {
                    return Err(AgentvisorError::AlreadyRunning(key.clone()));
                }
                let record = ProcessRecord {
                    agent_id: key.agent_id.clone(),
                    label: key.label.clone(),
                    pid: None,
                    pgid: None,
                    start_time: started_at,
                    start_fingerprint: None,
                    status: ProcessStatus::Starting,
                    log_path: log_path.clone(),
                    command: profile.command.clone(),
                    cwd: cwd.clone(),
                    port: profile.port,
                    exit_code: None,
                    last_error: None,
                    stopped_at: None,
                    stop_reason: None,
                };
                snap.put_process(record.clone());
                Ok(record)
            })
            .await?;

        let spawned = spawn::spawn_profile(&profile, &cwd, &log_path)
            .and_then(|child| match child.id() {
                Some(pid) => Ok((child, pid)),
                None => Err(std::io::Error::other("child exited before its pid was read")),
            });
        let (child, pid) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                let reason = e.to_string();
                warn!(profile = %key, "Spawn failed: {}", reason);
                self.store
                    .mutate(|snap| {
                        if let Some(record) = snap.process_mut(&key) {
                            record.status = ProcessStatus::Stopped;
                            record.last_error = Some(reason.clone());
                            record.stopped_at = Some(Utc::now());
                            record.stop_reason = Some("spawn_failed".to_string());
                        }
                        Ok(())
                    })
                    .await?;
                return Err(AgentvisorError::SpawnFailed { key, reason });
            }
        };

        let (record, child) = self.record_spawn(&key, &claimed, pid, child).await?;

        tokio::spawn(watch_exit(
            self.store.clone(),
            key.clone(),
            pid,
            started_at,
            grace,
            child,
        ));

        // stopped while the spawn was in flight
        if record.status == ProcessStatus::Stopped {
            signal_and_wait(pid, pid, self.stop_timeout).await?;
        }

        info!(profile = %key, pid, "Started run profile");
        Ok(record)
    }

    /// Attach the new pid to the claimed record. If that write fails the
    /// child is killed, so no untracked process outlives the claim.
    async fn record_spawn(
        &self,
        key: &ProfileKey,
        claimed: &ProcessRecord,
        pid: u32,
        mut child: Child,
    ) -> Result<(ProcessRecord, Child)> {
        let fingerprint = platform::process_start_time(pid);
        let recorded = self
            .store
            .mutate(|snap| {
                if snap.process(key).is_none() {
                    snap.put_process(claimed.clone());
                }
                let record = snap
                    .process_mut(key)
                    .ok_or_else(|| AgentvisorError::ProfileNotFound(key.clone()))?;
                record.pid = Some(pid);
                record.pgid = Some(pid);
                record.start_fingerprint = fingerprint;
                Ok(record.clone())
            })
            .await;
        match recorded {
            Ok(record) => Ok((record, child)),
            Err(e) => {
                error!(profile = %key, pid, "Could not record spawned process, killing it: {}", e);
                if let Err(kill_err) = NativePlatform::kill_group(pid) {
                    warn!(profile = %key, pid, "Kill failed: {}", kill_err);
                }
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                Err(e)
            }
        }
    }

    /// Terminate the profile's process group and archive its record as
    /// `Stopped`. Stopping an already stopped profile is a no-op. Any pending
    /// restart backoff for the profile is cancelled.
    pub async fn stop(
        &self,
        agent_id: &str,
        label: &str,
        reason: &str,
    ) -> Result<Option<ProcessRecord>> {
        let key = ProfileKey::new(agent_id, label);
        self.cancel_backoff(&key);
        self.terminate(&key, reason).await
    }

    /// `stop` without touching the backoff token; used by the restart path.
    pub(crate) async fn terminate(
        &self,
        key: &ProfileKey,
        reason: &str,
    ) -> Result<Option<ProcessRecord>> {
        let now = Utc::now();
        let changed = self
            .store
            .mutate(|snap| {
                let Some(record) = snap.process_mut(key) else {
                    return Ok(None);
                };
                if record.status == ProcessStatus::Stopped {
                    return Ok(None);
                }
                record.status = ProcessStatus::Stopped;
                record.stopped_at = Some(now);
                record.stop_reason = Some(reason.to_string());
                Ok(Some(record.clone()))
            })
            .await?;

        let Some(record) = changed else {
            return self.status(&key.agent_id, &key.label).await;
        };

        // a gone leader with a live group means orphaned children remain
        if let (Some(pid), Some(pgid)) = (record.pid, record.pgid)
            && (record_alive(&record)
                || (!platform::process_alive(pid) && NativePlatform::group_alive(pgid)))
        {
            signal_and_wait(pid, pgid, self.stop_timeout).await?;
        }
        info!(profile = %key, reason, "Stopped run profile");
        Ok(Some(record))
    }

    pub async fn status(&self, agent_id: &str, label: &str) -> Result<Option<ProcessRecord>> {
        let snap = self.store.load().await?;
        Ok(snap.process(&ProfileKey::new(agent_id, label)).cloned())
    }

    pub async fn list(&self) -> Result<Vec<ProcessRecord>> {
        let snap = self.store.load().await?;
        Ok(snap.processes.into_values().collect())
    }

    pub fn is_alive(&self, record: &ProcessRecord) -> bool {
        record_alive(record)
    }

    /// Compare persisted live records against the OS: re-adopt the ones
    /// still running, mark the rest `Crashed`.
    pub async fn reconcile_on_boot(&self) -> Result<ReconcileReport> {
        let report = self
            .store
            .mutate(|snap| {
                let mut report = ReconcileReport::default();
                for record in snap.processes.values_mut() {
                    if !record.status.is_live() {
                        continue;
                    }
                    if record_alive(record) {
                        report.adopted.push(record.key());
                    } else {
                        record.status = ProcessStatus::Crashed;
                        record.last_error =
                            Some("process was not running when the supervisor booted".to_string());
                        report.crashed.push(record.key());
                    }
                }
                Ok(report)
            })
            .await?;
        info!(
            adopted = report.adopted.len(),
            crashed = report.crashed.len(),
            "Reconciled process records"
        );
        Ok(report)
    }

    /// `Starting -> Running` once the grace period passed with the pid alive.
    pub(crate) async fn mark_running(&self, key: &ProfileKey, pid: u32) -> Result<bool> {
        self.store
            .mutate(|snap| match snap.process_mut(key) {
                Some(record)
                    if record.pid == Some(pid) && record.status == ProcessStatus::Starting =>
                {
                    record.status = ProcessStatus::Running;
                    Ok(true)
                }
                _ => Ok(false),
            })
            .await
    }

    /// Record that an adopted process (one without a waiter) has gone away.
    pub(crate) async fn mark_exited(&self, key: &ProfileKey, pid: u32) -> Result<bool> {
        self.store
            .mutate(|snap| match snap.process_mut(key) {
                Some(record) if record.pid == Some(pid) && record.status.is_live() => {
                    record.status = ProcessStatus::Crashed;
                    record.last_error = Some("process exited".to_string());
                    Ok(true)
                }
                _ => Ok(false),
            })
            .await
    }

    /// Token guarding the profile's pending restart backoff.
    pub(crate) fn backoff_token(&self, key: &ProfileKey) -> CancellationToken {
        let mut tokens = self
            .backoff_tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let token = tokens.entry(key.clone()).or_default();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }

    fn cancel_backoff(&self, key: &ProfileKey) {
        let mut tokens = self
            .backoff_tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(token) = tokens.remove(key) {
            token.cancel();
        }
    }
}

fn holds_slot(record: &ProcessRecord, now: DateTime<Utc>) -> bool {
    if !record.status.is_live() {
        return false;
    }
    match record.pid {
        Some(_) => record_alive(record),
        None => (now - record.start_time).num_seconds() < CLAIM_TIMEOUT_SECS,
    }
}

/// Liveness plus start-time fingerprint. Best effort against pid reuse.
fn record_alive(record: &ProcessRecord) -> bool {
    let Some(pid) = record.pid else {
        return false;
    };
    let Some(facts) = platform::inspect_process(pid) else {
        return false;
    };
    if facts.zombie {
        return false;
    }
    match record.start_fingerprint {
        Some(recorded) => facts.start_time.abs_diff(recorded) <= FINGERPRINT_TOLERANCE_SECS,
        None => true,
    }
}

/// SIGTERM the group, wait for every member to go, then SIGKILL whatever is
/// left. A shell leader exiting does not end the wait while children
/// that ignore SIGTERM remain in its group.
async fn signal_and_wait(pid: u32, pgid: u32, timeout: Duration) -> Result<()> {
    let lingering = || platform::process_alive(pid) || NativePlatform::group_alive(pgid);
    NativePlatform::terminate_group(pgid)?;
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !lingering() {
            return Ok(());
        }
        tokio::time::sleep(STOP_POLL).await;
    }
    if lingering() {
        warn!(pid, pgid, "Process group ignored SIGTERM, killing it");
        NativePlatform::kill_group(pgid)?;
    }
    Ok(())
}

/// Reap the child and record how it ended.
async fn watch_exit(
    store: Arc<StateStore>,
    key: ProfileKey,
    pid: u32,
    started_at: DateTime<Utc>,
    grace: Duration,
    mut child: Child,
) {
    let status = match child.wait().await {
        Ok(status) => status,
        Err(e) => {
            error!(profile = %key, pid, "Failed to wait on child: {}", e);
            return;
        }
    };
    let code = status.code();
    let early = (Utc::now() - started_at)
        .to_std()
        .map(|elapsed| elapsed < grace)
        .unwrap_or(true);

    let result = store
        .mutate(|snap| {
            let Some(record) = snap.process_mut(&key) else {
                return Ok(None);
            };
            if record.pid != Some(pid) {
                return Ok(None);
            }
            record.exit_code = code;
            if !record.status.is_live() {
                return Ok(None);
            }
            match code {
                Some(c @ (126 | 127)) if early => {
                    record.status = ProcessStatus::Stopped;
                    record.stopped_at = Some(Utc::now());
                    record.stop_reason = Some("spawn_failed".to_string());
                    record.last_error = Some(format!(
                        "command could not be executed (exit code {c}); check the profile command"
                    ));
                }
                Some(0) => {
                    record.status = ProcessStatus::Stopped;
                    record.stopped_at = Some(Utc::now());
                    record.stop_reason = Some(EXITED_REASON.to_string());
                    record.last_error = None;
                }
                Some(c) => {
                    record.status = ProcessStatus::Crashed;
                    record.last_error = Some(format!("exited with code {c}"));
                }
                None => {
                    record.status = ProcessStatus::Crashed;
                    record.last_error = Some("terminated by a signal".to_string());
                }
            }
            Ok(Some(record.status))
        })
        .await;

    match result {
        Ok(Some(ProcessStatus::Stopped)) if code == Some(0) => {
            info!(profile = %key, pid, "Supervised process finished")
        }
        Ok(Some(status)) => warn!(
            profile = %key,
            pid,
            exit_code = ?code,
            status = status.as_str(),
            "Supervised process exited"
        ),
        Ok(None) => {}
        Err(e) => error!(profile = %key, pid, "Failed to record process exit: {}", e),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::profile::Catalog;
    use crate::core::test_support::{Fixture, profile, wait_for, wait_for_status};
    use proptest::prelude::*;

    fn sleeper() -> Fixture {
        let mut catalog = Catalog::default();
        catalog.put_profile(profile("news", "web", "sleep 30"));
        catalog.put_profile(profile("news", "missing", "definitely-not-a-command-xyz"));
        catalog.put_profile(profile("news", "exit3", "sleep 0.2; exit 3"));
        Fixture::new(catalog)
    }

    #[tokio::test]
    async fn unknown_profile_is_rejected() {
        let fx = sleeper();
        let err = fx.supervisor.start("news", "nope").await.unwrap_err();
        assert!(matches!(err, AgentvisorError::ProfileNotFound(_)));
        assert!(fx.store.load().await.unwrap().processes.is_empty());
    }

    #[tokio::test]
    async fn second_start_is_already_running_and_stop_is_idempotent() {
        let fx = sleeper();
        let record = fx.supervisor.start("news", "web").await.unwrap();
        assert_eq!(record.status, ProcessStatus::Starting);
        let pid = record.pid.unwrap();
        assert!(platform::process_alive(pid));

        let err = fx.supervisor.start("news", "web").await.unwrap_err();
        assert!(matches!(err, AgentvisorError::AlreadyRunning(_)));

        let stopped = fx.supervisor.stop("news", "web", "operator").await.unwrap();
        assert_eq!(stopped.unwrap().status, ProcessStatus::Stopped);
        assert!(wait_for(Duration::from_secs(5), || async move { !platform::process_alive(pid) }).await);

        let again = fx.supervisor.stop("news", "web", "operator").await.unwrap();
        let again = again.unwrap();
        assert_eq!(again.status, ProcessStatus::Stopped);
        assert_eq!(again.stop_reason.as_deref(), Some("operator"));
    }

    #[tokio::test]
    async fn stop_kills_children_that_outlive_the_shell() {
        let mut catalog = Catalog::default();
        catalog.put_profile(profile(
            "news",
            "stubborn",
            r#"sh -c 'trap "" TERM; while :; do sleep 0.1; done'; echo done"#,
        ));
        let fx = Fixture::new(catalog);
        let record = fx.supervisor.start("news", "stubborn").await.unwrap();
        let pgid = record.pgid.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let stopped = fx.supervisor.stop("news", "stubborn", "operator").await.unwrap();
        assert_eq!(stopped.unwrap().status, ProcessStatus::Stopped);
        assert!(
            wait_for(Duration::from_secs(5), || async move {
                !NativePlatform::group_alive(pgid)
            })
            .await,
            "group {pgid} still has members after stop"
        );
    }

    #[tokio::test]
    async fn unrecordable_spawn_is_killed() {
        let fx = sleeper();
        let key = ProfileKey::new("news", "web");
        let catalog = fx.declarations.current();
        let web = catalog.profile(&key).unwrap().clone();
        let cwd = fx.paths.agent_dir("news");
        let log = spawn::log_path(&fx.paths.logs_dir, &key, Utc::now());
        let claimed = fx.supervisor.start("news", "web").await.unwrap();
        fx.supervisor.stop("news", "web", "test").await.unwrap();

        let child = spawn::spawn_profile(&web, &cwd, &log).unwrap();
        let pid = child.id().unwrap();
        std::fs::write(fx.store.state_path(), b"{ truncated").unwrap();

        let err = fx
            .supervisor
            .record_spawn(&key, &claimed, pid, child)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentvisorError::StateCorrupt { .. }));
        assert!(
            wait_for(Duration::from_secs(5), || async move {
                !NativePlatform::group_alive(pid)
            })
            .await
        );
    }

    #[tokio::test]
    async fn stopping_an_unknown_profile_is_a_noop() {
        let fx = sleeper();
        assert!(fx.supervisor.stop("news", "web", "operator").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn command_not_found_is_reported_as_spawn_failure() {
        let fx = sleeper();
        fx.supervisor.start("news", "missing").await.unwrap();
        let key = ProfileKey::new("news", "missing");
        assert!(wait_for_status(&fx.store, &key, ProcessStatus::Stopped).await);
        let record = fx.supervisor.status("news", "missing").await.unwrap().unwrap();
        assert_eq!(record.exit_code, Some(127));
        assert!(record.last_error.unwrap().contains("127"));
    }

    #[tokio::test]
    async fn crash_records_exit_code() {
        let fx = sleeper();
        fx.supervisor.start("news", "exit3").await.unwrap();
        let key = ProfileKey::new("news", "exit3");
        assert!(wait_for_status(&fx.store, &key, ProcessStatus::Crashed).await);
        let record = fx.supervisor.status("news", "exit3").await.unwrap().unwrap();
        assert_eq!(record.exit_code, Some(3));
    }

    #[tokio::test]
    async fn clean_exit_is_a_stop_not_a_crash() {
        let mut catalog = Catalog::default();
        catalog.put_profile(profile("news", "digest", "echo digest done"));
        let fx = Fixture::new(catalog);
        fx.supervisor.start("news", "digest").await.unwrap();
        let key = ProfileKey::new("news", "digest");
        assert!(wait_for_status(&fx.store, &key, ProcessStatus::Stopped).await);
        let record = fx.supervisor.status("news", "digest").await.unwrap().unwrap();
        assert_eq!(record.exit_code, Some(0));
        assert!(record.exited_cleanly());
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn reconcile_readopts_live_and_crashes_dead_records() {
        let fx = sleeper();
        let live = fx.supervisor.start("news", "web").await.unwrap();

        fx.store
            .mutate(|snap| {
                let mut dead = live.clone();
                dead.label = "ghost".into();
                dead.pid = Some(999_999_999);
                dead.pgid = Some(999_999_999);
                snap.put_process(dead);

                let mut reused = live.clone();
                reused.label = "reused".into();
                reused.pid = Some(std::process::id());
                reused.start_fingerprint = Some(1);
                reused.status = ProcessStatus::Running;
                snap.put_process(reused);
                Ok(())
            })
            .await
            .unwrap();

        // a fresh supervisor over the same files, as after a daemon restart
        let rebooted = fx.reboot();
        let report = rebooted.reconcile_on_boot().await.unwrap();
        assert_eq!(report.adopted, vec![ProfileKey::new("news", "web")]);
        assert_eq!(report.crashed.len(), 2);

        let snap = fx.store.load().await.unwrap();
        assert_eq!(
            snap.process(&ProfileKey::new("news", "web")).unwrap().status,
            ProcessStatus::Starting
        );
        assert_eq!(
            snap.process(&ProfileKey::new("news", "ghost")).unwrap().status,
            ProcessStatus::Crashed
        );
        assert_eq!(
            snap.process(&ProfileKey::new("news", "reused")).unwrap().status,
            ProcessStatus::Crashed
        );
        assert_eq!(snap.live_count(&ProfileKey::new("news", "web")), 1);

        rebooted.stop("news", "web", "test").await.unwrap();
    }

    #[tokio::test]
    async fn stop_cancels_pending_backoff() {
        let fx = sleeper();
        let key = ProfileKey::new("news", "web");
        let token = fx.supervisor.backoff_token(&key);
        fx.supervisor.stop("news", "web", "operator").await.unwrap();
        assert!(token.is_cancelled());
        assert!(!fx.supervisor.backoff_token(&key).is_cancelled());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(6))]

        #[test]
        fn concurrent_starts_claim_one_slot(attempts in 2usize..8) {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async {
                let fx = sleeper();
                let mut tasks = Vec::new();
                for _ in 0..attempts {
                    let supervisor = fx.supervisor.clone();
                    tasks.push(tokio::spawn(async move {
                        supervisor.start("news", "web").await
                    }));
                }
                let mut started = 0;
                for task in tasks {
                    match task.await.unwrap() {
                        Ok(_) => started += 1,
                        Err(e) => assert!(matches!(e, AgentvisorError::AlreadyRunning(_))),
                    }
                }
                assert_eq!(started, 1);
                let snap = fx.store.load().await.unwrap();
                assert_eq!(snap.live_count(&ProfileKey::new("news", "web")), 1);
                fx.supervisor.stop("news", "web", "test").await.unwrap();
            });
        }
    }
}

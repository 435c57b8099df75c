//! Trigger engine: clock-driven schedules and file watches.

mod cron;
mod schedule;
mod watch;

use schedule::{Schedule, truncate_to_minute};
use watch::FileWatches;

use anyhow::Result as AnyResult;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use tokio_cron_scheduler::Job;
use tracing::{debug, error, info, warn};

use crate::core::dispatcher::{Dispatcher, FireContext, Outcome};
use crate::core::lifecycle::LifecycleComponent;
use crate::core::profile::TriggerConfig;
use crate::core::state::FireSource;

/// Every minute at second 0.
pub const TICK_CRON: &str = "0 * * * * *";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firing {
    pub trigger_id: String,
    pub due_time: DateTime<Utc>,
    pub outcome: Outcome,
}

pub struct TriggerEngine {
    dispatcher: Arc<Dispatcher>,
    tz: Tz,
    watches: StdMutex<FileWatches>,
    warned: StdMutex<HashSet<String>>,
}

impl TriggerEngine {
    pub fn new(dispatcher: Arc<Dispatcher>, tz: Tz) -> Self {
        let watches = FileWatches::new(dispatcher.clone());
        Self {
            dispatcher,
            tz,
            watches: StdMutex::new(watches),
            warned: StdMutex::new(HashSet::new()),
        }
    }

    /// Evaluate every schedule trigger against `now` and dispatch the due
    /// ones. A trigger fires at most once per due time.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<Firing> {
        let catalog = self.dispatcher.supervisor().declarations().reload();
        self.sync_watches_with(&catalog);

        let mut firings = Vec::new();
        for trigger in catalog.triggers() {
            if !trigger.kind.is_schedule() {
                continue;
            }
            if !trigger.enabled {
                self.warn_once(&trigger.trigger_id, "trigger is disabled, skipping");
                continue;
            }
            let schedule = match Schedule::for_trigger(trigger) {
                Ok(Some(schedule)) => schedule,
                Ok(None) => continue,
                Err(e) => {
                    self.warn_once(&trigger.trigger_id, &e.to_string());
                    continue;
                }
            };
            let Some(due) = schedule.latest_due(now, self.tz) else {
                continue;
            };
            match self.claim(trigger, due, now).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(trigger_id = %trigger.trigger_id, "Failed to claim due time: {}", e);
                    continue;
                }
            }

            let ctx = FireContext::new(FireSource::Schedule).with_due(due);
            match self.dispatcher.fire(trigger, ctx).await {
                Ok(outcome) => firings.push(Firing {
                    trigger_id: trigger.trigger_id.clone(),
                    due_time: due,
                    outcome,
                }),
                Err(e) => error!(trigger_id = %trigger.trigger_id, "Dispatch failed: {}", e),
            }
        }
        firings
    }

    /// Advance the trigger's cursor to `due`, arming it on first sight.
    /// Returns false when `due` was already handled or predates arming.
    async fn claim(
        &self,
        trigger: &TriggerConfig,
        due: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> crate::core::error::Result<bool> {
        self.dispatcher
            .supervisor()
            .store()
            .mutate(|snap| {
                let cursor = snap.cursor_mut(&trigger.trigger_id);
                let armed_at = *cursor.armed_at.get_or_insert(truncate_to_minute(now));
                if due < armed_at || cursor.last_due.is_some_and(|last| due <= last) {
                    return Ok(false);
                }
                cursor.last_due = Some(due);
                Ok(true)
            })
            .await
    }

    pub fn sync_watches(&self) {
        let catalog = self.dispatcher.supervisor().declarations().current();
        self.sync_watches_with(&catalog);
    }

    fn sync_watches_with(&self, catalog: &crate::core::profile::Catalog) {
        match self.watches.lock() {
            Ok(mut watches) => watches.sync(catalog),
            Err(poisoned) => poisoned.into_inner().sync(catalog),
        }
    }

    pub fn stop_watches(&self) {
        match self.watches.lock() {
            Ok(mut watches) => watches.stop(),
            Err(poisoned) => poisoned.into_inner().stop(),
        }
    }

    fn warn_once(&self, trigger_id: &str, message: &str) {
        let mut warned = self
            .warned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if warned.insert(format!("{trigger_id}:{message}")) {
            warn!(trigger_id, "{}", message);
        } else {
            debug!(trigger_id, "{}", message);
        }
    }

    /// Scheduler job that runs `tick` at the top of every minute.
    pub fn minute_job(self: &Arc<Self>) -> AnyResult<Job> {
        let engine = self.clone();
        let job = Job::new_async(TICK_CRON, move |_uuid, mut _l| {
            let engine = engine.clone();
            Box::pin(async move {
                let firings = engine.tick(Utc::now()).await;
                if !firings.is_empty() {
                    info!(count = firings.len(), "Trigger tick dispatched");
                }
            })
        })?;
        Ok(job)
    }
}

/// Lifecycle wrapper: establishes file watches on start, drops them on
/// shutdown. The minute tick is registered on the lifecycle scheduler.
pub struct TriggerService {
    engine: Arc<TriggerEngine>,
}

impl TriggerService {
    pub fn new(engine: Arc<TriggerEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for TriggerService {
    async fn on_init(&mut self) -> AnyResult<()> {
        info!("Trigger engine initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> AnyResult<()> {
        self.engine.sync_watches();
        Ok(())
    }

    async fn on_shutdown(&mut self) -> AnyResult<()> {
        info!("Trigger engine shutting down...");
        self.engine.stop_watches();
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::profile::{Catalog, TriggerKind};
    use crate::core::state::HistoryOutcome;
    use crate::core::test_support::{Fixture, profile};
    use chrono::TimeZone;

    fn schedule_trigger(id: &str, kind: TriggerKind, expr: &str) -> TriggerConfig {
        TriggerConfig {
            trigger_id: id.into(),
            agent_id: "news".into(),
            profile_label: "job".into(),
            kind,
            schedule_expr: Some(expr.into()),
            watch_path: None,
            webhook_secret: None,
            enabled: true,
            cooldown_seconds: 0,
            debounce_seconds: 2,
            recursive: false,
            event_filter: None,
        }
    }

    fn engine_with(triggers: Vec<TriggerConfig>) -> (Fixture, TriggerEngine) {
        let mut catalog = Catalog::default();
        catalog.put_profile(profile("news", "job", "true"));
        for trigger in triggers {
            catalog.put_trigger(trigger);
        }
        let fx = Fixture::new(catalog);
        let dispatcher = Arc::new(Dispatcher::new(fx.supervisor.clone()));
        let engine = TriggerEngine::new(dispatcher, chrono_tz::UTC);
        (fx, engine)
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[tokio::test]
    async fn every_five_minutes_fires_on_multiples_of_five() {
        let (_fx, engine) = engine_with(vec![schedule_trigger(
            "five",
            TriggerKind::Cron,
            "*/5 * * * *",
        )]);
        let mut fired = Vec::new();
        for minute in 0..=10 {
            for firing in engine.tick(at(10, minute, 0)).await {
                fired.push(firing.due_time);
            }
        }
        assert_eq!(fired, vec![at(10, 0, 0), at(10, 5, 0), at(10, 10, 0)]);
    }

    #[tokio::test]
    async fn same_hourly_boundary_fires_once() {
        let (fx, engine) = engine_with(vec![schedule_trigger("hourly", TriggerKind::Hourly, "00")]);
        assert_eq!(engine.tick(at(10, 0, 5)).await.len(), 1);
        assert!(engine.tick(at(10, 0, 40)).await.is_empty());
        assert!(engine.tick(at(10, 30, 0)).await.is_empty());

        let history = fx.store.history(Some("hourly")).await.unwrap();
        let decisive = history
            .iter()
            .filter(|e| matches!(e.outcome, HistoryOutcome::Started | HistoryOutcome::Failed))
            .count();
        assert_eq!(decisive, 1);
        assert_eq!(history[0].due_time, Some(at(10, 0, 0)));
        assert_eq!(history[0].source, FireSource::Schedule);
    }

    #[tokio::test]
    async fn boundaries_before_arming_never_fire() {
        let (_fx, engine) = engine_with(vec![schedule_trigger("hourly", TriggerKind::Hourly, "00")]);
        assert!(engine.tick(at(10, 3, 0)).await.is_empty());
        let next = engine.tick(at(11, 0, 0)).await;
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].due_time, at(11, 0, 0));
    }

    #[tokio::test]
    async fn downtime_fires_the_latest_missed_boundary_once() {
        let (_fx, engine) = engine_with(vec![schedule_trigger("hourly", TriggerKind::Hourly, "00")]);
        assert_eq!(engine.tick(at(10, 0, 0)).await.len(), 1);
        // nothing ticks between 10:01 and 13:20
        let caught_up = engine.tick(at(13, 20, 0)).await;
        assert_eq!(caught_up.len(), 1);
        assert_eq!(caught_up[0].due_time, at(13, 0, 0));
        assert!(engine.tick(at(13, 21, 0)).await.is_empty());
    }

    #[tokio::test]
    async fn bad_and_disabled_triggers_do_not_abort_the_tick() {
        let mut disabled = schedule_trigger("off", TriggerKind::Hourly, "00");
        disabled.enabled = false;
        let (_fx, engine) = engine_with(vec![
            schedule_trigger("broken", TriggerKind::Cron, "not a cron"),
            disabled,
            schedule_trigger("good", TriggerKind::Daily, "10:00"),
        ]);
        let firings = engine.tick(at(10, 0, 0)).await;
        let ids: Vec<_> = firings.iter().map(|f| f.trigger_id.as_str()).collect();
        assert_eq!(ids, vec!["good"]);
    }

    #[tokio::test]
    async fn webhook_triggers_are_not_clock_driven() {
        let (_fx, engine) = engine_with(vec![schedule_trigger("hook", TriggerKind::Webhook, "")]);
        assert!(engine.tick(at(10, 0, 0)).await.is_empty());
    }
}

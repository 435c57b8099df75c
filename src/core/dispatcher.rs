//! Automation dispatcher: the single path from a trigger firing to a
//! supervisor start, with cooldown and history bookkeeping.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::error::{AgentvisorError, Result};
use crate::core::profile::TriggerConfig;
use crate::core::state::{FireSource, HistoryOutcome, ProfileKey, TriggerHistoryEntry};
use crate::core::supervisor::Supervisor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Started { pid: Option<u32> },
    AlreadyRunning,
    Cooldown { remaining_seconds: i64 },
    Failed(String),
}

impl Outcome {
    pub fn history_outcome(&self) -> HistoryOutcome {
        match self {
            Outcome::Started { .. } => HistoryOutcome::Started,
            Outcome::AlreadyRunning => HistoryOutcome::SkippedAlreadyRunning,
            Outcome::Cooldown { .. } => HistoryOutcome::SkippedCooldown,
            Outcome::Failed(_) => HistoryOutcome::Failed,
        }
    }

    fn detail(&self) -> String {
        match self {
            Outcome::Started { pid: Some(pid) } => format!("pid {pid}"),
            Outcome::Started { pid: None } => String::new(),
            Outcome::AlreadyRunning => "profile already running".to_string(),
            Outcome::Cooldown { remaining_seconds } => {
                format!("cooldown active, {remaining_seconds}s remaining")
            }
            Outcome::Failed(reason) => reason.clone(),
        }
    }
}

/// Where a firing came from and what it was for.
#[derive(Debug, Clone)]
pub struct FireContext {
    pub source: FireSource,
    pub due_time: Option<DateTime<Utc>>,
    pub detail: Option<String>,
}

impl FireContext {
    pub fn new(source: FireSource) -> Self {
        Self {
            source,
            due_time: None,
            detail: None,
        }
    }

    pub fn with_due(mut self, due: DateTime<Utc>) -> Self {
        self.due_time = Some(due);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub struct Dispatcher {
    supervisor: Arc<Supervisor>,
}

impl Dispatcher {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Apply the trigger's cooldown, then invoke its profile.
    pub async fn fire(&self, trigger: &TriggerConfig, ctx: FireContext) -> Result<Outcome> {
        let now = Utc::now();
        let cooldown = chrono::Duration::seconds(trigger.cooldown_seconds as i64);
        let claim = self
            .supervisor
            .store()
            .mutate(|snap| {
                let cursor = snap.cursor_mut(&trigger.trigger_id);
                if trigger.cooldown_seconds > 0
                    && let Some(last) = cursor.last_fired_at
                    && now - last < cooldown
                {
                    return Err(AgentvisorError::CooldownActive {
                        trigger_id: trigger.trigger_id.clone(),
                        remaining_seconds: (cooldown - (now - last)).num_seconds().max(1),
                    });
                }
                cursor.last_fired_at = Some(now);
                Ok(())
            })
            .await;

        match claim {
            Ok(()) => self.invoke_with(trigger, &ctx).await,
            Err(AgentvisorError::CooldownActive {
                remaining_seconds, ..
            }) => {
                let outcome = Outcome::Cooldown { remaining_seconds };
                info!(trigger_id = %trigger.trigger_id, remaining_seconds, "Trigger cooling down");
                self.record(&trigger.trigger_id, &ctx, &outcome).await?;
                Ok(outcome)
            }
            Err(e) => Err(e),
        }
    }

    /// Start the profile unless it is already running, and record the result.
    pub async fn invoke(
        &self,
        trigger_id: &str,
        agent_id: &str,
        profile_label: &str,
        ctx: &FireContext,
    ) -> Result<Outcome> {
        let key = ProfileKey::new(agent_id, profile_label);
        let outcome = match self.supervisor.status(agent_id, profile_label).await? {
            Some(record) if record.status.is_live() && self.supervisor.is_alive(&record) => {
                Outcome::AlreadyRunning
            }
            _ => match self.supervisor.start(agent_id, profile_label).await {
                Ok(record) => Outcome::Started { pid: record.pid },
                Err(AgentvisorError::AlreadyRunning(_)) => Outcome::AlreadyRunning,
                Err(e @ AgentvisorError::StateCorrupt { .. }) => return Err(e),
                Err(e) => Outcome::Failed(e.to_string()),
            },
        };

        match &outcome {
            Outcome::Started { pid } => {
                info!(trigger_id, profile = %key, pid = ?pid, "Trigger started profile")
            }
            Outcome::Failed(reason) => {
                warn!(trigger_id, profile = %key, "Trigger failed: {}", reason)
            }
            _ => info!(trigger_id, profile = %key, "Profile already running, skipping"),
        }
        self.record(trigger_id, ctx, &outcome).await?;
        Ok(outcome)
    }

    async fn invoke_with(&self, trigger: &TriggerConfig, ctx: &FireContext) -> Result<Outcome> {
        self.invoke(
            &trigger.trigger_id,
            &trigger.agent_id,
            &trigger.profile_label,
            ctx,
        )
        .await
    }

    /// Manual firing by id, regardless of kind or `enabled`.
    pub async fn fire_by_id(&self, trigger_id: &str, ctx: FireContext) -> Result<Outcome> {
        let catalog = self.supervisor.declarations().current();
        let trigger = catalog
            .trigger(trigger_id)
            .cloned()
            .ok_or_else(|| AgentvisorError::TriggerNotFound(trigger_id.to_string()))?;
        self.fire(&trigger, ctx).await
    }

    async fn record(&self, trigger_id: &str, ctx: &FireContext, outcome: &Outcome) -> Result<()> {
        let mut detail = outcome.detail();
        if let Some(extra) = &ctx.detail {
            if !detail.is_empty() {
                detail.push_str("; ");
            }
            detail.push_str(extra);
        }
        self.supervisor
            .store()
            .append_history(TriggerHistoryEntry {
                id: uuid::Uuid::new_v4(),
                trigger_id: trigger_id.to_string(),
                fired_at: Utc::now(),
                due_time: ctx.due_time,
                outcome: outcome.history_outcome(),
                source: ctx.source,
                detail,
            })
            .await
    }
}

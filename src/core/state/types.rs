use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Identity of a run profile: `(agent_id, label)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProfileKey {
    pub agent_id: String,
    pub label: String,
}

impl ProfileKey {
    pub fn new(agent_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            label: label.into(),
        }
    }
}

impl fmt::Display for ProfileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent_id, self.label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Stopped,
    Starting,
    Running,
    Crashed,
}

impl ProcessStatus {
    pub fn is_live(self) -> bool {
        matches!(self, ProcessStatus::Starting | ProcessStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Crashed => "crashed",
        }
    }
}

/// Persisted bookkeeping for one run of a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub agent_id: String,
    pub label: String,
    /// `None` while the spawn slot is claimed but the child is not up yet.
    pub pid: Option<u32>,
    pub pgid: Option<u32>,
    pub start_time: DateTime<Utc>,
    /// OS-reported start time (epoch seconds) captured right after spawn.
    pub start_fingerprint: Option<u64>,
    pub status: ProcessStatus,
    pub log_path: PathBuf,
    pub command: String,
    pub cwd: PathBuf,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

/// `stop_reason` of a process that finished on its own with exit code 0.
pub const EXITED_REASON: &str = "exited";

impl ProcessRecord {
    pub fn key(&self) -> ProfileKey {
        ProfileKey::new(&self.agent_id, &self.label)
    }

    pub fn exited_cleanly(&self) -> bool {
        self.status == ProcessStatus::Stopped && self.stop_reason.as_deref() == Some(EXITED_REASON)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    Crashed,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Crashed => "crashed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthState {
    pub agent_id: String,
    pub label: String,
    #[serde(default)]
    pub status: HealthStatus,
    #[serde(default)]
    pub last_check_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_log_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub consecutive_restarts: u32,
    #[serde(default)]
    pub healthy_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub next_restart_at: Option<DateTime<Utc>>,
}

impl HealthState {
    pub fn new(key: &ProfileKey) -> Self {
        Self {
            agent_id: key.agent_id.clone(),
            label: key.label.clone(),
            status: HealthStatus::Unknown,
            last_check_time: None,
            last_log_time: None,
            restart_count: 0,
            consecutive_restarts: 0,
            healthy_since: None,
            last_error: None,
            next_restart_at: None,
        }
    }
}

/// Scheduling bookkeeping for one trigger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerCursor {
    /// Due times earlier than this were never observed and never fire.
    #[serde(default)]
    pub armed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_due: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_fired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub processes: BTreeMap<String, ProcessRecord>,
    #[serde(default)]
    pub health: BTreeMap<String, HealthState>,
    #[serde(default)]
    pub triggers: BTreeMap<String, TriggerCursor>,
}

impl Snapshot {
    pub fn process(&self, key: &ProfileKey) -> Option<&ProcessRecord> {
        self.processes.get(&key.to_string())
    }

    pub fn process_mut(&mut self, key: &ProfileKey) -> Option<&mut ProcessRecord> {
        self.processes.get_mut(&key.to_string())
    }

    pub fn put_process(&mut self, record: ProcessRecord) {
        self.processes.insert(record.key().to_string(), record);
    }

    pub fn health(&self, key: &ProfileKey) -> Option<&HealthState> {
        self.health.get(&key.to_string())
    }

    pub fn health_mut(&mut self, key: &ProfileKey) -> &mut HealthState {
        self.health
            .entry(key.to_string())
            .or_insert_with(|| HealthState::new(key))
    }

    pub fn cursor_mut(&mut self, trigger_id: &str) -> &mut TriggerCursor {
        self.triggers.entry(trigger_id.to_string()).or_default()
    }

    pub fn live_count(&self, key: &ProfileKey) -> usize {
        self.processes
            .values()
            .filter(|r| r.agent_id == key.agent_id && r.label == key.label && r.status.is_live())
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOutcome {
    Started,
    Failed,
    SkippedCooldown,
    SkippedAlreadyRunning,
}

impl HistoryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryOutcome::Started => "started",
            HistoryOutcome::Failed => "failed",
            HistoryOutcome::SkippedCooldown => "skipped_cooldown",
            HistoryOutcome::SkippedAlreadyRunning => "skipped_already_running",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FireSource {
    Schedule,
    FileEvent,
    Webhook,
    Manual,
}

impl FireSource {
    pub fn as_str(self) -> &'static str {
        match self {
            FireSource::Schedule => "schedule",
            FireSource::FileEvent => "file_event",
            FireSource::Webhook => "webhook",
            FireSource::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerHistoryEntry {
    pub id: uuid::Uuid,
    pub trigger_id: String,
    pub fired_at: DateTime<Utc>,
    #[serde(default)]
    pub due_time: Option<DateTime<Utc>>,
    pub outcome: HistoryOutcome,
    pub source: FireSource,
    #[serde(default)]
    pub detail: String,
}

use thiserror::Error;

use crate::core::state::ProfileKey;

pub type Result<T> = std::result::Result<T, AgentvisorError>;

#[derive(Debug, Error)]
pub enum AgentvisorError {
    #[error("run profile {0} is already running")]
    AlreadyRunning(ProfileKey),

    #[error("run profile {0} is not declared")]
    ProfileNotFound(ProfileKey),

    #[error("trigger '{0}' is not declared")]
    TriggerNotFound(String),

    #[error("persisted state at {path} is corrupt: {reason}")]
    StateCorrupt { path: String, reason: String },

    #[error("probe failed: {0}")]
    ProbeFailed(String),

    #[error("failed to spawn {key}: {reason}")]
    SpawnFailed { key: ProfileKey, reason: String },

    #[error("webhook signature verification failed")]
    Unauthorized,

    #[error("trigger '{trigger_id}' is cooling down ({remaining_seconds}s remaining)")]
    CooldownActive {
        trigger_id: String,
        remaining_seconds: i64,
    },

    #[error("invalid schedule '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl AgentvisorError {
    pub fn invalid_schedule(expr: &str, reason: impl Into<String>) -> Self {
        AgentvisorError::InvalidSchedule {
            expr: expr.to_string(),
            reason: reason.into(),
        }
    }
}

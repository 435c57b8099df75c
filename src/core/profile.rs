//! Operator-edited declarations: run profiles, health policies, triggers.
//!
//! All three documents live in the config directory and are re-read on
//! demand, so edits made by external tools take effect without restarting
//! the daemon.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::core::state::ProfileKey;

const PROFILES_FILE: &str = "agent_profiles.json";
const HEALTH_FILE: &str = "health.json";
const TRIGGERS_FILE: &str = "triggers.json";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunProfile {
    pub agent_id: String,
    pub label: String,
    pub command: String,
    pub port: Option<u16>,
}

impl RunProfile {
    pub fn key(&self) -> ProfileKey {
        ProfileKey::new(&self.agent_id, &self.label)
    }
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default, alias = "port")]
    streamlit_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Http,
    Command,
    Tcp,
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    None,
    #[serde(alias = "on_crash")]
    OnCrash,
    Always,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    pub agent_id: String,
    pub label: String,
    #[serde(default)]
    pub probe_kind: ProbeKind,
    #[serde(default)]
    pub probe_target: Option<String>,
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default = "default_grace")]
    pub grace_period_seconds: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,
}

fn default_interval() -> u64 {
    30
}
fn default_grace() -> u64 {
    10
}
fn default_probe_timeout() -> u64 {
    5
}

impl HealthConfig {
    /// Policy applied to a supervised profile with no health.json entry.
    pub fn fallback(key: &ProfileKey) -> Self {
        Self {
            agent_id: key.agent_id.clone(),
            label: key.label.clone(),
            probe_kind: ProbeKind::None,
            probe_target: None,
            interval_seconds: default_interval(),
            restart_policy: RestartPolicy::None,
            grace_period_seconds: default_grace(),
            probe_timeout_seconds: default_probe_timeout(),
        }
    }

    pub fn key(&self) -> ProfileKey {
        ProfileKey::new(&self.agent_id, &self.label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Hourly,
    Daily,
    Cron,
    FileEvent,
    Webhook,
}

impl TriggerKind {
    pub fn is_schedule(self) -> bool {
        matches!(self, TriggerKind::Hourly | TriggerKind::Daily | TriggerKind::Cron)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub trigger_id: String,
    pub agent_id: String,
    pub profile_label: String,
    pub kind: TriggerKind,
    #[serde(default)]
    pub schedule_expr: Option<String>,
    #[serde(default)]
    pub watch_path: Option<PathBuf>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub cooldown_seconds: u64,
    #[serde(default = "default_debounce")]
    pub debounce_seconds: u64,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub event_filter: Option<String>,
}

fn default_enabled() -> bool {
    true
}
fn default_debounce() -> u64 {
    2
}

impl TriggerConfig {
    pub fn secret(&self) -> Option<&str> {
        self.webhook_secret.as_deref().filter(|s| !s.is_empty())
    }
}

/// One consistent view of all three declaration documents.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    profiles: BTreeMap<ProfileKey, RunProfile>,
    health: HashMap<ProfileKey, HealthConfig>,
    triggers: BTreeMap<String, TriggerConfig>,
}

impl Catalog {
    pub fn load(config_dir: &Path) -> Self {
        let mut catalog = Catalog::default();

        if let Some(doc) = read_json::<BTreeMap<String, Vec<serde_json::Value>>>(
            &config_dir.join(PROFILES_FILE),
        ) {
            for (agent_id, entries) in doc {
                for value in entries {
                    match serde_json::from_value::<RawProfile>(value) {
                        Ok(RawProfile {
                            label: Some(label),
                            command: Some(command),
                            streamlit_port,
                        }) if !label.trim().is_empty() && !command.trim().is_empty() => {
                            catalog.put_profile(RunProfile {
                                agent_id: agent_id.clone(),
                                label,
                                command,
                                port: streamlit_port,
                            });
                        }
                        _ => warn!("Skipping incomplete run profile for agent '{}'", agent_id),
                    }
                }
            }
        }

        if let Some(values) = read_json::<Vec<serde_json::Value>>(&config_dir.join(HEALTH_FILE)) {
            for value in values {
                match serde_json::from_value::<HealthConfig>(value) {
                    Ok(config) => catalog.put_health(config),
                    Err(e) => warn!("Skipping invalid health entry: {}", e),
                }
            }
        }

        if let Some(values) = read_json::<Vec<serde_json::Value>>(&config_dir.join(TRIGGERS_FILE))
        {
            for value in values {
                match serde_json::from_value::<TriggerConfig>(value) {
                    Ok(trigger) => catalog.put_trigger(trigger),
                    Err(e) => warn!("Skipping invalid trigger entry: {}", e),
                }
            }
        }

        catalog
    }

    pub fn put_profile(&mut self, profile: RunProfile) {
        self.profiles.insert(profile.key(), profile);
    }

    pub fn put_health(&mut self, config: HealthConfig) {
        self.health.insert(config.key(), config);
    }

    pub fn put_trigger(&mut self, trigger: TriggerConfig) {
        if self.triggers.contains_key(&trigger.trigger_id) {
            warn!("Duplicate trigger id '{}', keeping the last one", trigger.trigger_id);
        }
        self.triggers.insert(trigger.trigger_id.clone(), trigger);
    }

    pub fn profile(&self, key: &ProfileKey) -> Option<&RunProfile> {
        self.profiles.get(key)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &RunProfile> {
        self.profiles.values()
    }

    /// Declared health policy, or the fallback for undeclared profiles.
    pub fn health_for(&self, key: &ProfileKey) -> HealthConfig {
        self.health
            .get(key)
            .cloned()
            .unwrap_or_else(|| HealthConfig::fallback(key))
    }

    pub fn trigger(&self, trigger_id: &str) -> Option<&TriggerConfig> {
        self.triggers.get(trigger_id)
    }

    pub fn triggers(&self) -> impl Iterator<Item = &TriggerConfig> {
        self.triggers.values()
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            return None;
        }
    };
    if raw.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(&raw) {
        Ok(doc) => Some(doc),
        Err(e) => {
            warn!("Ignoring malformed {}: {}", path.display(), e);
            None
        }
    }
}

/// Shared, reloadable handle to the current catalog.
pub struct Declarations {
    config_dir: Option<PathBuf>,
    current: RwLock<Arc<Catalog>>,
}

impl Declarations {
    pub fn load(config_dir: &Path) -> Self {
        Self {
            config_dir: Some(config_dir.to_path_buf()),
            current: RwLock::new(Arc::new(Catalog::load(config_dir))),
        }
    }

    /// Fixed catalog that `reload` leaves untouched.
    pub fn fixed(catalog: Catalog) -> Self {
        Self {
            config_dir: None,
            current: RwLock::new(Arc::new(catalog)),
        }
    }

    pub fn current(&self) -> Arc<Catalog> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn reload(&self) -> Arc<Catalog> {
        let Some(dir) = &self.config_dir else {
            return self.current();
        };
        let fresh = Arc::new(Catalog::load(dir));
        match self.current.write() {
            Ok(mut guard) => *guard = fresh.clone(),
            Err(poisoned) => *poisoned.into_inner() = fresh.clone(),
        }
        fresh
    }
}

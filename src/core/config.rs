use chrono_tz::Tz;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::core::error::{AgentvisorError, Result};

/// Overrides `agents_root` from settings.toml.
pub const AGENTS_ROOT_ENV: &str = "AGENTS_ROOT";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub agents_root: Option<PathBuf>,

    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_seconds: u64,

    #[serde(default)]
    pub webhook: WebhookSettings,

    #[serde(default)]
    pub restart: RestartSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSettings {
    #[serde(default = "default_webhook_host")]
    pub host: String,

    #[serde(default = "default_webhook_port")]
    pub port: u16,
}

/// Exponential backoff applied by the health monitor's restart path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RestartSettings {
    #[serde(default = "default_base_delay")]
    pub base_delay_seconds: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: u64,

    /// Healthy time after which `consecutive_restarts` resets.
    #[serde(default = "default_reset_after")]
    pub reset_after_seconds: u64,
}

fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_stop_timeout() -> u64 {
    5
}
fn default_webhook_host() -> String {
    "127.0.0.1".to_string()
}
fn default_webhook_port() -> u16 {
    17890
}
fn default_base_delay() -> u64 {
    1
}
fn default_max_delay() -> u64 {
    300
}
fn default_reset_after() -> u64 {
    300
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            agents_root: None,
            timezone: default_timezone(),
            stop_timeout_seconds: default_stop_timeout(),
            webhook: WebhookSettings::default(),
            restart: RestartSettings::default(),
        }
    }
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            host: default_webhook_host(),
            port: default_webhook_port(),
        }
    }
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            base_delay_seconds: default_base_delay(),
            max_delay_seconds: default_max_delay(),
            reset_after_seconds: default_reset_after(),
        }
    }
}

impl Settings {
    /// Read `settings.toml` from the config directory. A missing file yields
    /// defaults; a malformed one is an error.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join("settings.toml");
        if !path.exists() {
            info!("No settings.toml found, using defaults.");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        let settings: Settings = toml::from_str(&content)
            .map_err(|e| AgentvisorError::Config(format!("{}: {}", path.display(), e)))?;
        settings.timezone()?;
        Ok(settings)
    }

    pub fn timezone(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| AgentvisorError::Config(format!("unknown timezone '{}': {}", self.timezone, e)))
    }
}

/// Every on-disk location agentvisor reads or writes, derived from the data
/// directory.
#[derive(Debug, Clone)]
pub struct Paths {
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub run_dir: PathBuf,
    pub agents_root: PathBuf,
}

impl Paths {
    pub fn resolve(data_dir: &Path, settings: &Settings) -> Self {
        let agents_root = match std::env::var_os(AGENTS_ROOT_ENV) {
            Some(root) if !root.is_empty() => PathBuf::from(root),
            _ => settings
                .agents_root
                .clone()
                .unwrap_or_else(|| data_dir.join("agents")),
        };
        Self {
            data_dir: data_dir.to_path_buf(),
            config_dir: data_dir.join("config"),
            state_dir: data_dir.join("state"),
            logs_dir: data_dir.join("logs"),
            run_dir: data_dir.join("run"),
            agents_root,
        }
    }

    pub fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.agents_root.join(agent_id)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.run_dir.join("agentvisor.pid")
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.run_dir.join("agentvisor.log")
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [
            &self.config_dir,
            &self.state_dir,
            &self.logs_dir,
            &self.run_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings.timezone, "UTC");
        assert_eq!(settings.stop_timeout_seconds, 5);
        assert_eq!(settings.webhook.port, 17890);
        assert_eq!(settings.restart, RestartSettings::default());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("settings.toml"),
            r#"
timezone = "Europe/Berlin"

[restart]
max_delay_seconds = 60
"#,
        )
        .unwrap();
        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings.timezone().unwrap(), chrono_tz::Europe::Berlin);
        assert_eq!(settings.restart.base_delay_seconds, 1);
        assert_eq!(settings.restart.max_delay_seconds, 60);
        assert_eq!(settings.webhook.host, "127.0.0.1");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("settings.toml"), "timezone = [").unwrap();
        assert!(matches!(
            Settings::load(dir.path()),
            Err(AgentvisorError::Config(_))
        ));
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("settings.toml"), "timezone = \"Mars/Olympus\"").unwrap();
        assert!(Settings::load(dir.path()).is_err());
    }

    #[test]
    fn paths_hang_off_the_data_dir() {
        let settings = Settings {
            agents_root: Some(PathBuf::from("/srv/agents")),
            ..Settings::default()
        };
        let paths = Paths::resolve(Path::new("/var/lib/av"), &settings);
        assert_eq!(paths.state_dir, PathBuf::from("/var/lib/av/state"));
        assert_eq!(paths.pid_file(), PathBuf::from("/var/lib/av/run/agentvisor.pid"));
        if std::env::var_os(AGENTS_ROOT_ENV).is_none() {
            assert_eq!(paths.agent_dir("news"), PathBuf::from("/srv/agents/news"));
        }
    }
}

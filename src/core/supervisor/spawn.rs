use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Child;
use tracing::warn;

use crate::core::profile::RunProfile;
use crate::core::state::ProfileKey;
use crate::platform::{NativePlatform, Platform};

/// `<logs_dir>/<agent>_<label>_<YYYYmmddTHHMMSS>.log`
pub(crate) fn log_path(logs_dir: &Path, key: &ProfileKey, at: DateTime<Utc>) -> PathBuf {
    logs_dir.join(format!(
        "{}_{}_{}.log",
        file_safe(&key.agent_id),
        file_safe(&key.label),
        at.format("%Y%m%dT%H%M%S")
    ))
}

fn file_safe(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Launch the profile's command in its own process group, appending both
/// output streams to `log_path`.
pub(crate) fn spawn_profile(
    profile: &RunProfile,
    cwd: &Path,
    log_path: &Path,
) -> std::io::Result<Child> {
    if !cwd.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("agent directory {} does not exist", cwd.display()),
        ));
    }
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    NativePlatform::restrict_file_permissions(log_path);
    writeln!(
        log,
        "[agentvisor] {} starting {}/{}: {}",
        Utc::now().to_rfc3339(),
        profile.agent_id,
        profile.label,
        profile.command
    )?;

    let line = match NativePlatform::venv_activation(cwd) {
        Some(prefix) => format!("{prefix}{}", profile.command),
        None => profile.command.clone(),
    };

    let mut cmd = NativePlatform::shell_inline(&line);
    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .envs(agent_env(cwd));
    NativePlatform::isolate_process_group(&mut cmd);
    cmd.spawn()
}

/// Variables from `<agent_dir>/.env`, layered over the inherited environment.
fn agent_env(cwd: &Path) -> Vec<(String, String)> {
    let path = cwd.join(".env");
    if !path.is_file() {
        return Vec::new();
    }
    match dotenvy::from_path_iter(&path) {
        Ok(iter) => iter
            .filter_map(|item| match item {
                Ok(pair) => Some(pair),
                Err(e) => {
                    warn!("Skipping unreadable line in {}: {}", path.display(), e);
                    None
                }
            })
            .collect(),
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn log_names_carry_key_and_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let path = log_path(Path::new("/logs"), &ProfileKey::new("news bot", "ui"), at);
        assert_eq!(path, PathBuf::from("/logs/news-bot_ui_20240309T070501.log"));
    }

    #[test]
    fn dotenv_values_are_collected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "API_KEY=abc\n# comment\nMODE=\"prod\"\n").unwrap();
        let env = agent_env(dir.path());
        assert!(env.contains(&("API_KEY".to_string(), "abc".to_string())));
        assert!(env.contains(&("MODE".to_string(), "prod".to_string())));
    }

    #[test]
    fn missing_agent_dir_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let profile = RunProfile {
            agent_id: "ghost".into(),
            label: "main".into(),
            command: "true".into(),
            port: None,
        };
        let err = spawn_profile(&profile, &dir.path().join("ghost"), &dir.path().join("x.log"))
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}

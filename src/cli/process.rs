use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::{Paths, Settings};
use crate::core::dispatcher::{Dispatcher, FireContext, Outcome};
use crate::core::error::AgentvisorError;
use crate::core::profile::Declarations;
use crate::core::state::{
    FireSource, HealthState, HistoryOutcome, ProcessRecord, ProcessStatus, ProfileKey, StateStore,
};
use crate::core::supervisor::Supervisor;
use crate::core::terminal::{GuideSection, print_error, print_info, print_success, print_warn};
use crate::platform::{NativePlatform, Platform};

/// Everything a one-shot CLI command needs, built the same way the daemon
/// builds it. The store's directory lock keeps both sides consistent.
pub struct CliContext {
    pub store: Arc<StateStore>,
    pub supervisor: Arc<Supervisor>,
}

impl CliContext {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let settings = Settings::load(&data_dir.join("config"))?;
        let paths = Paths::resolve(data_dir, &settings);
        paths
            .ensure()
            .with_context(|| format!("creating {}", paths.data_dir.display()))?;
        NativePlatform::restrict_dir_permissions(&paths.data_dir);
        let store = Arc::new(StateStore::open(&paths.state_dir)?);
        let declarations = Arc::new(Declarations::load(&paths.config_dir));
        let supervisor = Arc::new(Supervisor::new(
            store.clone(),
            declarations,
            paths,
            Duration::from_secs(settings.stop_timeout_seconds),
        ));
        Ok(Self {
            store,
            supervisor,
        })
    }
}

fn status_label(status: ProcessStatus, alive: bool) -> String {
    let text = status.as_str().to_uppercase();
    match status {
        ProcessStatus::Running | ProcessStatus::Starting if alive => {
            style(text).green().bold().to_string()
        }
        ProcessStatus::Running | ProcessStatus::Starting => {
            format!("{} {}", style(text).yellow().bold(), style("(pid gone)").dim())
        }
        ProcessStatus::Crashed => style(text).red().bold().to_string(),
        ProcessStatus::Stopped => style(text).dim().to_string(),
    }
}

fn describe(record: &ProcessRecord, alive: bool) -> String {
    let mut parts = vec![status_label(record.status, alive)];
    if let Some(pid) = record.pid {
        parts.push(format!("pid {}", pid));
    }
    if let Some(port) = record.port {
        parts.push(format!("port {}", port));
    }
    if let Some(code) = record.exit_code {
        parts.push(format!("exit {}", code));
    }
    parts.join(", ")
}

pub async fn start_profile(ctx: &CliContext, agent: &str, label: &str) -> Result<()> {
    match ctx.supervisor.start(agent, label).await {
        Ok(record) => {
            GuideSection::new("Profile Started")
                .status("Profile", &record.key().to_string())
                .status("Status", &describe(&record, true))
                .status("Log", &record.log_path.display().to_string())
                .blank()
                .info(&format!(
                    "Run {} to follow its output.",
                    style(format!("{} logs {} {}", NativePlatform::binary_name(), agent, label))
                        .cyan()
                        .bold()
                ))
                .print();
            println!();
            Ok(())
        }
        Err(AgentvisorError::AlreadyRunning(key)) => {
            print_warn(&format!("{} is already running.", key));
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn stop_profile(ctx: &CliContext, agent: &str, label: &str) -> Result<()> {
    match ctx.supervisor.stop(agent, label, "stopped from cli").await? {
        Some(record) => {
            GuideSection::new("Profile Stopped")
                .status("Profile", &record.key().to_string())
                .status("Status", &describe(&record, false))
                .print();
            println!();
        }
        None => print_info(&format!(
            "{} has no process record.",
            ProfileKey::new(agent, label)
        )),
    }
    Ok(())
}

pub async fn show_status(ctx: &CliContext, agent: Option<&str>) -> Result<()> {
    let snapshot = ctx.store.load().await?;
    let records: Vec<&ProcessRecord> = snapshot
        .processes
        .values()
        .filter(|r| agent.is_none_or(|a| r.agent_id == a))
        .collect();

    let title = match agent {
        Some(agent) => format!("Status: {}", agent),
        None => "Status".to_string(),
    };
    let mut section = GuideSection::new(&title);
    if records.is_empty() {
        section = section.info("No process records.");
    }
    for record in &records {
        let alive = ctx.supervisor.is_alive(record);
        let key = record.key();
        section = section.status(&key.to_string(), &describe(record, alive));
        if let Some(health) = snapshot.health(&key) {
            section = section.text(&health_line(health));
        }
        if let Some(err) = &record.last_error {
            section = section.text(&format!("  {}", style(err).dim()));
        }
    }
    section.print();
    println!();
    Ok(())
}

fn health_line(health: &HealthState) -> String {
    let mut line = format!("  health {}", health.status.as_str());
    if health.restart_count > 0 {
        line.push_str(&format!(", {} restarts", health.restart_count));
    }
    if let Some(at) = health.last_check_time {
        line.push_str(&format!(", checked {}", at.format("%Y-%m-%d %H:%M:%S")));
    }
    if let Some(at) = health.next_restart_at {
        line.push_str(&format!(", restart at {}", at.format("%H:%M:%S")));
    }
    line
}

pub async fn follow_profile_logs(ctx: &CliContext, agent: &str, label: &str) -> Result<()> {
    let key = ProfileKey::new(agent, label);
    let Some(record) = ctx.store.load().await?.process(&key).cloned() else {
        print_error(&format!("{} has never been started.", key));
        return Ok(());
    };
    if !record.log_path.exists() {
        print_error(&format!(
            "Log file not found at {}",
            style(record.log_path.display()).dim()
        ));
        return Ok(());
    }
    GuideSection::new("Live Logs")
        .text(&format!(
            "Following {} - press {} to stop.",
            style(record.log_path.display()).cyan(),
            style("Ctrl+C").bold().yellow()
        ))
        .print();
    println!();
    let mut child = NativePlatform::tail_file(&record.log_path)?;
    let _ = child.wait()?;
    Ok(())
}

pub async fn show_history(ctx: &CliContext, trigger_id: Option<&str>, limit: usize) -> Result<()> {
    let history = ctx.store.history(trigger_id).await?;
    let mut section = GuideSection::new("Trigger History");
    if history.is_empty() {
        section = section.info("No trigger firings recorded.");
    }
    let skip = history.len().saturating_sub(limit);
    for entry in history.iter().skip(skip) {
        let outcome = match entry.outcome {
            HistoryOutcome::Started => style(entry.outcome.as_str()).green().to_string(),
            HistoryOutcome::Failed => style(entry.outcome.as_str()).red().to_string(),
            _ => style(entry.outcome.as_str()).yellow().to_string(),
        };
        let mut line = format!(
            "{}  {:<16} {:<24} {}",
            entry.fired_at.format("%Y-%m-%d %H:%M:%S"),
            entry.trigger_id,
            outcome,
            entry.source.as_str()
        );
        if !entry.detail.is_empty() {
            line.push_str(&format!("  {}", style(&entry.detail).dim()));
        }
        section = section.text(&line);
    }
    section.print();
    println!();
    Ok(())
}

pub async fn fire_trigger(ctx: &CliContext, trigger_id: &str) -> Result<()> {
    let dispatcher = Dispatcher::new(ctx.supervisor.clone());
    match dispatcher
        .fire_by_id(trigger_id, FireContext::new(FireSource::Manual))
        .await?
    {
        Outcome::Started { pid } => print_success(&format!(
            "Trigger '{}' started its profile{}",
            trigger_id,
            pid.map(|p| format!(" (pid {p})")).unwrap_or_default()
        )),
        Outcome::AlreadyRunning => {
            print_warn(&format!("Trigger '{}' skipped: profile already running", trigger_id))
        }
        Outcome::Cooldown { remaining_seconds } => print_warn(&format!(
            "Trigger '{}' skipped: cooldown, {}s remaining",
            trigger_id, remaining_seconds
        )),
        Outcome::Failed(reason) => {
            anyhow::bail!("Trigger '{}' failed: {}", trigger_id, reason)
        }
    }
    Ok(())
}

pub async fn restore_state(ctx: &CliContext) -> Result<()> {
    match ctx.store.load().await {
        Ok(_) => {
            print_info(&format!(
                "{} is readable; nothing to restore.",
                style(ctx.store.state_path().display()).dim()
            ));
            Ok(())
        }
        Err(AgentvisorError::StateCorrupt { reason, .. }) => {
            print_warn(&format!("State is corrupt: {}", reason));
            let restored = ctx.store.restore_last_good().await?;
            GuideSection::new("State Restored")
                .status("Records", &restored.processes.len().to_string())
                .status("Triggers", &restored.triggers.len().to_string())
                .status("Data", &ctx.store.dir().display().to_string())
                .print();
            println!();
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

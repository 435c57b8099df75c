use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info};

use super::ListenerFlags;
use crate::core::config::{Paths, Settings};
use crate::core::dispatcher::Dispatcher;
use crate::core::health::{HealthMonitor, MonitorService};
use crate::core::lifecycle::LifecycleManager;
use crate::core::profile::Declarations;
use crate::core::state::StateStore;
use crate::core::supervisor::Supervisor;
use crate::core::terminal::{GuideSection, print_info, print_warn};
use crate::core::trigger::{TriggerEngine, TriggerService};
use crate::interfaces::web::WebhookListener;
use crate::platform::{NativePlatform, Platform, process_alive};

const STOP_WAIT: Duration = Duration::from_secs(10);

fn load_paths(data_dir: &Path) -> Result<(Settings, Paths)> {
    let settings = Settings::load(&data_dir.join("config"))?;
    let paths = Paths::resolve(data_dir, &settings);
    paths.ensure()?;
    NativePlatform::restrict_dir_permissions(&paths.data_dir);
    NativePlatform::restrict_dir_permissions(&paths.run_dir);
    Ok((settings, paths))
}

/// Pid recorded in the pid file, if that process is still alive.
fn running_daemon(pid_file: &Path) -> Option<u32> {
    let pid: u32 = std::fs::read_to_string(pid_file).ok()?.trim().parse().ok()?;
    process_alive(pid).then_some(pid)
}

fn listener_addr(settings: &Settings, flags: &ListenerFlags) -> (String, u16) {
    (
        flags
            .host
            .clone()
            .unwrap_or_else(|| settings.webhook.host.clone()),
        flags.port.unwrap_or(settings.webhook.port),
    )
}

pub async fn daemon_start(data_dir: &Path, flags: ListenerFlags) -> Result<()> {
    let (settings, paths) = load_paths(data_dir)?;
    let pid_file = paths.pid_file();
    if let Some(pid) = running_daemon(&pid_file) {
        print_warn(&format!(
            "Daemon is already running (PID {}). Use '{} daemon stop' first.",
            pid,
            NativePlatform::binary_name()
        ));
        return Ok(());
    }
    std::fs::remove_file(&pid_file).ok();

    let (host, port) = listener_addr(&settings, &flags);
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.daemon_log())?;

    let exe = std::env::current_exe()?;
    let mut child_cmd = tokio::process::Command::new(exe);
    child_cmd.arg("daemon-run");
    if let Some(port) = flags.port {
        child_cmd.arg("--port").arg(port.to_string());
    }
    if let Some(host) = &flags.host {
        child_cmd.arg("--host").arg(host);
    }
    NativePlatform::isolate_process_group(&mut child_cmd);

    // the daemon tees its own log; stderr catches anything printed before that
    let child = child_cmd
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(log_file)
        .spawn()
        .context("spawning daemon-run")?;
    let pid = child
        .id()
        .ok_or_else(|| anyhow::anyhow!("daemon exited immediately"))?;
    std::fs::write(&pid_file, pid.to_string())?;
    NativePlatform::restrict_file_permissions(&pid_file);

    GuideSection::new("Daemon Started")
        .status(
            "Status",
            &format!(
                "{} (PID {})",
                style("RUNNING").green().bold(),
                style(pid).dim()
            ),
        )
        .status("Webhooks", &format!("http://{}:{}/hook/<trigger_id>", host, port))
        .status("Log", &paths.daemon_log().display().to_string())
        .print();
    println!();

    Ok(())
}

pub async fn daemon_stop(data_dir: &Path) -> Result<()> {
    let (_, paths) = load_paths(data_dir)?;
    let pid_file = paths.pid_file();
    let Some(pid) = running_daemon(&pid_file) else {
        std::fs::remove_file(&pid_file).ok();
        print_info("Daemon is not currently running.");
        return Ok(());
    };

    NativePlatform::terminate_group(pid)?;
    let deadline = tokio::time::Instant::now() + STOP_WAIT;
    while process_alive(pid) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    if process_alive(pid) {
        print_warn("Daemon did not exit in time; killing it.");
        NativePlatform::kill_group(pid)?;
    }
    std::fs::remove_file(&pid_file).ok();

    GuideSection::new("Daemon Stopped")
        .status(
            "Status",
            &format!(
                "{} (was PID {})",
                style("STOPPED").red().bold(),
                style(pid).dim()
            ),
        )
        .info("Supervised processes keep running.")
        .print();
    println!();
    Ok(())
}

pub async fn daemon_status(data_dir: &Path) -> Result<()> {
    let (settings, paths) = load_paths(data_dir)?;
    match running_daemon(&paths.pid_file()) {
        Some(pid) => {
            let (host, port) = listener_addr(&settings, &ListenerFlags::default());
            let health = probe_listener(&host, port).await;
            let listener = match &health {
                Some(_) => style("UP").green().bold().to_string(),
                None => style("UNREACHABLE").yellow().to_string(),
            };
            let mut section = GuideSection::new("Daemon Status")
                .status(
                    "Daemon",
                    &format!(
                        "{} (PID {})",
                        style("RUNNING").green().bold(),
                        style(pid).dim()
                    ),
                )
                .status("Listener", &format!("{} at http://{}:{}", listener, host, port));
            if health.is_some_and(|body| body["degraded"] == true) {
                section = section.blank().warn(&format!(
                    "State file is unreadable. Run '{} state restore'.",
                    NativePlatform::binary_name()
                ));
            }
            section.print();
        }
        None => {
            GuideSection::new("Daemon Status")
                .status("Daemon", &style("STOPPED").red().bold().to_string())
                .blank()
                .info(&format!(
                    "Run {} to start it.",
                    style(format!("{} daemon start", NativePlatform::binary_name()))
                        .cyan()
                        .bold()
                ))
                .print();
        }
    }
    println!();
    Ok(())
}

async fn probe_listener(host: &str, port: u16) -> Option<serde_json::Value> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .ok()?;
    client
        .get(format!("http://{}:{}/health", host, port))
        .send()
        .await
        .ok()?
        .json()
        .await
        .ok()
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Foreground daemon: reconcile, then run the monitor, trigger engine and
/// webhook listener until interrupted.
pub async fn run_daemon(data_dir: &Path, flags: ListenerFlags) -> Result<()> {
    let (settings, paths) = load_paths(data_dir)?;
    crate::logging::init(&paths.daemon_log(), false)?;
    let tz = settings.timezone()?;

    let pid_file = paths.pid_file();
    if let Some(pid) = running_daemon(&pid_file)
        && pid != std::process::id()
    {
        anyhow::bail!("Another daemon is already running (PID {})", pid);
    }
    std::fs::write(&pid_file, std::process::id().to_string())?;
    NativePlatform::restrict_file_permissions(&pid_file);

    info!(data_dir = %paths.data_dir.display(), timezone = %tz, "Booting agentvisor daemon");
    let store = Arc::new(StateStore::open(&paths.state_dir)?);
    let declarations = Arc::new(Declarations::load(&paths.config_dir));
    let supervisor = Arc::new(Supervisor::new(
        store.clone(),
        declarations,
        paths.clone(),
        Duration::from_secs(settings.stop_timeout_seconds),
    ));
    let monitor = Arc::new(HealthMonitor::new(supervisor.clone(), &settings.restart));
    let dispatcher = Arc::new(Dispatcher::new(supervisor.clone()));
    let engine = Arc::new(TriggerEngine::new(dispatcher.clone(), tz));

    match supervisor.reconcile_on_boot().await {
        Ok(report) => {
            monitor.recover_crashed(report.crashed);
        }
        Err(e) => error!(
            "State unavailable, running degraded until '{} state restore': {}",
            NativePlatform::binary_name(),
            e
        ),
    }

    let (host, port) = listener_addr(&settings, &flags);
    let mut lifecycle = LifecycleManager::new().await?;
    lifecycle.attach(Arc::new(Mutex::new(MonitorService::new(monitor))));
    lifecycle.attach(Arc::new(Mutex::new(TriggerService::new(engine.clone()))));
    lifecycle.attach(Arc::new(Mutex::new(WebhookListener::new(
        dispatcher, host, port,
    ))));
    lifecycle.scheduler.add(engine.minute_job()?).await?;
    lifecycle.start().await?;

    info!(state = ?lifecycle.state(), "agentvisor daemon is ready");
    shutdown_signal().await?;

    lifecycle.shutdown().await?;
    if running_daemon(&pid_file) == Some(std::process::id()) {
        std::fs::remove_file(&pid_file).ok();
    }
    info!("agentvisor daemon stopped; supervised processes keep running");
    Ok(())
}

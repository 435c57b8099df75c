mod daemon;
mod process;

use anyhow::Result;
use console::style;

use crate::core::terminal::{self, GuideSection, print_error};
use crate::platform::{NativePlatform, Platform};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Daemon")
        .command("daemon start", "Start the supervisor in the background")
        .command("daemon stop", "Stop the background supervisor")
        .command("daemon status", "Show whether the supervisor is running")
        .command("daemon-run", "Run the supervisor in the foreground")
        .print();

    GuideSection::new("Processes")
        .command("start <agent> <label>", "Start a run profile")
        .command("stop <agent> <label>", "Stop a run profile and its process group")
        .command("status [agent]", "Show process records and health")
        .command("logs <agent> <label>", "Follow the latest run log")
        .print();

    GuideSection::new("Triggers")
        .command("fire <trigger_id>", "Fire a trigger by hand")
        .command("history [trigger_id]", "Show trigger history")
        .print();

    GuideSection::new("Maintenance")
        .command("state restore", "Replace corrupt state with the last good copy")
        .command("help", "Show this help")
        .blank()
        .hint(&format!("{} daemon start --port 17890", NativePlatform::binary_name()), "")
        .hint(&format!("{} fire nightly-report", NativePlatform::binary_name()), "")
        .blank()
        .text(&format!(
            "Data directory: {} (override with {})",
            style(NativePlatform::data_dir().display()).dim(),
            style(crate::platform::DATA_DIR_ENV).cyan()
        ))
        .print();

    println!(
        "\n {} {} <command> [args]\n",
        style("Usage:").bold(),
        style(NativePlatform::binary_name()).green()
    );
}

/// Host/port overrides for the webhook listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ListenerFlags {
    pub host: Option<String>,
    pub port: Option<u16>,
}

pub(crate) fn parse_listener_flags(args: &[String], start: usize) -> Result<ListenerFlags> {
    let mut flags = ListenerFlags::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    let raw = &args[i + 1];
                    flags.port = Some(
                        raw.parse()
                            .map_err(|_| anyhow::anyhow!("Invalid port '{}'", raw))?,
                    );
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--host" => {
                if i + 1 < args.len() {
                    flags.host = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    Ok(flags)
}

/// `<agent> <label>` positional pair.
pub(crate) fn parse_profile_args(args: &[String], start: usize) -> Option<(String, String)> {
    match (args.get(start), args.get(start + 1)) {
        (Some(agent), Some(label)) if !agent.starts_with('-') && !label.starts_with('-') => {
            Some((agent.clone(), label.clone()))
        }
        _ => None,
    }
}

pub(crate) fn parse_history_args(args: &[String], start: usize) -> (Option<String>, usize) {
    let mut trigger_id = None;
    let mut limit = 50;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--limit" | "-n" => {
                if i + 1 < args.len() {
                    limit = args[i + 1].parse().unwrap_or(50);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            other if trigger_id.is_none() && !other.starts_with('-') => {
                trigger_id = Some(other.to_string());
                i += 1;
            }
            _ => i += 1,
        }
    }
    (trigger_id, limit)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let data_dir = NativePlatform::data_dir();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    let cmd = args[1].as_str();
    match cmd {
        "daemon-run" => {
            let flags = parse_listener_flags(&args, 2)?;
            daemon::run_daemon(&data_dir, flags).await
        }
        "daemon" => {
            let sub_cmd = args.get(2).map(String::as_str).unwrap_or("");
            match sub_cmd {
                "start" => {
                    let flags = parse_listener_flags(&args, 3)?;
                    daemon::daemon_start(&data_dir, flags).await
                }
                "stop" => daemon::daemon_stop(&data_dir).await,
                "status" => daemon::daemon_status(&data_dir).await,
                _ => {
                    print_error("Unknown or missing daemon command. Expected: start, stop, status");
                    print_help();
                    Ok(())
                }
            }
        }
        "start" | "stop" | "logs" => {
            let Some((agent, label)) = parse_profile_args(&args, 2) else {
                print_error(&format!("Usage: {} {} <agent> <label>", NativePlatform::binary_name(), cmd));
                std::process::exit(2);
            };
            let ctx = process::CliContext::open(&data_dir)?;
            match cmd {
                "start" => process::start_profile(&ctx, &agent, &label).await,
                "stop" => process::stop_profile(&ctx, &agent, &label).await,
                _ => process::follow_profile_logs(&ctx, &agent, &label).await,
            }
        }
        "status" => {
            let ctx = process::CliContext::open(&data_dir)?;
            process::show_status(&ctx, args.get(2).map(String::as_str)).await
        }
        "history" => {
            let (trigger_id, limit) = parse_history_args(&args, 2);
            let ctx = process::CliContext::open(&data_dir)?;
            process::show_history(&ctx, trigger_id.as_deref(), limit).await
        }
        "fire" => {
            let Some(trigger_id) = args.get(2) else {
                print_error(&format!("Usage: {} fire <trigger_id>", NativePlatform::binary_name()));
                std::process::exit(2);
            };
            let ctx = process::CliContext::open(&data_dir)?;
            process::fire_trigger(&ctx, trigger_id).await
        }
        "state" => match args.get(2).map(String::as_str) {
            Some("restore") => {
                let ctx = process::CliContext::open(&data_dir)?;
                process::restore_state(&ctx).await
            }
            _ => {
                print_error("Unknown or missing state command. Expected: restore");
                Ok(())
            }
        },
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        _ => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            std::process::exit(2);
        }
    }
}

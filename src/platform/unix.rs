use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::{Pid, getpgid};
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

use super::{Platform, resolve_data_dir};

pub struct NativePlatform;

/// The group may hold only unreaped zombies; those do not count.
fn live_group_member(pgid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::new());
    system.processes().iter().any(|(pid, process)| {
        !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
            && getpgid(Some(Pid::from_raw(pid.as_u32() as i32)))
                .is_ok_and(|group| group.as_raw() as u32 == pgid)
    })
}

fn signal_group(pgid: u32, signal: Signal) -> std::io::Result<()> {
    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(std::io::Error::from(err)),
    }
}

impl Platform for NativePlatform {
    fn shell_inline(command: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("bash");
        cmd.arg("-lc").arg(command);
        cmd
    }

    fn isolate_process_group(cmd: &mut tokio::process::Command) {
        cmd.process_group(0);
    }

    fn venv_activation(agent_dir: &Path) -> Option<String> {
        agent_dir
            .join(".venv")
            .join("bin")
            .join("activate")
            .is_file()
            .then(|| "source .venv/bin/activate && ".to_string())
    }

    fn terminate_group(pgid: u32) -> std::io::Result<()> {
        signal_group(pgid, Signal::SIGTERM)
    }

    fn kill_group(pgid: u32) -> std::io::Result<()> {
        signal_group(pgid, Signal::SIGKILL)
    }

    fn group_alive(pgid: u32) -> bool {
        if pgid == 0 {
            return false;
        }
        // EPERM still means the group exists
        if matches!(killpg(Pid::from_raw(pgid as i32), None), Err(Errno::ESRCH)) {
            return false;
        }
        live_group_member(pgid)
    }

    fn tail_file(path: &Path) -> std::io::Result<std::process::Child> {
        std::process::Command::new("tail")
            .arg("-n")
            .arg("200")
            .arg("-f")
            .arg(path)
            .spawn()
    }

    fn restrict_dir_permissions(path: &Path) {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700));
    }

    fn restrict_file_permissions(path: &Path) {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }

    fn binary_name() -> &'static str {
        "agentvisor"
    }

    fn data_dir() -> PathBuf {
        resolve_data_dir(
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".agentvisor"),
        )
    }
}

use std::path::{Path, PathBuf};

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

/// Environment variable that relocates the whole data directory.
pub const DATA_DIR_ENV: &str = "AGENTVISOR_DATA_DIR";

/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` implementation so call sites
/// remain free of `#[cfg]` blocks.
pub trait Platform {
    /// Build a **tokio** `Command` that runs an inline shell string.
    fn shell_inline(command: &str) -> tokio::process::Command;

    /// Detach the spawned child into its own process group so signals can
    /// target the whole tree and the child outlives the supervisor.
    fn isolate_process_group(cmd: &mut tokio::process::Command);

    /// Shell snippet that activates the agent's virtualenv, if it has one.
    fn venv_activation(agent_dir: &Path) -> Option<String>;

    /// Ask every process in the group to terminate (SIGTERM on Unix).
    /// A group that no longer exists is not an error.
    fn terminate_group(pgid: u32) -> std::io::Result<()>;

    /// Forcefully kill every process in the group (SIGKILL on Unix).
    fn kill_group(pgid: u32) -> std::io::Result<()>;

    /// True while any member of the group still exists, even after the
    /// leader is gone.
    fn group_alive(pgid: u32) -> bool;

    /// Spawn a child that tails / follows a log file.
    fn tail_file(path: &Path) -> std::io::Result<std::process::Child>;

    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);

    /// Binary filename for this platform (`"agentvisor"` / `"agentvisor.exe"`).
    fn binary_name() -> &'static str;

    /// Root data directory for agentvisor.
    /// Unix: `~/.agentvisor`, Windows: `%APPDATA%\agentvisor`.
    fn data_dir() -> PathBuf;
}

/// What the OS currently reports about a pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessFacts {
    /// Start time in seconds since the UNIX epoch.
    pub start_time: u64,
    pub zombie: bool,
}

/// Query a single pid without scanning the whole process table.
pub fn inspect_process(pid: u32) -> Option<ProcessFacts> {
    if pid == 0 {
        return None;
    }
    let mut system = System::new();
    let sys_pid = Pid::from_u32(pid);
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[sys_pid]),
        true,
        ProcessRefreshKind::new(),
    );
    system.process(sys_pid).map(|process| ProcessFacts {
        start_time: process.start_time(),
        zombie: matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
    })
}

/// True when the pid exists and has not exited.
pub fn process_alive(pid: u32) -> bool {
    inspect_process(pid).is_some_and(|facts| !facts.zombie)
}

/// OS-reported start time of `pid`, used as a reuse fingerprint.
pub fn process_start_time(pid: u32) -> Option<u64> {
    inspect_process(pid).map(|facts| facts.start_time)
}

pub(crate) fn resolve_data_dir(default: PathBuf) -> PathBuf {
    match std::env::var_os(DATA_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => default,
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive_with_a_start_time() {
        let pid = std::process::id();
        assert!(process_alive(pid));
        let started = process_start_time(pid).expect("own start time");
        assert!(started > 0);
    }

    #[test]
    fn pid_zero_is_never_alive() {
        assert!(!process_alive(0));
        assert_eq!(process_start_time(0), None);
    }
}

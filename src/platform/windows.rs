use std::path::{Path, PathBuf};

use super::{Platform, resolve_data_dir};

pub struct NativePlatform;

fn taskkill(pgid: u32, force: bool) -> std::io::Result<()> {
    let mut cmd = std::process::Command::new("taskkill");
    cmd.args(["/PID", &pgid.to_string(), "/T"]);
    if force {
        cmd.arg("/F");
    }
    // taskkill exits non-zero when the tree is already gone
    cmd.output().map(|_| ())
}

impl Platform for NativePlatform {
    fn shell_inline(command: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("bash");
        cmd.arg("-lc").arg(command);
        cmd
    }

    fn isolate_process_group(cmd: &mut tokio::process::Command) {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    fn venv_activation(agent_dir: &Path) -> Option<String> {
        agent_dir
            .join(".venv")
            .join("Scripts")
            .join("activate")
            .is_file()
            .then(|| "source .venv/Scripts/activate && ".to_string())
    }

    fn terminate_group(pgid: u32) -> std::io::Result<()> {
        taskkill(pgid, false)
    }

    fn kill_group(pgid: u32) -> std::io::Result<()> {
        taskkill(pgid, true)
    }

    // no group membership query; the leader stands in for the tree
    fn group_alive(pgid: u32) -> bool {
        super::process_alive(pgid)
    }

    fn tail_file(path: &Path) -> std::io::Result<std::process::Child> {
        std::process::Command::new("powershell")
            .args(["-NoProfile", "-Command"])
            .arg(format!(
                "Get-Content -Path '{}' -Tail 200 -Wait",
                path.display()
            ))
            .spawn()
    }

    fn restrict_dir_permissions(_path: &Path) {}

    fn restrict_file_permissions(_path: &Path) {}

    fn binary_name() -> &'static str {
        "agentvisor.exe"
    }

    fn data_dir() -> PathBuf {
        resolve_data_dir(
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("agentvisor"),
        )
    }
}

use std::path::Path;
use std::process::{Command, Output};

fn agentvisor(data_dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_agentvisor"))
        .args(args)
        .env("AGENTVISOR_DATA_DIR", data_dir)
        .env_remove("RUST_LOG")
        .output()
        .expect("agentvisor binary should run")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn declare(data_dir: &Path) {
    let config = data_dir.join("config");
    std::fs::create_dir_all(&config).unwrap();
    std::fs::write(
        config.join("agent_profiles.json"),
        r#"{ "news": [ { "label": "digest", "command": "echo digest done" } ] }"#,
    )
    .unwrap();
    std::fs::write(
        config.join("triggers.json"),
        r#"[
            {
                "trigger_id": "nightly",
                "agent_id": "news",
                "profile_label": "digest",
                "kind": "daily",
                "schedule_expr": "02:30"
            }
        ]"#,
    )
    .unwrap();
}

#[test]
fn help_lists_every_command_group() {
    let dir = tempfile::tempdir().unwrap();
    let output = agentvisor(dir.path(), &["help"]);
    assert!(output.status.success());
    let text = stdout(&output);
    for needle in [
        "daemon start",
        "daemon-run",
        "start <agent> <label>",
        "fire <trigger_id>",
        "history [trigger_id]",
        "state restore",
    ] {
        assert!(text.contains(needle), "help is missing '{needle}':\n{text}");
    }
}

#[test]
fn unknown_command_and_bad_usage_exit_with_two() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(agentvisor(dir.path(), &["frobnicate"]).status.code(), Some(2));
    assert_eq!(agentvisor(dir.path(), &["start", "news"]).status.code(), Some(2));
    assert_eq!(agentvisor(dir.path(), &["fire"]).status.code(), Some(2));
}

#[test]
fn empty_data_dir_reports_no_records_or_history() {
    let dir = tempfile::tempdir().unwrap();
    let output = agentvisor(dir.path(), &["status"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("No process records"));

    let output = agentvisor(dir.path(), &["history"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("No trigger firings recorded"));
}

#[test]
fn firing_an_undeclared_trigger_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = agentvisor(dir.path(), &["fire", "missing"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("missing"));
}

#[test]
fn manual_fire_is_recorded_in_history() {
    let dir = tempfile::tempdir().unwrap();
    declare(dir.path());

    let output = agentvisor(dir.path(), &["fire", "nightly"]);
    assert!(output.status.success(), "{}", stdout(&output));

    let output = agentvisor(dir.path(), &["history", "nightly"]);
    let text = stdout(&output);
    assert!(text.contains("nightly"), "{text}");
    assert!(text.contains("manual"), "{text}");

    let output = agentvisor(dir.path(), &["status", "news"]);
    assert!(stdout(&output).contains("news/digest"));
}

#[test]
fn state_restore_repairs_a_corrupt_state_file() {
    let dir = tempfile::tempdir().unwrap();
    declare(dir.path());

    let output = agentvisor(dir.path(), &["state", "restore"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("nothing to restore"));

    assert!(agentvisor(dir.path(), &["start", "news", "digest"]).status.success());
    let state = dir.path().join("state").join("state.json");
    std::fs::write(&state, b"{ truncated").unwrap();

    let output = agentvisor(dir.path(), &["status"]);
    assert!(!output.status.success());

    let output = agentvisor(dir.path(), &["state", "restore"]);
    assert!(output.status.success(), "{}", stdout(&output));
    assert!(stdout(&output).contains("State Restored"));

    let output = agentvisor(dir.path(), &["status"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("news/digest"));

    let preserved = std::fs::read_dir(dir.path().join("state"))
        .unwrap()
        .filter_map(|entry| entry.ok())
        .any(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with("state.json.corrupt-")
        });
    assert!(preserved);
}

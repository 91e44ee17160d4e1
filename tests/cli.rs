//! Command line behaviour of the gardener binary.

use std::process::{Command, Output};

fn run(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_gardener"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run gardener binary")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).to_string()
}

#[test]
fn test_help_lists_subcommands_and_flags() {
    let out = run(&["--help"]);
    assert!(out.status.success());
    let help = stdout(&out);
    for expected in [
        "gardenlet",
        "node-agent",
        "admission",
        "--kubeconfig",
        "--config",
        "--log-level",
        "--log-json",
        "--feature-gates",
    ] {
        assert!(help.contains(expected), "missing {expected} in help:\n{help}");
    }
}

#[test]
fn test_version() {
    let out = run(&["--version"]);
    assert!(out.status.success());
    assert!(stdout(&out).contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_unknown_subcommand_fails() {
    let out = run(&["seedlet"]);
    assert!(!out.status.success());
}

#[test]
fn test_missing_subcommand_fails() {
    assert!(!run(&[]).status.success());
}

#[test]
fn test_gardenlet_requires_config() {
    let out = run(&["gardenlet"]);
    assert!(!out.status.success());
    let output = format!("{}{}", stdout(&out), String::from_utf8_lossy(&out.stderr));
    assert!(output.contains("--config is required"), "{output}");
}

#[test]
fn test_node_agent_rejects_unreadable_config() {
    let out = run(&["node-agent", "--config", "/nonexistent/gardener-node-agent.yaml"]);
    assert!(!out.status.success());
    let output = format!("{}{}", stdout(&out), String::from_utf8_lossy(&out.stderr));
    assert!(output.contains("failed to read config file"), "{output}");
}

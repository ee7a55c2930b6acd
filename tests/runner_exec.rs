#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};
use testpilot::recorder::Recorder;
use testpilot::runner::{AgentRunner, ExecOptions};

fn runner() -> AgentRunner {
    AgentRunner::new("claude", Arc::new(Recorder::new()))
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

#[tokio::test]
async fn echo_round_trip_trims_output() {
    let result = runner()
        .execute("echo", &args(&["hello world"]), ExecOptions::default())
        .await;
    assert!(result.success);
    assert_eq!(result.stdout, "hello world");
    assert_eq!(result.exit_code, Some(0));
}

#[tokio::test]
async fn arguments_with_metacharacters_survive_shell_composition() {
    let result = runner()
        .execute("echo", &args(&["it's a $test; true"]), ExecOptions::default())
        .await;
    assert!(result.success);
    assert_eq!(result.stdout, "it's a $test; true");
}

#[tokio::test]
async fn nonzero_exit_reports_captured_stderr() {
    let result = runner()
        .execute("sh", &args(&["-c", "echo boo >&2; exit 3"]), ExecOptions::default())
        .await;
    assert!(!result.success);
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.stderr, "boo");
}

#[tokio::test]
async fn missing_binary_resolves_with_failure() {
    let result = runner()
        .execute(
            "definitely-not-a-real-binary-xyz",
            &args(&[]),
            ExecOptions::default(),
        )
        .await;
    assert!(!result.success);
    assert_eq!(result.exit_code, Some(127));
    assert!(!result.stderr.is_empty());
}

#[tokio::test]
async fn sleepy_command_times_out_within_the_bound() {
    let options = ExecOptions {
        timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    };
    let started = Instant::now();
    let result = runner().execute("sleep", &args(&["2"]), options).await;
    let elapsed = started.elapsed();
    assert!(!result.success);
    assert!(
        elapsed < Duration::from_millis(1_500),
        "timeout resolution took {elapsed:?}"
    );
}

#[tokio::test]
async fn sigterm_immune_command_is_forcibly_killed() {
    let options = ExecOptions {
        timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    };
    let started = Instant::now();
    let result = runner()
        .execute("sh", &args(&["-c", "trap '' TERM; sleep 5"]), options)
        .await;
    let elapsed = started.elapsed();
    assert!(!result.success);
    assert!(
        elapsed < Duration::from_secs(4),
        "kill escalation took {elapsed:?}"
    );
}

#[tokio::test]
async fn timeout_preserves_output_captured_before_termination() {
    let options = ExecOptions {
        timeout: Some(Duration::from_millis(300)),
        ..Default::default()
    };
    let result = runner()
        .execute("sh", &args(&["-c", "echo early; sleep 5"]), options)
        .await;
    assert!(!result.success);
    assert_eq!(result.stdout, "early");
}

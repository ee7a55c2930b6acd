#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};
use testpilot::errors::AppError;
use testpilot::recorder::Recorder;
use testpilot::runner::{AgentRunner, CancelRequest, StreamChunk, StreamOptions, TermSignal};

fn runner() -> AgentRunner {
    AgentRunner::new("claude", Arc::new(Recorder::new()))
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

#[tokio::test]
async fn streams_lines_as_separate_chunks() {
    let runner = runner();
    let mut run = runner
        .stream(
            "bash",
            &args(&["tests/fixtures/mock-agent.sh"]),
            StreamOptions::default(),
        )
        .expect("stream");

    let mut chunk_count = 0usize;
    let mut streamed = String::new();
    while let Some(chunk) = run.recv().await {
        if let StreamChunk::Stdout(text) = chunk {
            chunk_count += 1;
            streamed.push_str(&text);
        }
    }
    let result = run.wait().await;
    assert!(result.success);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout, "a\nb\nc");
    assert!(
        chunk_count >= 3,
        "expected at least one chunk per line, got {chunk_count}"
    );
    // Streaming fidelity: the concatenated chunks equal the resolved stdout
    // modulo trailing-whitespace trimming.
    assert_eq!(streamed.trim_end(), result.stdout);
}

#[tokio::test]
async fn active_handle_tracks_liveness_and_force_cancel() {
    let runner = runner();
    let controller = runner.cancel_controller();
    assert!(!controller.has_active_invocation());

    let run = runner
        .stream("sleep", &args(&["30"]), StreamOptions::default())
        .expect("stream");
    assert!(controller.has_active_invocation());

    assert!(controller.cancel_active_invocation(CancelRequest {
        force: true,
        signal: None,
    }));
    let started = Instant::now();
    let result = run.wait().await;
    assert!(!result.success);
    assert_eq!(result.exit_code, None);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!controller.has_active_invocation());
}

#[tokio::test]
async fn graceful_then_forced_cancel_terminates_a_stubborn_process() {
    let runner = runner();
    let controller = runner.cancel_controller();
    let run = runner
        .stream(
            "sh",
            &args(&["-c", "trap '' INT TERM; while true; do sleep 1; done"]),
            StreamOptions::default(),
        )
        .expect("stream");

    // Let the shell install its traps before interrupting.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(controller.cancel_active_invocation(CancelRequest::default()));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        controller.has_active_invocation(),
        "process should survive the ignored interrupt"
    );

    assert!(controller.cancel_active_invocation(CancelRequest {
        force: true,
        signal: None,
    }));
    let started = Instant::now();
    let result = run.wait().await;
    assert!(!result.success);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!controller.has_active_invocation());
}

#[tokio::test]
async fn explicit_signal_overrides_the_default() {
    let runner = runner();
    let controller = runner.cancel_controller();
    let run = runner
        .stream("sleep", &args(&["30"]), StreamOptions::default())
        .expect("stream");
    assert!(controller.cancel_active_invocation(CancelRequest {
        force: false,
        signal: Some(TermSignal::Terminate),
    }));
    let result = run.wait().await;
    assert!(!result.success);
}

#[tokio::test]
async fn cancel_without_active_invocation_returns_false() {
    let runner = runner();
    assert!(!runner
        .cancel_controller()
        .cancel_active_invocation(CancelRequest::default()));
}

#[tokio::test]
async fn second_stream_is_rejected_while_running() {
    let runner = runner();
    let run = runner
        .stream("sleep", &args(&["5"]), StreamOptions::default())
        .expect("stream");

    let second = runner.stream("sleep", &args(&["5"]), StreamOptions::default());
    assert!(matches!(second, Err(AppError::Busy(_))));

    // The first invocation stays cancellable through the controller.
    assert!(runner.cancel_controller().cancel_active_invocation(CancelRequest {
        force: true,
        signal: None,
    }));
    let result = run.wait().await;
    assert!(!result.success);

    // And the runner returns to Idle once the first invocation resolves.
    let mut third = runner
        .stream("echo", &args(&["done"]), StreamOptions::default())
        .expect("stream after resolution");
    while third.recv().await.is_some() {}
    assert!(third.wait().await.success);
}

#[tokio::test]
async fn missing_binary_resolves_through_the_stream() {
    let runner = runner();
    let run = runner
        .stream(
            "definitely-not-a-real-binary-xyz",
            &args(&[]),
            StreamOptions::default(),
        )
        .expect("reservation succeeds");
    let result = run.wait().await;
    assert!(!result.success);
    assert_eq!(result.exit_code, None);
    assert!(result.stderr.contains("failed to spawn"));
    assert!(!runner.cancel_controller().has_active_invocation());
}

#[tokio::test]
async fn pty_streaming_merges_output_on_stdout() {
    let runner = runner();
    let options = StreamOptions {
        pty: true,
        ..Default::default()
    };
    let mut run = runner
        .stream("sh", &args(&["-c", "echo hello-from-pty"]), options)
        .expect("stream");

    let mut streamed = String::new();
    while let Some(chunk) = run.recv().await {
        match chunk {
            StreamChunk::Stdout(text) => streamed.push_str(&text),
            StreamChunk::Stderr(_) => panic!("pty output must arrive on the stdout stream"),
        }
    }
    let result = run.wait().await;
    assert!(result.success);
    assert!(result.stdout.contains("hello-from-pty"));
    assert!(streamed.contains("hello-from-pty"));
}

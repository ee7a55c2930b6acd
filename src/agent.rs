use crate::config::Settings;
use crate::errors::AppResult;
use crate::recorder::Recorder;
use crate::runner::{AgentRunner, ExecOptions, ExecResult, StreamOptions, StreamedRun};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::time::Duration;

const COMPACT_OUTPUT_FORMAT: &str = "compact";

/// Subcommands that require the tool to talk to the user's terminal directly.
/// These bypass escaping, streaming, and audit capture entirely.
const INTERACTIVE_SUBCOMMANDS: &[&str] = &["login", "logout"];

/// Where the prompt lands in the argument vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptPlacement {
    /// `--print <prompt>`, used by the synchronous path.
    PrintFlag,
    /// Trailing positional prompt, used by the streaming path.
    Trailing,
}

pub fn is_interactive_invocation(args: &[String]) -> bool {
    args.first()
        .map(|arg| INTERACTIVE_SUBCOMMANDS.contains(&arg.as_str()))
        .unwrap_or(false)
}

/// Argument vector for a non-interactive analysis invocation. Every such
/// invocation carries the fixed settings file and the compact output flag.
pub fn build_agent_args(settings: &Settings, prompt: &str, placement: PromptPlacement) -> Vec<String> {
    let mut args = vec![
        "--settings".to_string(),
        settings.agent_settings_path.clone(),
        "--output-format".to_string(),
        COMPACT_OUTPUT_FORMAT.to_string(),
    ];
    match placement {
        PromptPlacement::PrintFlag => {
            args.push("--print".to_string());
            args.push(prompt.to_string());
        }
        PromptPlacement::Trailing => args.push(prompt.to_string()),
    }
    args
}

/// High-level client for the external analysis tool, wiring settings into the
/// process runner.
pub struct Agent {
    settings: Settings,
    runner: AgentRunner,
}

impl Agent {
    pub fn new(settings: Settings, recorder: Arc<Recorder>) -> Self {
        let runner = AgentRunner::new(settings.agent_binary.clone(), recorder);
        Self { settings, runner }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn runner(&self) -> &AgentRunner {
        &self.runner
    }

    /// One-shot prompt, run to completion under the configured timeout.
    pub async fn run_prompt(&self, prompt: &str, cwd: Option<PathBuf>) -> ExecResult {
        let args = build_agent_args(&self.settings, prompt, PromptPlacement::PrintFlag);
        let options = ExecOptions {
            cwd,
            timeout: Some(Duration::from_secs(self.settings.default_timeout_seconds)),
            env: Default::default(),
        };
        self.runner
            .execute(&self.settings.agent_binary, &args, options)
            .await
    }

    /// Streaming prompt with no timeout; cancellation is operator-driven.
    pub fn stream_prompt(&self, prompt: &str, cwd: Option<PathBuf>, pty: bool) -> AppResult<StreamedRun> {
        let args = build_agent_args(&self.settings, prompt, PromptPlacement::Trailing);
        let options = StreamOptions {
            cwd,
            env: Default::default(),
            pty,
        };
        self.runner.stream(&self.settings.agent_binary, &args, options)
    }

    /// Route raw tool arguments: interactive flag combinations inherit the
    /// terminal, everything else runs through the synchronous runner.
    pub async fn run_args(&self, args: &[String], cwd: Option<PathBuf>) -> ExecResult {
        if is_interactive_invocation(args) {
            let subcommand = args.first().map(String::as_str).unwrap_or_default();
            return self.run_interactive(subcommand).await;
        }
        let options = ExecOptions {
            cwd,
            timeout: Some(Duration::from_secs(self.settings.default_timeout_seconds)),
            env: Default::default(),
        };
        self.runner
            .execute(&self.settings.agent_binary, args, options)
            .await
    }

    /// Run an interactive subcommand (login/logout) with inherited stdio so the
    /// tool owns the terminal. Nothing is captured or logged for these.
    pub async fn run_interactive(&self, subcommand: &str) -> ExecResult {
        let status = Command::new(&self.settings.agent_binary)
            .arg(subcommand)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await;
        match status {
            Ok(status) => ExecResult {
                success: status.success(),
                stdout: String::new(),
                stderr: String::new(),
                exit_code: status.code(),
            },
            Err(error) => ExecResult {
                success: false,
                stdout: String::new(),
                stderr: format!("failed to launch interactive session: {error}"),
                exit_code: None,
            },
        }
    }
}

use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use testpilot::agent::Agent;
use testpilot::browser::BrowserClient;
use testpilot::config::Settings;
use testpilot::prompts::{test_goal_prompt, PageContext};
use testpilot::recorder::{self, Recorder};
use testpilot::runner::CancelRequest;
use testpilot::ui::StreamPrinter;
use tracing_appender::non_blocking::WorkerGuard;
use uuid::Uuid;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

#[derive(Parser)]
#[command(
    name = "testpilot",
    version,
    about = "Browser-testing assistant driving a local AI analysis CLI"
)]
struct Cli {
    /// Settings file (YAML)
    #[arg(long, global = true, default_value = "testpilot.yaml")]
    config: PathBuf,
    /// Skip the audit session for this run
    #[arg(long, global = true)]
    no_audit: bool,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Drive a testing goal, streaming the analysis as it happens
    Run {
        goal: String,
        /// Page to load and summarize as context before the run
        #[arg(long)]
        url: Option<String>,
        /// Allocate a pseudo-terminal so the tool streams line by line
        #[arg(long)]
        pty: bool,
        #[arg(long)]
        cwd: Option<PathBuf>,
    },
    /// Send a one-shot prompt and wait for the result
    Exec {
        prompt: String,
        #[arg(long)]
        cwd: Option<PathBuf>,
    },
    /// Authenticate the analysis tool (interactive)
    Login,
    /// Sign out of the analysis tool (interactive)
    Logout,
    /// List recorded audit sessions
    Sessions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)?;
    init_logging(&settings);

    let recorder = Arc::new(Recorder::new());
    let wants_audit = matches!(
        cli.command,
        CliCommand::Run { .. } | CliCommand::Exec { .. }
    );
    if wants_audit && !cli.no_audit {
        match recorder.enable(&settings.audit_root) {
            Ok(dir) => tracing::info!(directory = %dir.display(), "audit session enabled"),
            Err(error) => tracing::warn!(error = %error, "failed to enable audit session"),
        }
    }

    let agent = Agent::new(settings.clone(), recorder.clone());

    let outcome = match cli.command {
        CliCommand::Run { goal, url, pty, cwd } => run_goal(&agent, goal, url, pty, cwd).await,
        CliCommand::Exec { prompt, cwd } => exec_prompt(&agent, prompt, cwd).await,
        CliCommand::Login => interactive(&agent, "login").await,
        CliCommand::Logout => interactive(&agent, "logout").await,
        CliCommand::Sessions => list_sessions(&settings.audit_root),
    };

    // Structured shutdown: the closing audit entry is written here on every
    // exit path instead of from a process exit hook.
    if let Err(error) = recorder.disable() {
        tracing::warn!(error = %error, "failed to close audit session");
    }

    outcome
}

async fn run_goal(
    agent: &Agent,
    goal: String,
    url: Option<String>,
    pty: bool,
    cwd: Option<PathBuf>,
) -> anyhow::Result<()> {
    let settings = agent.settings();
    let run_id = Uuid::new_v4().to_string();
    let _ = agent
        .runner()
        .recorder()
        .write_entry("run_started", json!({ "run_id": run_id, "goal": goal }));

    let mut context = PageContext::default();
    let mut browser = None;
    if let Some(url) = url {
        let mut client = BrowserClient::new(settings.webdriver_url.clone());
        client.open().await?;
        client.navigate(&url).await?;
        context.title = client.title().await.unwrap_or_default();
        context.page_text = client.page_text().await.unwrap_or_default();
        context.url = url;
        browser = Some(client);
    }

    let prompt = test_goal_prompt(settings, &goal, &context);
    let mut run = agent.stream_prompt(&prompt, cwd, pty)?;
    let controller = agent.runner().cancel_controller();

    let mut printer = StreamPrinter::new();
    let mut interrupts = 0u32;
    loop {
        tokio::select! {
            chunk = run.recv() => {
                match chunk {
                    Some(chunk) => printer.print_chunk(&chunk),
                    None => break,
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if signal.is_err() {
                    continue;
                }
                interrupts += 1;
                // Escalation lives here, not in the runner: a second interrupt
                // forces a kill.
                let delivered = controller.cancel_active_invocation(CancelRequest {
                    force: interrupts > 1,
                    signal: None,
                });
                if !delivered {
                    tracing::warn!("no active invocation to cancel");
                }
            }
        }
    }
    printer.flush();
    let result = run.wait().await;

    if let Some(mut client) = browser {
        if let Err(error) = client.close().await {
            tracing::warn!(error = %error, "failed to close browser session");
        }
    }

    if result.success {
        Ok(())
    } else {
        if !result.stderr.is_empty() {
            eprintln!("{}", result.stderr);
        }
        anyhow::bail!("run failed (exit code {:?})", result.exit_code)
    }
}

async fn exec_prompt(agent: &Agent, prompt: String, cwd: Option<PathBuf>) -> anyhow::Result<()> {
    let result = agent.run_prompt(&prompt, cwd).await;
    if !result.stdout.is_empty() {
        println!("{}", result.stdout);
    }
    if !result.stderr.is_empty() {
        eprintln!("{}", result.stderr);
    }
    if result.success {
        Ok(())
    } else {
        anyhow::bail!("analysis run failed (exit code {:?})", result.exit_code)
    }
}

async fn interactive(agent: &Agent, subcommand: &str) -> anyhow::Result<()> {
    let result = agent.run_args(&[subcommand.to_string()], None).await;
    if result.success {
        Ok(())
    } else {
        if !result.stderr.is_empty() {
            eprintln!("{}", result.stderr);
        }
        anyhow::bail!("{subcommand} exited with {:?}", result.exit_code)
    }
}

fn list_sessions(root: &Path) -> anyhow::Result<()> {
    let sessions = recorder::list_sessions(root)?;
    if sessions.is_empty() {
        println!("no recorded sessions under {}", root.display());
        return Ok(());
    }
    for session in sessions {
        println!("{}  {} entries", session.name, session.entries);
    }
    Ok(())
}

fn init_logging(settings: &Settings) {
    let log_dir = settings.audit_root.join("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "testpilot.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(writer)
        .with_ansi(false)
        .init();
}

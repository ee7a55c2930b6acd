use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_AGENT_BINARY: &str = "claude";
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_PAGE_TEXT_LIMIT: usize = 6_000;
pub const DEFAULT_CONSOLE_TEXT_LIMIT: usize = 2_000;

const PAGE_TEXT_LIMIT_ENV: &str = "TESTPILOT_PAGE_TEXT_LIMIT";
const CONSOLE_TEXT_LIMIT_ENV: &str = "TESTPILOT_CONSOLE_TEXT_LIMIT";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Settings {
    /// Name or path of the external analysis CLI.
    pub agent_binary: String,
    /// Fixed settings file handed to every non-interactive agent invocation.
    pub agent_settings_path: String,
    /// Root directory for audit sessions.
    pub audit_root: PathBuf,
    /// Timeout applied to synchronous agent invocations.
    pub default_timeout_seconds: u64,
    /// WebDriver endpoint for the browser boundary.
    pub webdriver_url: String,
    pub page_text_limit: usize,
    pub console_text_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            agent_binary: DEFAULT_AGENT_BINARY.to_string(),
            agent_settings_path: ".testpilot/agent-settings.json".to_string(),
            audit_root: PathBuf::from(".testpilot/sessions"),
            default_timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            webdriver_url: "http://127.0.0.1:9515".to_string(),
            page_text_limit: DEFAULT_PAGE_TEXT_LIMIT,
            console_text_limit: DEFAULT_CONSOLE_TEXT_LIMIT,
        }
    }
}

impl Settings {
    /// Load settings from a YAML file, falling back to defaults when the file is
    /// absent. Environment overrides win over both.
    pub fn load(path: &Path) -> AppResult<Self> {
        let mut settings = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            serde_yaml::from_str::<Settings>(&text)
                .map_err(|error| AppError::Config(format!("{}: {}", path.display(), error)))?
        } else {
            Settings::default()
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(limit) = env_limit(PAGE_TEXT_LIMIT_ENV) {
            self.page_text_limit = limit;
        }
        if let Some(limit) = env_limit(CONSOLE_TEXT_LIMIT_ENV) {
            self.console_text_limit = limit;
        }
    }
}

fn env_limit(name: &str) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    match parse_limit(&raw) {
        Some(limit) => Some(limit),
        None => {
            tracing::warn!(variable = name, value = %raw, "ignoring unparseable limit override");
            None
        }
    }
}

fn parse_limit(raw: &str) -> Option<usize> {
    let parsed = raw.trim().parse::<usize>().ok()?;
    if parsed == 0 {
        return None;
    }
    Some(parsed)
}

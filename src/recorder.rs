use crate::errors::{AppError, AppResult};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

const SESSION_DIR_PREFIX: &str = "session_";
const LEGACY_LOG_SUFFIX: &str = ".jsonl";
const AUDIT_LOG_NAME: &str = "audit.jsonl";
const MAX_RETAINED_SESSIONS: usize = 5;
const PREVIEW_LIMIT: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStream {
    Stdout,
    Stderr,
}

impl CaptureStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug)]
struct SessionState {
    dir: PathBuf,
    log_path: PathBuf,
    step: u64,
    invocation: u64,
}

/// Append-only audit trail for external tool invocations.
///
/// One enabled session at a time; every entry is a single JSON line with a
/// monotonic step number. Full per-invocation output goes to capture files next
/// to the log so the log itself stays bounded.
#[derive(Debug, Default)]
pub struct Recorder {
    state: Mutex<Option<SessionState>>,
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub name: String,
    pub path: PathBuf,
    pub entries: usize,
    pub modified: Option<SystemTime>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new session under `root`, pruning stale sessions beyond the
    /// retention cap first. Returns the new session directory.
    pub fn enable(&self, root: &Path) -> AppResult<PathBuf> {
        fs::create_dir_all(root)?;
        prune_stale_sessions(root, MAX_RETAINED_SESSIONS - 1);

        let dir = claim_session_dir(root)?;
        let log_path = dir.join(AUDIT_LOG_NAME);

        let mut guard = self.lock_state()?;
        if let Some(previous) = guard.take() {
            tracing::warn!(directory = %previous.dir.display(), "replacing audit session that was never disabled");
        }
        let state = guard.insert(SessionState {
            dir: dir.clone(),
            log_path,
            step: 0,
            invocation: 0,
        });
        append_entry(state, "session_started", json!({ "directory": dir.to_string_lossy() }))?;
        Ok(dir)
    }

    /// Write the closing entry and drop the in-memory session state. Safe to
    /// call when no session is active.
    pub fn disable(&self) -> AppResult<()> {
        let mut guard = self.lock_state()?;
        let Some(state) = guard.as_mut() else {
            return Ok(());
        };
        let total_steps = state.step + 1;
        append_entry(state, "session_closed", json!({ "total_steps": total_steps }))?;
        *guard = None;
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().map(|guard| guard.is_some()).unwrap_or(false)
    }

    pub fn session_dir(&self) -> Option<PathBuf> {
        self.state
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|state| state.dir.clone()))
    }

    /// Append one structured entry. A no-op when no session is active. Long
    /// string fields are truncated to a bounded preview with the omitted length
    /// noted.
    pub fn write_entry(&self, category: &str, data: Value) -> AppResult<()> {
        let mut guard = self.lock_state()?;
        let Some(state) = guard.as_mut() else {
            return Ok(());
        };
        append_entry(state, category, data)
    }

    /// Reserve the next 1-based invocation index and create its (empty) capture
    /// file pair. Returns `None` when no session is active.
    pub fn next_invocation_index(&self) -> Option<u64> {
        let mut guard = self.state.lock().ok()?;
        let state = guard.as_mut()?;
        state.invocation += 1;
        let index = state.invocation;
        for stream in [CaptureStream::Stdout, CaptureStream::Stderr] {
            let path = state.dir.join(capture_file_name(index, stream));
            if let Err(error) = OpenOptions::new().create(true).append(true).open(&path) {
                tracing::warn!(path = %path.display(), error = %error, "failed to create capture file");
            }
        }
        Some(index)
    }

    /// Append raw output text to one capture file of an invocation.
    pub fn append_capture(&self, index: u64, stream: CaptureStream, text: &str) -> AppResult<()> {
        if text.is_empty() {
            return Ok(());
        }
        let path = {
            let guard = self.lock_state()?;
            let Some(state) = guard.as_ref() else {
                return Ok(());
            };
            state.dir.join(capture_file_name(index, stream))
        };
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(text.as_bytes())?;
        Ok(())
    }

    pub fn log_invocation_request(
        &self,
        index: u64,
        command_line: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> AppResult<()> {
        self.write_entry(
            "invocation_request",
            json!({
                "invocation": index,
                "command_line": command_line,
                "args": args,
                "cwd": cwd.map(|path| path.to_string_lossy().to_string()),
            }),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_invocation_response(
        &self,
        index: u64,
        success: bool,
        exit_code: Option<i32>,
        duration_ms: u64,
        stdout: &str,
        stderr: &str,
        error: Option<&str>,
    ) -> AppResult<()> {
        self.write_entry(
            "invocation_response",
            json!({
                "invocation": index,
                "success": success,
                "exit_code": exit_code,
                "duration_ms": duration_ms,
                "stdout": stdout,
                "stderr": stderr,
                "error": error,
            }),
        )
    }

    fn lock_state(&self) -> AppResult<std::sync::MutexGuard<'_, Option<SessionState>>> {
        self.state
            .lock()
            .map_err(|_| AppError::Internal("recorder lock poisoned".to_string()))
    }
}

/// Summaries of the sessions currently on disk, most recent first.
pub fn list_sessions(root: &Path) -> AppResult<Vec<SessionSummary>> {
    let mut sessions = Vec::new();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return Ok(sessions),
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(SESSION_DIR_PREFIX) || !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        let entries_count = fs::read_to_string(path.join(AUDIT_LOG_NAME))
            .map(|text| text.lines().filter(|line| !line.trim().is_empty()).count())
            .unwrap_or(0);
        let modified = entry.metadata().and_then(|meta| meta.modified()).ok();
        sessions.push(SessionSummary {
            name,
            path,
            entries: entries_count,
            modified,
        });
    }
    sessions.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
    Ok(sessions)
}

fn append_entry(state: &mut SessionState, category: &str, data: Value) -> AppResult<()> {
    state.step += 1;
    let entry = json!({
        "step": state.step,
        "ts": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "category": category,
        "data": truncate_payload(data),
    });
    let mut file = OpenOptions::new().create(true).append(true).open(&state.log_path)?;
    file.write_all(entry.to_string().as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

fn claim_session_dir(root: &Path) -> AppResult<PathBuf> {
    let id = session_id_now();
    for attempt in 0..100 {
        let candidate = if attempt == 0 {
            root.join(format!("{SESSION_DIR_PREFIX}{id}"))
        } else {
            root.join(format!("{SESSION_DIR_PREFIX}{id}-{attempt}"))
        };
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(error) => return Err(error.into()),
        }
    }
    Err(AppError::Io(format!(
        "unable to claim a session directory under {}",
        root.display()
    )))
}

fn session_id_now() -> String {
    let now = Utc::now();
    format!(
        "{}-{:03}",
        now.format("%Y%m%d-%H%M%S"),
        now.timestamp_subsec_millis()
    )
}

fn capture_file_name(index: u64, stream: CaptureStream) -> String {
    format!("invocation_{index:03}_{}.txt", stream.as_str())
}

/// Delete session directories (and legacy flat log files) beyond `keep`, oldest
/// first by modification time.
fn prune_stale_sessions(root: &Path, keep: usize) {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    let mut dirs: Vec<(SystemTime, PathBuf)> = Vec::new();
    let mut legacy: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(SESSION_DIR_PREFIX) {
            continue;
        }
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if file_type.is_dir() {
            dirs.push((modified, entry.path()));
        } else if file_type.is_file() && name.ends_with(LEGACY_LOG_SUFFIX) {
            legacy.push((modified, entry.path()));
        }
    }

    for (mut stale, is_dir) in [(dirs, true), (legacy, false)] {
        stale.sort_by(|a, b| b.cmp(a));
        for (_, path) in stale.into_iter().skip(keep) {
            let removed = if is_dir {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(error) = removed {
                tracing::warn!(path = %path.display(), error = %error, "failed to prune stale session");
            }
        }
    }
}

/// Bound every string inside a payload to a preview, keeping the original length
/// visible.
fn truncate_payload(value: Value) -> Value {
    match value {
        Value::String(text) => Value::String(truncate_preview(&text)),
        Value::Array(items) => Value::Array(items.into_iter().map(truncate_payload).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key, truncate_payload(value)))
                .collect(),
        ),
        other => other,
    }
}

pub fn truncate_preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_LIMIT {
        return text.to_string();
    }
    let prefix: String = text.chars().take(PREVIEW_LIMIT).collect();
    let omitted = text.chars().count() - PREVIEW_LIMIT;
    format!("{prefix}... [truncated {omitted} chars]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn read_entries(dir: &Path) -> Vec<Value> {
        let text = fs::read_to_string(dir.join(AUDIT_LOG_NAME)).expect("audit log");
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).expect("valid json line"))
            .collect()
    }

    #[test]
    fn entries_carry_monotonic_steps() {
        let root = tempfile::tempdir().expect("tempdir");
        let recorder = Recorder::new();
        let dir = recorder.enable(root.path()).expect("enable");
        recorder.write_entry("note", json!({ "value": 1 })).expect("entry");
        recorder.write_entry("note", json!({ "value": 2 })).expect("entry");
        recorder.disable().expect("disable");

        let entries = read_entries(&dir);
        assert_eq!(entries.len(), 4);
        let steps: Vec<u64> = entries
            .iter()
            .map(|entry| entry["step"].as_u64().expect("step"))
            .collect();
        assert_eq!(steps, vec![1, 2, 3, 4]);
        assert_eq!(entries[0]["category"], "session_started");
        assert_eq!(entries[3]["category"], "session_closed");
        assert_eq!(entries[3]["data"]["total_steps"], 4);
    }

    #[test]
    fn long_strings_are_truncated_with_omitted_length() {
        let root = tempfile::tempdir().expect("tempdir");
        let recorder = Recorder::new();
        let dir = recorder.enable(root.path()).expect("enable");
        let long = "x".repeat(1_000);
        recorder
            .write_entry("note", json!({ "nested": { "text": long } }))
            .expect("entry");

        let entries = read_entries(&dir);
        let text = entries[1]["data"]["nested"]["text"].as_str().expect("text");
        assert!(text.len() < 500);
        assert!(text.ends_with("[truncated 600 chars]"));
    }

    #[test]
    fn retention_keeps_five_most_recent_sessions() {
        let root = tempfile::tempdir().expect("tempdir");
        let recorder = Recorder::new();
        let mut created = Vec::new();
        for _ in 0..8 {
            created.push(recorder.enable(root.path()).expect("enable"));
            recorder.disable().expect("disable");
            std::thread::sleep(std::time::Duration::from_millis(15));
        }

        let remaining: Vec<String> = fs::read_dir(root.path())
            .expect("read root")
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(remaining.len(), 5);
        for dir in &created[3..] {
            assert!(dir.exists(), "expected recent session {} to survive", dir.display());
        }
        for dir in &created[..3] {
            assert!(!dir.exists(), "expected stale session {} to be pruned", dir.display());
        }
    }

    #[test]
    fn legacy_flat_logs_are_pruned_under_the_same_cap() {
        let root = tempfile::tempdir().expect("tempdir");
        for index in 0..7 {
            let path = root.path().join(format!("session_legacy{index}.jsonl"));
            fs::write(&path, "{}\n").expect("write legacy log");
            std::thread::sleep(std::time::Duration::from_millis(15));
        }

        let recorder = Recorder::new();
        recorder.enable(root.path()).expect("enable");
        recorder.disable().expect("disable");

        let legacy_left = fs::read_dir(root.path())
            .expect("read root")
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .count();
        assert_eq!(legacy_left, 4);
    }

    #[test]
    fn invocation_indices_are_one_based_and_name_capture_pairs() {
        let root = tempfile::tempdir().expect("tempdir");
        let recorder = Recorder::new();
        let dir = recorder.enable(root.path()).expect("enable");

        assert_eq!(recorder.next_invocation_index(), Some(1));
        assert_eq!(recorder.next_invocation_index(), Some(2));
        recorder
            .append_capture(2, CaptureStream::Stdout, "hello\n")
            .expect("capture");

        assert!(dir.join("invocation_001_stdout.txt").exists());
        assert!(dir.join("invocation_001_stderr.txt").exists());
        let captured = fs::read_to_string(dir.join("invocation_002_stdout.txt")).expect("capture file");
        assert_eq!(captured, "hello\n");
    }

    #[test]
    fn disabled_recorder_is_inert() {
        let recorder = Recorder::new();
        assert!(!recorder.is_enabled());
        assert_eq!(recorder.next_invocation_index(), None);
        recorder.write_entry("note", json!({})).expect("no-op entry");
        recorder.disable().expect("no-op disable");
    }
}

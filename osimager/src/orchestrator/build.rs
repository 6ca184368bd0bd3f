//! Build records: the request a caller submits, the states a build moves
//! through, and the snapshot forms served to external readers.

use super::ring::LogRing;
use crate::assembly::{AssemblyOptions, BuildTarget};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

pub type BuildId = String;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Queued,
    Preparing,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

serde_plain::derive_display_from_serialize!(BuildState);
serde_plain::derive_fromstr_from_deserialize!(BuildState);

impl BuildState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildState::Completed
                | BuildState::Failed
                | BuildState::Cancelled
                | BuildState::TimedOut
        )
    }

    /// The CLI exit code for a build that ended in this state; Failed builds
    /// carry their own more specific code.
    pub fn exit_code(self) -> i32 {
        match self {
            BuildState::Completed => 0,
            BuildState::Cancelled => 5,
            BuildState::TimedOut => 6,
            _ => 4,
        }
    }
}

/// What a caller submits to the orchestrator.
#[derive(Clone, Debug)]
pub struct BuildRequest {
    pub target: BuildTarget,
    pub options: AssemblyOptions,
    /// Higher runs first; ties break by submission order.
    pub priority: i64,
    /// Per-build timeout, measured from entering Running.
    pub timeout: Option<Duration>,
    /// Keep the workspace after the build terminates.
    pub keep_workspace: bool,
    pub debug: bool,
    /// Resolve and generate but do not spawn the build tool.
    pub dry_run: bool,
    /// Pass `-force` to the build tool.
    pub force: bool,
    /// Pass `-on-error=<mode>` to the build tool.
    pub on_error: Option<String>,
    /// Pass `-timestamp-ui` to the build tool.
    pub timestamp_ui: bool,
}

impl BuildRequest {
    pub fn new(target: BuildTarget) -> Self {
        Self {
            target,
            options: AssemblyOptions::default(),
            priority: 0,
            timeout: None,
            keep_workspace: false,
            debug: false,
            dry_run: false,
            force: false,
            on_error: None,
            timestamp_ui: false,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Progress {
    pub current_step: String,
    pub step_number: u32,
    pub total_steps: u32,
    pub percent: u8,
}

impl Progress {
    pub fn at(step_number: u32, total_steps: u32, current_step: &str) -> Self {
        Self {
            current_step: current_step.to_string(),
            step_number,
            total_steps,
            percent: ((step_number * 100) / total_steps.max(1)).min(100) as u8,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

serde_plain::derive_display_from_serialize!(LogLevel);

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Orchestrator,
    PackerStdout,
    PackerStderr,
}

#[derive(Clone, Debug, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub source: LogSource,
}

impl LogEntry {
    pub fn now(level: LogLevel, source: LogSource, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            source,
        }
    }
}

/// Guesses a log level from a recognizable line prefix; the build tool's
/// output is free-form, so Info is the default.
pub fn detect_level(line: &str) -> LogLevel {
    let trimmed = line.trim_start();
    let lowered = trimmed.to_ascii_lowercase();
    if lowered.starts_with("error") || lowered.contains("[error]") {
        LogLevel::Error
    } else if lowered.starts_with("warn") || lowered.contains("[warn]") {
        LogLevel::Warn
    } else if lowered.starts_with("debug") || lowered.contains("[debug]") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// An orchestrator-owned build record.  External readers only ever see
/// copied [`BuildSnapshot`]s.
#[derive(Debug)]
pub struct BuildRecord {
    pub id: BuildId,
    pub request: BuildRequest,
    pub state: BuildState,
    pub progress: Option<Progress>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Exit code the CLI should report for a Failed build.
    pub error_exit_code: Option<i32>,
    pub workspace: Option<PathBuf>,
    pub logs: LogRing,
    /// Set to request cooperative cancellation; observed by the worker at
    /// every suspension point.
    pub cancel_tx: watch::Sender<bool>,
    pub cancel_rx: watch::Receiver<bool>,
}

impl BuildRecord {
    pub fn new(id: BuildId, request: BuildRequest, ring_capacity: usize) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            id,
            request,
            state: BuildState::Queued,
            progress: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            error_exit_code: None,
            workspace: None,
            logs: LogRing::new(ring_capacity),
            cancel_tx,
            cancel_rx,
        }
    }

    pub fn snapshot(&self) -> BuildSnapshot {
        BuildSnapshot {
            id: self.id.clone(),
            target: self.request.target.to_string(),
            state: self.state,
            priority: self.request.priority,
            progress: self.progress.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_message: self.error_message.clone(),
            error_exit_code: self.error_exit_code,
            workspace: self.workspace.clone(),
        }
    }
}

/// The copyable view of a build served to queries and events.
#[derive(Clone, Debug, Serialize)]
pub struct BuildSnapshot {
    pub id: BuildId,
    pub target: String,
    pub state: BuildState,
    pub priority: i64,
    pub progress: Option<Progress>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_exit_code: Option<i32>,
    pub workspace: Option<PathBuf>,
}

impl BuildSnapshot {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn state_strings_round_trip() {
        assert_eq!(BuildState::TimedOut.to_string(), "timed_out");
        assert_eq!("queued".parse::<BuildState>().unwrap(), BuildState::Queued);
    }

    #[test]
    fn terminal_states() {
        assert!(BuildState::Completed.is_terminal());
        assert!(BuildState::Cancelled.is_terminal());
        assert!(!BuildState::Running.is_terminal());
        assert!(!BuildState::Queued.is_terminal());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(BuildState::Completed.exit_code(), 0);
        assert_eq!(BuildState::Cancelled.exit_code(), 5);
        assert_eq!(BuildState::TimedOut.exit_code(), 6);
    }

    #[test]
    fn level_detection() {
        assert_eq!(detect_level("Error: no such builder"), LogLevel::Error);
        assert_eq!(detect_level("   WARN something odd"), LogLevel::Warn);
        assert_eq!(detect_level("2024/01/01 ui: [DEBUG] detail"), LogLevel::Debug);
        assert_eq!(detect_level("==> vmware-iso: Uploading"), LogLevel::Info);
    }

    #[test]
    fn progress_percent() {
        assert_eq!(Progress::at(1, 5, "prepare").percent, 20);
        assert_eq!(Progress::at(5, 5, "cleanup").percent, 100);
    }
}

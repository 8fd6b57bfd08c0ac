//! backman-types: Shared domain types for backup tasks and their run history.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// Text layout used for persisted wall-clock timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Text layout used for persisted times of day.
pub const TIME_OF_DAY_FORMAT: &str = "%H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} value: {value:?}")]
pub struct ParseError {
    pub kind: &'static str,
    pub value: String,
}

/// Generates `as_str`, `Display` and `FromStr` for a closed string enum.
macro_rules! string_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(ParseError {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

// ──────────────────── Task Types ────────────────────

/// How often a task repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    /// Every day at the scheduled time.
    Daily,
    /// Every Monday at the scheduled time.
    Weekly,
    /// The 1st of every month at the scheduled time.
    Monthly,
}

string_enum!(Frequency, "frequency", {
    Daily => "daily",
    Weekly => "weekly",
    Monthly => "monthly",
});

/// Lifecycle status of a task as shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
    /// Excluded from scheduling until resumed.
    Paused,
}

string_enum!(TaskStatus, "task status", {
    Idle => "idle",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Paused => "paused",
});

/// A recurring backup job: copy `source_path` into `destination_path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupTask {
    pub id: i64,
    pub name: String,
    pub source_path: String,
    pub destination_path: String,
    pub department: String,
    pub task_type: String,
    #[serde(default)]
    pub remarks: String,
    /// Local time of day the task fires at.
    pub scheduled_time: NaiveTime,
    pub frequency: Frequency,
    pub is_active: bool,
    pub status: TaskStatus,
    pub last_run: Option<NaiveDateTime>,
    pub next_run: Option<NaiveDateTime>,
}

impl BackupTask {
    /// Whether the scheduler should keep a trigger for this task.
    pub fn is_schedulable(&self) -> bool {
        self.is_active && self.status != TaskStatus::Paused
    }
}

/// Operator-supplied fields for creating a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBackupTask {
    pub name: String,
    pub source_path: String,
    pub destination_path: String,
    pub department: String,
    pub task_type: String,
    #[serde(default)]
    pub remarks: String,
    pub scheduled_time: NaiveTime,
    pub frequency: Frequency,
}

// ──────────────────── Run Log Types ────────────────────

/// Status of a single run log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Row opened, outcome not yet known.
    Running,
    Success,
    Failed,
}

string_enum!(RunStatus, "run status", {
    Running => "running",
    Success => "success",
    Failed => "failed",
});

/// One execution attempt of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRun {
    pub id: i64,
    pub task_id: i64,
    pub run_time: NaiveDateTime,
    pub status: RunStatus,
    pub message: String,
    pub files_copied: Option<u64>,
    pub total_size_mb: Option<f64>,
    /// Rendered as `HH:MM:SS`.
    pub duration: Option<String>,
    pub error_details: Option<String>,
}

/// Terminal values written onto a run log row when it is closed.
#[derive(Debug, Clone, PartialEq)]
pub struct RunFinalization {
    pub status: RunStatus,
    pub message: String,
    pub files_copied: Option<u64>,
    pub total_size_mb: Option<f64>,
    pub duration: Option<Duration>,
    pub error_details: Option<String>,
}

impl RunFinalization {
    pub fn success(message: impl Into<String>) -> Self {
        Self::with_status(RunStatus::Success, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::with_status(RunStatus::Failed, message)
    }

    fn with_status(status: RunStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            files_copied: None,
            total_size_mb: None,
            duration: None,
            error_details: None,
        }
    }
}

/// Render a duration as zero-padded `HH:MM:SS`, truncating sub-second parts.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Round a megabyte figure to two decimal places.
pub fn round_mb(mb: f64) -> f64 {
    (mb * 100.0).round() / 100.0
}

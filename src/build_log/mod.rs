//! Hierarchical build log.
//!
//! A [`LogSource`] tree mirrors the command → stage → rule hierarchy. Every
//! observable change goes through a LogSource mutator, which notifies each
//! [`LogSink`] attached to that source or to any of its ancestors with a
//! [`LogEvent`]. Sinks are pure observers: they receive owned event values and
//! never see the sources themselves.
//!
//! For transport across process or network boundaries a subtree is flattened
//! into a [`LogSnapshot`] (full state) or a [`LogDelta`] (changed fields only).

pub mod sinks;
pub mod snapshot;
pub mod source;

pub use sinks::{ConsoleSink, DeltaRecorder, FileSink};
pub use snapshot::{LogDelta, LogSnapshot};
pub use source::LogSource;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution status shared by rules, stages and commands. The serialized
/// strings are part of the report wire protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Waiting,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        [
            Self::Waiting,
            Self::Running,
            Self::Succeeded,
            Self::Failed,
            Self::Skipped,
        ]
        .into_iter()
        .find(|status| status.as_str() == s)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a unit ended `skipped` without running its action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkipReason {
    #[serde(rename = "unchanged")]
    Unchanged,
    #[serde(rename = "dependency failed")]
    DependencyFailed,
    #[serde(rename = "not applicable")]
    NotApplicable,
    #[serde(rename = "previous stage failed")]
    PreviousStageFailed,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::DependencyFailed => "dependency failed",
            Self::NotApplicable => "not applicable",
            Self::PreviousStageFailed => "previous stage failed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a log line, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

/// Which log lines a source records.
///
/// `Silent` keeps errors only, `Normal` drops debug lines, `Verbose` keeps
/// everything and `Inherit` defers to the parent (`Normal` at the root).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Silent,
    Normal,
    Verbose,
    #[default]
    Inherit,
}

impl Verbosity {
    /// Whether a line at `level` passes this (already resolved) verbosity.
    pub fn allows(self, level: LogLevel) -> bool {
        if level == LogLevel::Error {
            return true;
        }
        match self {
            Self::Silent => false,
            Self::Normal | Self::Inherit => level != LogLevel::Debug,
            Self::Verbose => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub time: DateTime<Utc>,
    pub message: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.level.as_str(), self.message)
    }
}

/// A single observable change, named after the mutator that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum LogChange {
    ChildAdded {
        name: String,
    },
    Opened {
        time: DateTime<Utc>,
    },
    Status {
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skip_reason: Option<SkipReason>,
    },
    Exception {
        message: String,
    },
    Line {
        line: LogLine,
    },
    Time {
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    },
    WorkUnit {
        work_unit: u64,
        work_unit_count: u64,
    },
    Closed {
        time: DateTime<Utc>,
    },
}

/// A change plus the identity of the source it originated from: the names
/// on the path from the root to that source, root first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub source: Vec<String>,
    #[serde(flatten)]
    pub change: LogChange,
}

/// Observer of LogSource changes.
///
/// Implementations are called synchronously from the mutator, possibly from
/// several worker threads at once, and must not call back into a LogSource.
pub trait LogSink: Send + Sync {
    fn on_event(&self, event: &LogEvent);
}

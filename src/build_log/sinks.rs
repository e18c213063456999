use super::snapshot::LogDelta;
use super::{LogChange, LogEvent, LogLevel, LogSink, LogSource, Status};
use colored::Colorize;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Human-readable terminal output.
///
/// Prints one line per status transition and per log line, prefixed with
/// the source path below the root.
pub struct ConsoleSink {
    // Serializes writes so lines from concurrent workers never interleave
    out: Mutex<()>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self {
            out: Mutex::new(()),
        }
    }

    fn label(&self, event: &LogEvent) -> String {
        if event.source.len() <= 1 {
            return String::new();
        }
        format!("{} ", event.source[1..].join(" / ").bold())
    }

    fn format(&self, event: &LogEvent) -> Option<String> {
        let label = self.label(event);
        match &event.change {
            LogChange::Opened { .. } => Some(format!("{}{}", label, "started".cyan())),
            LogChange::Status {
                status,
                skip_reason,
            } => {
                let text = match (status, skip_reason) {
                    (Status::Succeeded, _) => "succeeded".green(),
                    (Status::Failed, _) => "failed".red().bold(),
                    (Status::Skipped, Some(reason)) => {
                        format!("skipped ({})", reason).yellow()
                    }
                    (Status::Skipped, None) => "skipped".yellow(),
                    _ => return None,
                };
                Some(format!("{}{}", label, text))
            }
            LogChange::Exception { message } => {
                Some(format!("{}{} {}", label, "error:".red().bold(), message))
            }
            LogChange::Line { line } => {
                let level = match line.level {
                    LogLevel::Debug => line.level.as_str().dimmed(),
                    LogLevel::Info => line.level.as_str().normal(),
                    LogLevel::Warning => line.level.as_str().yellow(),
                    LogLevel::Error => line.level.as_str().red(),
                };
                Some(format!("{}[{}] {}", label, level, line.message))
            }
            _ => None,
        }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for ConsoleSink {
    fn on_event(&self, event: &LogEvent) {
        if let Some(text) = self.format(event) {
            let _guard = self.out.lock();
            println!("{}", text);
        }
    }
}

/// Appends every event as one JSON object per line.
pub struct FileSink {
    writer: Mutex<BufWriter<File>>,
}

impl FileSink {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.writer.lock().flush()
    }
}

impl LogSink for FileSink {
    fn on_event(&self, event: &LogEvent) {
        let mut writer = self.writer.lock();
        let written = serde_json::to_writer(&mut *writer, event)
            .map_err(std::io::Error::from)
            .and_then(|_| writer.write_all(b"\n"));
        if let Err(e) = written {
            tracing::warn!(error = %e, "Failed to write build log event");
        }
    }
}

/// Accumulates events into a [`LogDelta`] until taken.
///
/// Event paths are interpreted relative to the source the recorder is
/// anchored at; events from outside that subtree are ignored.
pub struct DeltaRecorder {
    anchor: Vec<String>,
    pending: Mutex<LogDelta>,
}

impl DeltaRecorder {
    /// Recorder for a sink attached to a root source.
    pub fn new() -> Self {
        Self {
            anchor: Vec::new(),
            pending: Mutex::new(LogDelta::default()),
        }
    }

    /// Recorder whose deltas are relative to `source`.
    pub fn anchored_at(source: &LogSource) -> Self {
        Self {
            anchor: source.path(),
            pending: Mutex::new(LogDelta::default()),
        }
    }

    /// Returns everything recorded since the last call, or `None` when
    /// nothing changed.
    pub fn take(&self) -> Option<LogDelta> {
        let delta = std::mem::take(&mut *self.pending.lock());
        if delta.is_empty() {
            None
        } else {
            Some(delta)
        }
    }

    /// Puts back a delta that could not be delivered, ahead of anything
    /// recorded since it was taken.
    pub fn restore(&self, earlier: LogDelta) {
        let mut pending = self.pending.lock();
        let later = std::mem::replace(&mut *pending, earlier);
        pending.merge(later);
    }

    fn relative<'a>(&self, source: &'a [String]) -> Option<&'a [String]> {
        if self.anchor.is_empty() {
            // Unanchored: the first element is the root itself
            return source.get(1..);
        }
        source.strip_prefix(self.anchor.as_slice())
    }
}

impl Default for DeltaRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for DeltaRecorder {
    fn on_event(&self, event: &LogEvent) {
        if let Some(path) = self.relative(&event.source) {
            self.pending.lock().record(path, &event.change);
        }
    }
}

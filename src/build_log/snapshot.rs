use super::{LogChange, LogLine, SkipReason, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Full state of a LogSource subtree, as stored by the report server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogSnapshot {
    pub name: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    #[serde(default)]
    pub output: Vec<LogLine>,
    #[serde(default)]
    pub work_unit: u64,
    #[serde(default)]
    pub work_unit_count: u64,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub children: BTreeMap<String, LogSnapshot>,
}

/// Fields of a subtree that changed since the previous delta.
///
/// `output` holds only lines appended since then. A child that appears in
/// `children` but carries no other field was merely added.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<LogLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_unit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_unit_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, LogDelta>,
}

impl LogDelta {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Folds a later delta into this one. Scalars from `later` win, output
    /// lines are appended.
    pub fn merge(&mut self, later: LogDelta) {
        if later.status.is_some() {
            self.status = later.status;
            self.skip_reason = later.skip_reason;
        }
        if later.start_time.is_some() {
            self.start_time = later.start_time;
        }
        if later.end_time.is_some() {
            self.end_time = later.end_time;
        }
        if later.exception.is_some() {
            self.exception = later.exception;
        }
        self.output.extend(later.output);
        if later.work_unit.is_some() {
            self.work_unit = later.work_unit;
        }
        if later.work_unit_count.is_some() {
            self.work_unit_count = later.work_unit_count;
        }
        if later.closed.is_some() {
            self.closed = later.closed;
        }
        for (name, child) in later.children {
            self.children.entry(name).or_default().merge(child);
        }
    }

    /// Records a change originating at `path`, relative to this delta's own
    /// source (an empty path is this source).
    pub fn record(&mut self, path: &[String], change: &LogChange) {
        if let Some((first, rest)) = path.split_first() {
            self.children.entry(first.clone()).or_default().record(rest, change);
            return;
        }
        match change {
            LogChange::ChildAdded { name } => {
                self.children.entry(name.clone()).or_default();
            }
            LogChange::Opened { time } => {
                self.status = Some(Status::Running);
                self.skip_reason = None;
                self.start_time = Some(*time);
            }
            LogChange::Status {
                status,
                skip_reason,
            } => {
                self.status = Some(*status);
                self.skip_reason = *skip_reason;
            }
            LogChange::Exception { message } => self.exception = Some(message.clone()),
            LogChange::Line { line } => self.output.push(line.clone()),
            LogChange::Time {
                start_time,
                end_time,
            } => {
                if start_time.is_some() {
                    self.start_time = *start_time;
                }
                if end_time.is_some() {
                    self.end_time = *end_time;
                }
            }
            LogChange::WorkUnit {
                work_unit,
                work_unit_count,
            } => {
                self.work_unit = Some(*work_unit);
                self.work_unit_count = Some(*work_unit_count);
            }
            LogChange::Closed { time } => {
                self.closed = Some(true);
                if self.end_time.is_none() {
                    self.end_time = Some(*time);
                }
            }
        }
    }
}

impl LogSnapshot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Applies a delta in place. Used by the report server to keep the
    /// stored snapshot current.
    pub fn apply(&mut self, delta: &LogDelta) {
        if let Some(status) = delta.status {
            self.status = status;
            self.skip_reason = delta.skip_reason;
        }
        if delta.start_time.is_some() {
            self.start_time = delta.start_time;
        }
        if delta.end_time.is_some() {
            self.end_time = delta.end_time;
        }
        if delta.exception.is_some() {
            self.exception = delta.exception.clone();
        }
        self.output.extend(delta.output.iter().cloned());
        if let Some(work_unit) = delta.work_unit {
            self.work_unit = work_unit;
        }
        if let Some(count) = delta.work_unit_count {
            self.work_unit_count = count;
        }
        if let Some(closed) = delta.closed {
            self.closed = closed;
        }
        for (name, child_delta) in &delta.children {
            self.children
                .entry(name.clone())
                .or_insert_with(|| LogSnapshot::new(name.clone()))
                .apply(child_delta);
        }
    }

    /// Delta that turns `previous` into `self`. Output is treated as
    /// append-only.
    pub fn diff(&self, previous: &LogSnapshot) -> LogDelta {
        let mut delta = LogDelta::default();
        if self.status != previous.status || self.skip_reason != previous.skip_reason {
            delta.status = Some(self.status);
            delta.skip_reason = self.skip_reason;
        }
        if self.start_time != previous.start_time {
            delta.start_time = self.start_time;
        }
        if self.end_time != previous.end_time {
            delta.end_time = self.end_time;
        }
        if self.exception != previous.exception {
            delta.exception = self.exception.clone();
        }
        if self.output.len() > previous.output.len() {
            delta.output = self.output[previous.output.len()..].to_vec();
        }
        if self.work_unit != previous.work_unit {
            delta.work_unit = Some(self.work_unit);
        }
        if self.work_unit_count != previous.work_unit_count {
            delta.work_unit_count = Some(self.work_unit_count);
        }
        if self.closed != previous.closed {
            delta.closed = Some(self.closed);
        }
        for (name, child) in &self.children {
            match previous.children.get(name) {
                Some(before) => {
                    let child_delta = child.diff(before);
                    if !child_delta.is_empty() {
                        delta.children.insert(name.clone(), child_delta);
                    }
                }
                None => {
                    delta
                        .children
                        .insert(name.clone(), child.diff(&LogSnapshot::new(name.clone())));
                }
            }
        }
        delta
    }

    /// Looks up a descendant by its path below this snapshot.
    pub fn find(&self, path: &[&str]) -> Option<&LogSnapshot> {
        match path.split_first() {
            None => Some(self),
            Some((first, rest)) => self.children.get(*first)?.find(rest),
        }
    }

    /// True once the snapshot and every descendant reached a terminal status.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal() && self.children.values().all(|c| c.is_finished())
    }
}

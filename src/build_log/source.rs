use super::snapshot::{LogDelta, LogSnapshot};
use super::{LogChange, LogEvent, LogLevel, LogLine, LogSink, SkipReason, Status, Verbosity};
use crate::error::LogSourceError;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

#[derive(Debug, Default)]
struct SourceState {
    status: Status,
    skip_reason: Option<SkipReason>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    exception: Option<String>,
    output: Vec<LogLine>,
    work_unit: u64,
    work_unit_count: u64,
    closed: bool,
}

/// One node of the build log tree.
///
/// Sources are always handled through `Arc`. Ownership runs top-down: a
/// parent owns its children, a child only keeps a weak back-reference. The
/// mutators are the single entry point for state changes; each one updates
/// the state and notifies sinks while holding the node's lock, so sinks see
/// the changes of one source in the order they were applied even when many
/// workers write concurrently.
pub struct LogSource {
    name: String,
    parent: Weak<LogSource>,
    verbosity: RwLock<Verbosity>,
    state: Mutex<SourceState>,
    children: Mutex<Vec<Arc<LogSource>>>,
    sinks: RwLock<Vec<Arc<dyn LogSink>>>,
}

impl std::fmt::Debug for LogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSource")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

impl LogSource {
    pub fn root(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name.into(), Weak::new()))
    }

    fn new(name: String, parent: Weak<LogSource>) -> Self {
        Self {
            name,
            parent,
            verbosity: RwLock::new(Verbosity::Inherit),
            state: Mutex::new(SourceState::default()),
            children: Mutex::new(Vec::new()),
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// Returns the child with the given name, creating it if needed.
    ///
    /// A closed source gains no children. The source returned in that case
    /// is detached from the tree, so its changes reach no sink.
    pub fn child(self: &Arc<Self>, name: impl Into<String>) -> Arc<LogSource> {
        let name = name.into();
        let state = self.state.lock();
        let mut children = self.children.lock();
        if let Some(existing) = children.iter().find(|c| c.name == name) {
            return existing.clone();
        }
        if state.closed {
            tracing::warn!(source = %self.name, child = %name, "Ignoring child of a closed log source");
            return Arc::new(Self::new(name, Weak::new()));
        }
        let child = Arc::new(Self::new(name.clone(), Arc::downgrade(self)));
        children.push(child.clone());
        drop(children);
        self.emit(LogChange::ChildAdded { name });
        child
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<Arc<LogSource>> {
        self.parent.upgrade()
    }

    pub fn children(&self) -> Vec<Arc<LogSource>> {
        self.children.lock().clone()
    }

    pub fn find_child(&self, name: &str) -> Option<Arc<LogSource>> {
        self.children.lock().iter().find(|c| c.name == name).cloned()
    }

    /// Names from the root down to this source.
    pub fn path(&self) -> Vec<String> {
        let mut path = vec![self.name.clone()];
        let mut current = self.parent.upgrade();
        while let Some(node) = current {
            path.push(node.name.clone());
            current = node.parent.upgrade();
        }
        path.reverse();
        path
    }

    pub fn set_verbosity(&self, verbosity: Verbosity) {
        *self.verbosity.write() = verbosity;
    }

    /// Own verbosity, or the nearest ancestor's when set to `Inherit`.
    pub fn effective_verbosity(&self) -> Verbosity {
        let own = *self.verbosity.read();
        if own != Verbosity::Inherit {
            return own;
        }
        match self.parent.upgrade() {
            Some(parent) => parent.effective_verbosity(),
            None => Verbosity::Normal,
        }
    }

    /// Attaches a sink. It receives every later change of this source and of
    /// its descendants, and immediately gets this source's buffered output.
    pub fn add_sink(&self, sink: Arc<dyn LogSink>) {
        let state = self.state.lock();
        {
            let mut sinks = self.sinks.write();
            if sinks.iter().any(|s| same_sink(s, &sink)) {
                return;
            }
            sinks.push(sink.clone());
        }
        let source = self.path();
        for line in &state.output {
            sink.on_event(&LogEvent {
                source: source.clone(),
                change: LogChange::Line { line: line.clone() },
            });
        }
    }

    // Must be called with `self.state` held so events stay ordered per source.
    fn emit(&self, change: LogChange) {
        let event = LogEvent {
            source: self.path(),
            change,
        };
        let mut targets: Vec<Arc<dyn LogSink>> = self.sinks.read().clone();
        let mut current = self.parent.upgrade();
        while let Some(node) = current {
            for sink in node.sinks.read().iter() {
                if !targets.iter().any(|s| same_sink(s, sink)) {
                    targets.push(sink.clone());
                }
            }
            current = node.parent.upgrade();
        }
        for sink in targets {
            sink.on_event(&event);
        }
    }

    fn mutate(&self, apply: impl FnOnce(&mut SourceState) -> Option<LogChange>) {
        let mut state = self.state.lock();
        if state.closed {
            tracing::warn!(source = %self.name, "Ignoring change to a closed log source");
            return;
        }
        if let Some(change) = apply(&mut state) {
            self.emit(change);
        }
    }

    /// Marks the unit as running and stamps its start time.
    pub fn open(&self) {
        self.mutate(|state| {
            let time = *state.start_time.get_or_insert_with(Utc::now);
            state.status = Status::Running;
            Some(LogChange::Opened { time })
        });
    }

    pub fn set_status(&self, status: Status) {
        self.mutate(|state| {
            state.status = status;
            if status != Status::Skipped {
                state.skip_reason = None;
            }
            if status.is_terminal() && state.end_time.is_none() {
                state.end_time = Some(Utc::now());
            }
            Some(LogChange::Status {
                status,
                skip_reason: state.skip_reason,
            })
        });
    }

    /// Sets status `skipped` together with the reason it was skipped.
    pub fn set_skipped(&self, reason: SkipReason) {
        self.mutate(|state| {
            state.status = Status::Skipped;
            state.skip_reason = Some(reason);
            if state.end_time.is_none() {
                state.end_time = Some(Utc::now());
            }
            Some(LogChange::Status {
                status: Status::Skipped,
                skip_reason: Some(reason),
            })
        });
    }

    pub fn set_exception(&self, message: impl Into<String>) {
        let message = message.into();
        self.mutate(|state| {
            state.exception = Some(message.clone());
            Some(LogChange::Exception { message })
        });
    }

    /// Records a line if it passes the effective verbosity. Errors always pass.
    pub fn append_line(&self, level: LogLevel, message: impl Into<String>) {
        if !self.effective_verbosity().allows(level) {
            return;
        }
        let line = LogLine {
            level,
            time: Utc::now(),
            message: message.into(),
        };
        self.mutate(|state| {
            state.output.push(line.clone());
            Some(LogChange::Line { line })
        });
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.append_line(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.append_line(LogLevel::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.append_line(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.append_line(LogLevel::Error, message);
    }

    pub fn set_time(&self, start_time: Option<DateTime<Utc>>, end_time: Option<DateTime<Utc>>) {
        self.mutate(|state| {
            if start_time.is_some() {
                state.start_time = start_time;
            }
            if end_time.is_some() {
                state.end_time = end_time;
            }
            Some(LogChange::Time {
                start_time: state.start_time,
                end_time: state.end_time,
            })
        });
    }

    pub fn set_work_unit(&self, work_unit: u64, work_unit_count: u64) {
        self.mutate(|state| {
            state.work_unit = work_unit;
            state.work_unit_count = work_unit_count;
            Some(LogChange::WorkUnit {
                work_unit,
                work_unit_count,
            })
        });
    }

    /// Closes the source. Every child must already be closed and the status
    /// must be terminal.
    pub fn close(&self) -> Result<(), LogSourceError> {
        let open = self
            .children
            .lock()
            .iter()
            .filter(|c| !c.is_closed())
            .count();
        if open > 0 {
            return Err(LogSourceError::OpenChildren {
                name: self.name.clone(),
                open,
            });
        }

        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        if !state.status.is_terminal() {
            return Err(LogSourceError::NonTerminalStatus {
                name: self.name.clone(),
                status: state.status,
            });
        }
        state.closed = true;
        let time = *state.end_time.get_or_insert_with(Utc::now);
        self.emit(LogChange::Closed { time });
        Ok(())
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        self.state.lock().skip_reason
    }

    pub fn exception(&self) -> Option<String> {
        self.state.lock().exception.clone()
    }

    pub fn output(&self) -> Vec<LogLine> {
        self.state.lock().output.clone()
    }

    pub fn work_unit(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.work_unit, state.work_unit_count)
    }

    pub fn times(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let state = self.state.lock();
        (state.start_time, state.end_time)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Full state of this subtree.
    pub fn snapshot(&self) -> LogSnapshot {
        let children: BTreeMap<String, LogSnapshot> = self
            .children()
            .iter()
            .map(|c| (c.name.clone(), c.snapshot()))
            .collect();
        let state = self.state.lock();
        LogSnapshot {
            name: self.name.clone(),
            status: state.status,
            skip_reason: state.skip_reason,
            start_time: state.start_time,
            end_time: state.end_time,
            exception: state.exception.clone(),
            output: state.output.clone(),
            work_unit: state.work_unit,
            work_unit_count: state.work_unit_count,
            closed: state.closed,
            children,
        }
    }

    /// Replays a delta produced elsewhere (typically by a worker process)
    /// into this live subtree through the regular mutators, so local sinks
    /// observe it like any other change. Children are applied before the
    /// `closed` flag so the hierarchy invariant holds.
    pub fn apply_delta(self: &Arc<Self>, delta: &LogDelta) -> Result<(), LogSourceError> {
        if delta.start_time.is_some() || delta.end_time.is_some() {
            self.set_time(delta.start_time, delta.end_time);
        }
        if let Some(message) = &delta.exception {
            self.set_exception(message.clone());
        }
        if let (Some(work_unit), Some(count)) = (delta.work_unit, delta.work_unit_count) {
            self.set_work_unit(work_unit, count);
        } else if delta.work_unit.is_some() || delta.work_unit_count.is_some() {
            let (unit, count) = self.work_unit();
            self.set_work_unit(
                delta.work_unit.unwrap_or(unit),
                delta.work_unit_count.unwrap_or(count),
            );
        }
        for line in &delta.output {
            // Bypass verbosity: the producer already filtered these lines
            let line = line.clone();
            self.mutate(|state| {
                state.output.push(line.clone());
                Some(LogChange::Line { line })
            });
        }
        match (delta.status, delta.skip_reason) {
            (Some(Status::Skipped), Some(reason)) => self.set_skipped(reason),
            (Some(status), _) => self.set_status(status),
            (None, _) => {}
        }
        for (name, child_delta) in &delta.children {
            self.child(name.clone()).apply_delta(child_delta)?;
        }
        if delta.closed == Some(true) {
            self.close()?;
        }
        Ok(())
    }
}

fn same_sink(a: &Arc<dyn LogSink>, b: &Arc<dyn LogSink>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

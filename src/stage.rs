//! Commands as ordered stage sequences.
//!
//! A stage only starts when the previous stage ended `succeeded` or
//! `skipped`. After a failure every remaining stage is marked skipped
//! without building its graph.

use crate::build_log::{LogSource, SkipReason, Status};
use crate::log_stage_complete;
use crate::scheduler::{ScheduleReport, Scheduler};
use crate::session::BuildSession;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Selects which action the scheduler applies to each rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    Clean,
    Build,
    Test,
    Deploy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub purpose: Purpose,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, purpose: Purpose) -> Self {
        Self {
            name: name.into(),
            purpose,
        }
    }
}

/// User-facing commands and the stages they expand to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Build,
    Test,
    Clean,
    Rebuild,
    Deploy,
}

impl Command {
    pub fn name(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Test => "test",
            Self::Clean => "clean",
            Self::Rebuild => "rebuild",
            Self::Deploy => "deploy",
        }
    }

    pub fn stages(self) -> Vec<StageSpec> {
        let build = StageSpec::new("build", Purpose::Build);
        match self {
            Self::Build => vec![build],
            Self::Test => vec![build, StageSpec::new("test", Purpose::Test)],
            Self::Clean => vec![StageSpec::new("clean", Purpose::Clean)],
            Self::Rebuild => vec![StageSpec::new("clean", Purpose::Clean), build],
            Self::Deploy => vec![build, StageSpec::new("deploy", Purpose::Deploy)],
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub name: String,
    pub purpose: Purpose,
    pub status: Status,
    pub skip_reason: Option<SkipReason>,
    /// Present when the stage's scheduler ran.
    pub report: Option<ScheduleReport>,
    /// Graph construction error that aborted the stage.
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub stages: Vec<StageOutcome>,
    pub result: Status,
}

impl CommandOutcome {
    pub fn stage(&self, name: &str) -> Option<&StageOutcome> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn exit_code(&self) -> i32 {
        if self.result == Status::Failed {
            1
        } else {
            0
        }
    }
}

/// Same rule at every level: any failure fails, any success succeeds,
/// otherwise skipped.
pub fn aggregate_status(statuses: impl IntoIterator<Item = Status>) -> Status {
    let mut result = Status::Skipped;
    for status in statuses {
        match status {
            Status::Failed => return Status::Failed,
            Status::Succeeded => result = Status::Succeeded,
            _ => {}
        }
    }
    result
}

pub struct StageManager {
    session: Arc<BuildSession>,
    log: Arc<LogSource>,
}

impl StageManager {
    /// `log` is the command's root LogSource.
    pub fn new(session: Arc<BuildSession>, log: Arc<LogSource>) -> Self {
        Self { session, log }
    }

    pub fn log(&self) -> &Arc<LogSource> {
        &self.log
    }

    pub async fn run(&self, stages: &[StageSpec]) -> CommandOutcome {
        self.log.open();
        let mut outcomes: Vec<StageOutcome> = Vec::with_capacity(stages.len());

        for spec in stages {
            let stage_log = self.log.child(spec.name.clone());
            let previous_failed = outcomes.iter().any(|o| o.status == Status::Failed);
            let outcome = if previous_failed {
                stage_log.set_skipped(SkipReason::PreviousStageFailed);
                tracing::info!(stage = %spec.name, "Skipping stage after earlier failure");
                StageOutcome {
                    name: spec.name.clone(),
                    purpose: spec.purpose,
                    status: Status::Skipped,
                    skip_reason: Some(SkipReason::PreviousStageFailed),
                    report: None,
                    error: None,
                }
            } else {
                self.run_stage(spec, &stage_log).await
            };
            if let Err(e) = stage_log.close() {
                tracing::warn!(stage = %spec.name, error = %e, "Could not close stage log");
            }
            outcomes.push(outcome);
        }

        let result = aggregate_status(outcomes.iter().map(|o| o.status));
        self.log.set_status(result);
        if let Err(e) = self.log.close() {
            tracing::warn!(error = %e, "Could not close command log");
        }
        CommandOutcome {
            stages: outcomes,
            result,
        }
    }

    async fn run_stage(&self, spec: &StageSpec, stage_log: &Arc<LogSource>) -> StageOutcome {
        stage_log.open();
        let graph = match self.session.build_graph() {
            Ok(graph) => Arc::new(graph),
            Err(e) => {
                let message = e.to_string();
                tracing::error!(stage = %spec.name, error = %message, "Dependency graph failed");
                stage_log.error(message.clone());
                stage_log.set_exception(message.clone());
                stage_log.set_status(Status::Failed);
                return StageOutcome {
                    name: spec.name.clone(),
                    purpose: spec.purpose,
                    status: Status::Failed,
                    skip_reason: None,
                    report: None,
                    error: Some(message),
                };
            }
        };

        let scheduler = Scheduler::new(self.session.clone(), spec.purpose, stage_log.clone());
        let report = scheduler.run(graph).await;
        let status = report.aggregate();
        log_stage_complete!(spec.name, status, report.metrics);

        let skip_reason = if status == Status::Skipped {
            let reason = report.skip_reason();
            stage_log.set_skipped(reason);
            Some(reason)
        } else {
            stage_log.set_status(status);
            None
        };
        StageOutcome {
            name: spec.name.clone(),
            purpose: spec.purpose,
            status,
            skip_reason,
            report: Some(report),
            error: None,
        }
    }
}

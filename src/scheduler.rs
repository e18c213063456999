//! Caching, parallel execution of one frozen dependency graph.
//!
//! The dispatch loop owns the node-state table and is its only writer.
//! Rule actions run on blocking worker threads and hand back a
//! [`WorkResult`]; the loop folds each result into the table before it
//! computes the next set of runnable rules. Failures travel through the
//! table as values, so one failing rule only skips what depends on it.

use crate::build_log::{LogSource, SkipReason, Status};
use crate::cache::RuleCache;
use crate::context::{BuildEnv, RuleContext};
use crate::error::RuleActionError;
use crate::graph::{DependencyGraph, NodeId};
use crate::logging::StageMetrics;
use crate::rule::Rule;
use crate::rules::RuleAction;
use crate::session::BuildSession;
use crate::stage::{aggregate_status, Purpose};
use crate::{log_rule_failed, log_rule_skipped, log_rule_started};
use anyhow::Context;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;

/// Terminal state of one rule after a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    pub identity: String,
    pub status: Status,
    pub skip_reason: Option<SkipReason>,
    pub error: Option<RuleActionError>,
    pub outputs: Vec<PathBuf>,
    pub duration_ms: u64,
}

impl RuleOutcome {
    fn blocks_dependents(&self) -> bool {
        self.status == Status::Failed || self.skip_reason == Some(SkipReason::DependencyFailed)
    }
}

/// Result of executing every node of a graph.
#[derive(Debug, Clone)]
pub struct ScheduleReport {
    /// Indexed by `NodeId`.
    pub outcomes: Vec<RuleOutcome>,
    pub failed: BTreeSet<String>,
    pub metrics: StageMetrics,
}

impl ScheduleReport {
    pub fn outcome(&self, identity: &str) -> Option<&RuleOutcome> {
        self.outcomes.iter().find(|o| o.identity == identity)
    }

    /// `failed` if any rule failed, `succeeded` if any rule ran, otherwise
    /// `skipped`.
    pub fn aggregate(&self) -> Status {
        aggregate_status(self.outcomes.iter().map(|o| o.status))
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Why a stage whose rules all ended skipped was skipped: `unchanged`
    /// when at least one rule was a cache hit, otherwise `not applicable`.
    pub fn skip_reason(&self) -> SkipReason {
        if self.metrics.cache_hits > 0 {
            SkipReason::Unchanged
        } else {
            SkipReason::NotApplicable
        }
    }
}

/// What a worker reports back for its rule.
#[derive(Debug)]
enum WorkResult {
    Succeeded(Vec<PathBuf>),
    CacheHit(Vec<PathBuf>),
    NotApplicable(Vec<PathBuf>),
    Failed(RuleActionError),
}

/// Everything a worker needs, owned so it can move to a blocking thread.
struct WorkerJob {
    rule: Arc<Rule>,
    action: Option<Arc<dyn RuleAction>>,
    purpose: Purpose,
    env: Arc<BuildEnv>,
    cache: Arc<dyn RuleCache>,
    force: bool,
    is_target: bool,
    deploy_dir: Option<PathBuf>,
    dep_outputs: HashMap<String, Vec<PathBuf>>,
    log: Arc<LogSource>,
}

enum NodeState {
    Waiting,
    Running,
    Done(RuleOutcome),
}

pub struct Scheduler {
    session: Arc<BuildSession>,
    purpose: Purpose,
    stage_name: String,
    log: Arc<LogSource>,
}

impl Scheduler {
    /// `log` is the stage's LogSource; one child is created per rule.
    pub fn new(session: Arc<BuildSession>, purpose: Purpose, log: Arc<LogSource>) -> Self {
        Self {
            session,
            purpose,
            stage_name: log.name().to_string(),
            log,
        }
    }

    /// Runs every node to a terminal state and reports the outcome.
    pub async fn run(&self, graph: Arc<DependencyGraph>) -> ScheduleReport {
        let started = Instant::now();
        let jobs = self.session.jobs.max(1);
        let count = graph.len();

        let rule_logs: Vec<Arc<LogSource>> = graph
            .rules()
            .map(|rule| self.log.child(rule.identity()))
            .collect();
        let mut states: Vec<NodeState> = (0..count).map(|_| NodeState::Waiting).collect();
        let mut remaining: Vec<usize> = (0..count).map(|id| graph.dependencies(id).len()).collect();
        let mut ready: VecDeque<NodeId> = VecDeque::new();
        let mut initial: Vec<NodeId> = (0..count).filter(|&id| remaining[id] == 0).collect();
        self.sort_batch(&graph, &mut initial);
        ready.extend(initial);

        let mut join_set: JoinSet<(NodeId, Result<WorkResult, tokio::task::JoinError>)> =
            JoinSet::new();
        let mut in_flight = 0usize;
        let mut finished = 0usize;

        tracing::debug!(stage = %self.stage_name, rules = count, jobs, "Scheduling stage");

        if self.purpose == Purpose::Deploy && self.session.clean_deploy {
            self.clear_deploy_dir();
        }

        while finished < count {
            while in_flight < jobs {
                let Some(id) = ready.pop_front() else { break };
                let blocked = graph.dependencies(id).iter().any(|&dep| {
                    matches!(&states[dep], NodeState::Done(o) if o.blocks_dependents())
                });
                if blocked {
                    let outcome = self.skip_for_failed_dependency(&graph, id, &rule_logs[id]);
                    finished += 1;
                    self.complete(&graph, id, outcome, &mut states, &mut remaining, &mut ready);
                    continue;
                }

                let job = self.job_for(&graph, id, &states, rule_logs[id].clone());
                log_rule_started!(self.stage_name, job.rule.identity());
                states[id] = NodeState::Running;
                in_flight += 1;
                join_set.spawn(async move {
                    let result = tokio::task::spawn_blocking(move || run_worker(job)).await;
                    (id, result)
                });
            }

            if in_flight == 0 {
                if ready.is_empty() {
                    // Nothing runnable and nothing running: remaining nodes
                    // can never start.
                    break;
                }
                continue;
            }

            match join_set.join_next().await {
                Some(Ok((id, result))) => {
                    in_flight -= 1;
                    finished += 1;
                    let result = result.unwrap_or_else(|e| {
                        WorkResult::Failed(RuleActionError {
                            rule: graph.rule(id).identity(),
                            message: format!("worker panicked: {}", e),
                        })
                    });
                    let outcome = self.record_result(&graph, id, result, &rule_logs[id]);
                    self.complete(&graph, id, outcome, &mut states, &mut remaining, &mut ready);
                }
                Some(Err(e)) => {
                    in_flight -= 1;
                    tracing::error!(stage = %self.stage_name, error = %e, "Worker task lost");
                }
                None => break,
            }
        }

        // Only reachable if a worker task was lost
        for (id, state) in states.iter_mut().enumerate() {
            if !matches!(state, NodeState::Done(_)) {
                let identity = graph.rule(id).identity();
                let message = "rule never reached a terminal state".to_string();
                rule_logs[id].set_exception(message.clone());
                rule_logs[id].set_status(Status::Failed);
                close_rule_log(&rule_logs[id]);
                *state = NodeState::Done(RuleOutcome {
                    identity: identity.clone(),
                    status: Status::Failed,
                    skip_reason: None,
                    error: Some(RuleActionError {
                        rule: identity,
                        message,
                    }),
                    outputs: Vec::new(),
                    duration_ms: 0,
                });
            }
        }

        let outcomes: Vec<RuleOutcome> = states
            .into_iter()
            .filter_map(|state| match state {
                NodeState::Done(outcome) => Some(outcome),
                _ => None,
            })
            .collect();
        let mut metrics = StageMetrics::new(count);
        let mut failed = BTreeSet::new();
        for outcome in &outcomes {
            match (outcome.status, outcome.skip_reason) {
                (Status::Succeeded, _) => metrics.executed += 1,
                (Status::Failed, _) => {
                    metrics.failures += 1;
                    failed.insert(outcome.identity.clone());
                }
                (Status::Skipped, Some(SkipReason::Unchanged)) => metrics.cache_hits += 1,
                (Status::Skipped, Some(SkipReason::DependencyFailed)) => {
                    metrics.dependency_skips += 1
                }
                _ => metrics.not_applicable += 1,
            }
        }
        metrics.duration_ms = started.elapsed().as_millis() as u64;

        ScheduleReport {
            outcomes,
            failed,
            metrics,
        }
    }

    fn clear_deploy_dir(&self) {
        let Some(dir) = self.session.deploy_dir.as_deref() else {
            return;
        };
        if !dir.exists() {
            return;
        }
        match std::fs::remove_dir_all(dir) {
            Ok(()) => {
                tracing::info!(stage = %self.stage_name, dir = %dir.display(), "Cleared deploy directory");
                self.log.debug(format!("cleared {}", dir.display()));
            }
            Err(e) => {
                tracing::warn!(stage = %self.stage_name, dir = %dir.display(), error = %e, "Could not clear deploy directory");
                self.log.warning(format!("could not clear {}: {}", dir.display(), e));
            }
        }
    }

    fn sort_batch(&self, graph: &DependencyGraph, batch: &mut [NodeId]) {
        batch.sort_by_cached_key(|&id| graph.rule(id).identity());
    }

    fn job_for(
        &self,
        graph: &DependencyGraph,
        id: NodeId,
        states: &[NodeState],
        log: Arc<LogSource>,
    ) -> WorkerJob {
        let dep_outputs = graph
            .dependencies(id)
            .into_iter()
            .filter_map(|dep| match &states[dep] {
                NodeState::Done(o) => Some((o.identity.clone(), o.outputs.clone())),
                _ => None,
            })
            .collect();
        let rule = graph.rule(id).clone();
        WorkerJob {
            action: self.session.registry.get(&rule.rule_type),
            rule,
            purpose: self.purpose,
            env: self.session.env.clone(),
            cache: self.session.cache.clone(),
            force: self.session.force,
            is_target: graph.is_target(id),
            deploy_dir: self.session.deploy_dir.clone(),
            dep_outputs,
            log,
        }
    }

    fn skip_for_failed_dependency(
        &self,
        graph: &DependencyGraph,
        id: NodeId,
        log: &Arc<LogSource>,
    ) -> RuleOutcome {
        let identity = graph.rule(id).identity();
        log_rule_skipped!(self.stage_name, identity, SkipReason::DependencyFailed);
        log.set_skipped(SkipReason::DependencyFailed);
        close_rule_log(log);
        RuleOutcome {
            identity,
            status: Status::Skipped,
            skip_reason: Some(SkipReason::DependencyFailed),
            error: None,
            outputs: Vec::new(),
            duration_ms: 0,
        }
    }

    fn record_result(
        &self,
        graph: &DependencyGraph,
        id: NodeId,
        result: WorkResult,
        log: &Arc<LogSource>,
    ) -> RuleOutcome {
        let identity = graph.rule(id).identity();
        let (start, end) = log.times();
        let duration_ms = match (start, end) {
            (Some(s), Some(e)) => (e - s).num_milliseconds().max(0) as u64,
            _ => 0,
        };
        let (status, skip_reason, error, outputs) = match result {
            WorkResult::Succeeded(outputs) => (Status::Succeeded, None, None, outputs),
            WorkResult::CacheHit(outputs) => {
                log_rule_skipped!(self.stage_name, identity, SkipReason::Unchanged);
                (Status::Skipped, Some(SkipReason::Unchanged), None, outputs)
            }
            WorkResult::NotApplicable(outputs) => {
                (Status::Skipped, Some(SkipReason::NotApplicable), None, outputs)
            }
            WorkResult::Failed(error) => {
                log_rule_failed!(self.stage_name, identity, error.message);
                // Workers that died before reporting leave their source open
                if !log.status().is_terminal() {
                    log.set_exception(error.message.clone());
                    log.set_status(Status::Failed);
                }
                close_rule_log(log);
                (Status::Failed, None, Some(error), Vec::new())
            }
        };
        RuleOutcome {
            identity,
            status,
            skip_reason,
            error,
            outputs,
            duration_ms,
        }
    }

    /// Stores a terminal outcome and queues dependents that became runnable.
    fn complete(
        &self,
        graph: &DependencyGraph,
        id: NodeId,
        outcome: RuleOutcome,
        states: &mut [NodeState],
        remaining: &mut [usize],
        ready: &mut VecDeque<NodeId>,
    ) {
        states[id] = NodeState::Done(outcome);
        let mut batch = Vec::new();
        for dependent in graph.dependents(id) {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                batch.push(dependent);
            }
        }
        self.sort_batch(graph, &mut batch);
        ready.extend(batch);
    }
}

fn close_rule_log(log: &LogSource) {
    if let Err(e) = log.close() {
        tracing::warn!(source = %log.name(), error = %e, "Could not close rule log");
    }
}

/// Runs on a blocking thread. Reports through the rule's LogSource and
/// returns the result; never touches scheduler state.
fn run_worker(job: WorkerJob) -> WorkResult {
    let identity = job.rule.identity();
    job.log.open();

    let result = execute_job(&job).unwrap_or_else(|e| WorkResult::Failed(RuleActionError::new(&identity, &e)));
    match &result {
        WorkResult::Succeeded(_) => job.log.set_status(Status::Succeeded),
        WorkResult::CacheHit(_) => job.log.set_skipped(SkipReason::Unchanged),
        WorkResult::NotApplicable(_) => job.log.set_skipped(SkipReason::NotApplicable),
        WorkResult::Failed(error) => {
            job.log.error(error.message.clone());
            job.log.set_exception(error.message.clone());
            job.log.set_status(Status::Failed);
        }
    }
    close_rule_log(&job.log);
    result
}

fn execute_job(job: &WorkerJob) -> anyhow::Result<WorkResult> {
    let action = job
        .action
        .clone()
        .with_context(|| format!("unknown rule type \"{}\"", job.rule.rule_type))?;

    // Missing sources are tolerated while cleaning
    let strict = job.purpose != Purpose::Clean;
    let mut ctx = RuleContext::resolve(
        job.rule.clone(),
        job.env.clone(),
        &job.dep_outputs,
        job.log.clone(),
        strict,
    )?;
    ctx.outputs = action.compute_outputs(&ctx)?;

    match job.purpose {
        Purpose::Build => {
            if !job.force {
                match job.cache.is_unchanged(&job.rule, &ctx.inputs) {
                    Ok(true) => {
                        let outputs = job
                            .cache
                            .recorded_outputs(&job.rule)
                            .unwrap_or(ctx.outputs);
                        return Ok(WorkResult::CacheHit(outputs));
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(rule = %job.rule.identity(), error = %e, "Cache check failed");
                        job.log.warning(format!("cache check failed, rebuilding: {}", e));
                    }
                }
            }
            action.execute(&ctx)?;
            if let Err(e) = job.cache.record_outputs(&job.rule, &ctx.inputs, &ctx.outputs) {
                tracing::warn!(rule = %job.rule.identity(), error = %e, "Failed to record outputs");
            }
            Ok(WorkResult::Succeeded(ctx.outputs))
        }
        Purpose::Test => {
            if !action.is_test() {
                return Ok(WorkResult::NotApplicable(ctx.outputs));
            }
            action.test(&ctx)?;
            Ok(WorkResult::Succeeded(ctx.outputs))
        }
        Purpose::Clean => {
            action.clean(&ctx)?;
            if let Err(e) = job.cache.forget(&job.rule) {
                tracing::warn!(rule = %job.rule.identity(), error = %e, "Failed to forget cache record");
            }
            Ok(WorkResult::Succeeded(ctx.outputs))
        }
        Purpose::Deploy => {
            if !job.is_target {
                return Ok(WorkResult::NotApplicable(ctx.outputs));
            }
            let deploy_dir = job
                .deploy_dir
                .as_deref()
                .context("no deploy directory configured")?;
            let copied = deploy_outputs(&job.env, &ctx.outputs, deploy_dir)?;
            job.log
                .info(format!("deployed {} file(s) to {}", copied, deploy_dir.display()));
            Ok(WorkResult::Succeeded(ctx.outputs))
        }
    }
}

fn copy_mtime(from: &Path, to: &Path) -> anyhow::Result<()> {
    let modified = std::fs::metadata(from)?.modified()?;
    std::fs::File::options()
        .write(true)
        .open(to)?
        .set_modified(modified)
        .with_context(|| format!("Failed to set modification time on {}", to.display()))
}

/// Copies outputs into `deploy_dir`, dropping any `build-out`/`build-gen`
/// prefix from their project-relative path.
fn deploy_outputs(env: &BuildEnv, outputs: &[PathBuf], deploy_dir: &Path) -> anyhow::Result<usize> {
    let mut copied = 0;
    for output in outputs {
        let files = if output.is_dir() {
            crate::hasher::walk_files(output)?
        } else {
            vec![output.clone()]
        };
        for file in files {
            let mut relative = env.strip_output_root(&file);
            if relative.is_absolute() {
                relative = file.file_name().map(PathBuf::from).unwrap_or_default();
            }
            let dest = deploy_dir.join(relative);
            RuleContext::ensure_parent_exists(&dest)?;
            std::fs::copy(&file, &dest).with_context(|| {
                format!("Failed to deploy {} to {}", file.display(), dest.display())
            })?;
            copy_mtime(&file, &dest)?;
            copied += 1;
        }
    }
    Ok(copied)
}

use std::io;
/// Structured diagnostics for anvil internals. The user-facing build log is
/// the [`crate::build_log`] tree; this module only wires up `tracing`.
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

/// Initialize structured logging with optional JSON output
pub fn init_logging(json_output: bool, verbose: bool) -> anyhow::Result<()> {
    let default_filter = if verbose { "anvil=debug" } else { "anvil=info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = Registry::default().with(env_filter);

    if json_output {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_thread_ids(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    }

    Ok(())
}

/// Counters for one stage execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageMetrics {
    pub total_rules: usize,
    pub executed: usize,
    pub cache_hits: usize,
    pub not_applicable: usize,
    pub dependency_skips: usize,
    pub failures: usize,
    pub duration_ms: u64,
}

impl StageMetrics {
    pub fn new(total_rules: usize) -> Self {
        Self {
            total_rules,
            ..Self::default()
        }
    }

    /// Share of cache-checked rules that were unchanged
    pub fn cache_hit_rate(&self) -> f64 {
        let checked = self.cache_hits + self.executed;
        if checked == 0 {
            0.0
        } else {
            (self.cache_hits as f64) / (checked as f64)
        }
    }

    pub fn success_rate(&self) -> f64 {
        let ran = self.executed + self.failures;
        if ran == 0 {
            0.0
        } else {
            (self.executed as f64) / (ran as f64)
        }
    }

    pub fn skipped(&self) -> usize {
        self.cache_hits + self.not_applicable + self.dependency_skips
    }
}

#[macro_export]
macro_rules! log_rule_started {
    ($stage:expr, $rule:expr) => {
        tracing::debug!(stage = %$stage, rule = %$rule, "Rule started");
    };
}

#[macro_export]
macro_rules! log_rule_skipped {
    ($stage:expr, $rule:expr, $reason:expr) => {
        tracing::debug!(stage = %$stage, rule = %$rule, reason = %$reason, "Rule skipped");
    };
}

#[macro_export]
macro_rules! log_rule_failed {
    ($stage:expr, $rule:expr, $error:expr) => {
        tracing::warn!(stage = %$stage, rule = %$rule, error = %$error, "Rule failed");
    };
}

#[macro_export]
macro_rules! log_stage_complete {
    ($stage:expr, $status:expr, $metrics:expr) => {
        tracing::info!(
            stage = %$stage,
            status = %$status,
            executed = $metrics.executed,
            cache_hits = $metrics.cache_hits,
            failures = $metrics.failures,
            duration_ms = $metrics.duration_ms,
            "Stage completed"
        );
    };
}

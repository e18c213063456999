//! Typed error hierarchy for anvil.
//!
//! Each subsystem owns one enum:
//! - `GraphError` covers reference resolution, module loading and graph construction
//! - `CacheError` covers the rule cache (always downgraded to a cache miss)
//! - `LogSourceError` covers LogSource hierarchy invariants
//! - `ReportError` covers the remote build-report protocol
//!
//! Rule action failures are not raised through these types: they become a
//! [`RuleActionError`] value attached to the failing node.

use crate::build_log::Status;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while resolving references or building the dependency graph.
/// All of them are fatal to the stage that triggered them.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Target \"{reference}\" does not resolve to a rule: {reason}")]
    UnresolvedTarget { reference: String, reason: String },

    #[error("Reference \"{reference}\" matches nothing in the current module context")]
    AmbiguousReference { reference: String },

    #[error("Cyclic dependency detected: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Invalid reference \"{reference}\": {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("Failed to load module {module}: {source}")]
    ModuleLoad {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Rule {rule} uses unknown rule type \"{rule_type}\"")]
    UnknownRuleType { rule: String, rule_type: String },

    #[error("Rule {rule} is declared more than once")]
    DuplicateRule { rule: String },
}

impl GraphError {
    /// Cycle path carried by a `CyclicDependency` error.
    pub fn cycle(&self) -> Option<&[String]> {
        match self {
            Self::CyclicDependency { cycle } => Some(cycle),
            _ => None,
        }
    }
}

/// A rule's own action failed. Recorded on the node, never propagated as a fault.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Rule {rule} failed: {message}")]
pub struct RuleActionError {
    pub rule: String,
    pub message: String,
}

impl RuleActionError {
    pub fn new(rule: impl Into<String>, err: &anyhow::Error) -> Self {
        Self {
            rule: rule.into(),
            // Alternate formatting keeps the whole context chain
            message: format!("{:#}", err),
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cache index is corrupt: {0}")]
    Index(#[from] serde_json::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogSourceError {
    #[error("Cannot close {name}: {open} child source(s) still open")]
    OpenChildren { name: String, open: usize },

    #[error("Cannot close {name}: status {status} is not terminal")]
    NonTerminalStatus { name: String, status: Status },
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Report {id} not found")]
    NotFound { id: u64 },

    #[error("Report {id} is finished and can no longer be updated")]
    Finished { id: u64 },

    #[error("Report storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Report serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Report transport error (retryable: {retryable}): {message}")]
    Transport { message: String, retryable: bool },
}

impl ReportError {
    /// Whether a failed report request is worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::NotFound { .. } => false,
            Self::Finished { .. } => false,
            Self::Storage(_) => true,
            Self::Serialization(_) => false,
        }
    }
}

/// Retry configuration for remote report delivery
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: crate::constants::DEFAULT_MAX_RETRY_ATTEMPTS,
            initial_backoff_ms: crate::constants::DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: crate::constants::DEFAULT_MAX_BACKOFF_MS,
            backoff_multiplier: 2.0,
        }
    }
}

/// Calculates the exponential backoff for the given attempt, capped at `max_backoff_ms`
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> u64 {
    (config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32))
        .min(config.max_backoff_ms as f64) as u64
}

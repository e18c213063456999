//! Rule-type dispatch.
//!
//! A rule's `type` names an implementation of [`RuleAction`] registered in a
//! [`RuleTypeRegistry`]. The registry is consulted when modules are loaded
//! and again when the scheduler runs a rule.

pub mod core;

use crate::context::RuleContext;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// What a rule type does in each stage purpose.
pub trait RuleAction: Send + Sync {
    /// Output files the rule produces for the resolved inputs in `ctx`.
    /// Must be side-effect free.
    fn compute_outputs(&self, ctx: &RuleContext) -> Result<Vec<PathBuf>>;

    /// Produces `ctx.outputs`.
    fn execute(&self, ctx: &RuleContext) -> Result<()>;

    fn is_test(&self) -> bool {
        false
    }

    /// Runs the rule's checks. Only called when `is_test` is true.
    fn test(&self, _ctx: &RuleContext) -> Result<()> {
        Ok(())
    }

    /// Removes what `execute` produced. Only outputs below the build output
    /// roots are ever deleted, so pass-through sources survive a clean.
    fn clean(&self, ctx: &RuleContext) -> Result<()> {
        for output in &ctx.outputs {
            if !ctx.env.is_output_path(output) || !output.exists() {
                continue;
            }
            let removed = if output.is_dir() {
                std::fs::remove_dir_all(output)
            } else {
                std::fs::remove_file(output)
            };
            removed.with_context(|| format!("Failed to remove {}", output.display()))?;
            ctx.log.debug(format!("removed {}", output.display()));
        }
        Ok(())
    }
}

/// Maps rule-type names to their implementation.
#[derive(Clone, Default)]
pub struct RuleTypeRegistry {
    actions: BTreeMap<String, Arc<dyn RuleAction>>,
}

impl RuleTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in rule types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        core::register_builtins(&mut registry);
        registry
    }

    /// Registers `action` under `name`, replacing any previous registration.
    pub fn register(&mut self, name: impl Into<String>, action: Arc<dyn RuleAction>) {
        self.actions.insert(name.into(), action);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RuleAction>> {
        self.actions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }
}

impl std::fmt::Debug for RuleTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.actions.keys()).finish()
    }
}

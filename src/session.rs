use crate::cache::RuleCache;
use crate::context::BuildEnv;
use crate::error::GraphError;
use crate::graph::{DependencyGraph, GraphBuilder};
use crate::loader::RuleLoader;
use crate::rules::RuleTypeRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Explicit context for one command invocation. Passed from the stage
/// manager to each scheduler and, piecewise, to every worker.
pub struct BuildSession {
    pub id: Uuid,
    pub env: Arc<BuildEnv>,
    pub loader: Arc<dyn RuleLoader>,
    pub registry: Arc<RuleTypeRegistry>,
    pub cache: Arc<dyn RuleCache>,
    pub jobs: usize,
    pub force: bool,
    pub targets: Vec<String>,
    /// Module that `:name` shorthand in `targets` refers to.
    pub requesting_module: Option<String>,
    pub deploy_dir: Option<PathBuf>,
    /// Empty `deploy_dir` before deploying into it.
    pub clean_deploy: bool,
}

impl BuildSession {
    pub fn new(
        env: Arc<BuildEnv>,
        loader: Arc<dyn RuleLoader>,
        registry: Arc<RuleTypeRegistry>,
        cache: Arc<dyn RuleCache>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            env,
            loader,
            registry,
            cache,
            jobs: 1,
            force: false,
            targets: Vec::new(),
            requesting_module: Some(crate::rule::ROOT_MODULE.to_string()),
            deploy_dir: None,
            clean_deploy: false,
        }
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_requesting_module(mut self, module: Option<String>) -> Self {
        self.requesting_module = module;
        self
    }

    pub fn with_deploy_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.deploy_dir = dir;
        self
    }

    pub fn with_clean_deploy(mut self, clean: bool) -> Self {
        self.clean_deploy = clean;
        self
    }

    /// Resolves the session's targets into a fresh dependency graph.
    pub fn build_graph(&self) -> Result<DependencyGraph, GraphError> {
        GraphBuilder::new(self.loader.as_ref())
            .with_registry(&self.registry)
            .build(&self.targets, self.requesting_module.as_deref())
    }
}

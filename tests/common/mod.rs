#![allow(dead_code)]

use anvil::build_log::LogSource;
use anvil::cache::FileCache;
use anvil::context::{BuildEnv, RuleContext};
use anvil::loader::StaticModuleLoader;
use anvil::rule::Rule;
use anvil::rules::{RuleAction, RuleTypeRegistry};
use anvil::session::BuildSession;
use anyhow::Result;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Scratch project directory with helpers for writing sources.
pub struct Project {
    _dir: TempDir,
    pub root: PathBuf,
}

impl Project {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        Self { _dir: dir, root }
    }

    pub fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.root.join(rel)).unwrap()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn env(&self) -> Arc<BuildEnv> {
        Arc::new(BuildEnv::new(&self.root))
    }

    /// Session over in-memory modules with the built-in rule types plus the
    /// test types from [`test_registry`].
    pub fn session(
        &self,
        loader: StaticModuleLoader,
        registry: RuleTypeRegistry,
        targets: &[&str],
        jobs: usize,
    ) -> BuildSession {
        let env = self.env();
        let cache = Arc::new(FileCache::open(env.cache_dir()).unwrap());
        BuildSession::new(env, Arc::new(loader), Arc::new(registry), cache)
            .with_targets(targets.iter().copied())
            .with_jobs(jobs)
    }
}

/// Always fails with the given message.
pub struct FailingRule(pub &'static str);

impl RuleAction for FailingRule {
    fn compute_outputs(&self, _ctx: &RuleContext) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    fn execute(&self, _ctx: &RuleContext) -> Result<()> {
        anyhow::bail!("{}", self.0)
    }

    fn clean(&self, _ctx: &RuleContext) -> Result<()> {
        anyhow::bail!("{}", self.0)
    }
}

/// Execution interval of one rule.
#[derive(Debug, Clone)]
pub struct Span {
    pub rule: String,
    pub start: Instant,
    pub end: Instant,
}

/// Sleeps for a while and records when it ran.
pub struct TimedRule {
    pub delay: Duration,
    pub spans: Arc<Mutex<Vec<Span>>>,
}

impl RuleAction for TimedRule {
    fn compute_outputs(&self, _ctx: &RuleContext) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    fn execute(&self, ctx: &RuleContext) -> Result<()> {
        let start = Instant::now();
        std::thread::sleep(self.delay);
        self.spans.lock().push(Span {
            rule: ctx.rule.identity(),
            start,
            end: Instant::now(),
        });
        Ok(())
    }
}

/// Built-in rule types plus `fail` and `timed`.
pub fn test_registry(spans: Arc<Mutex<Vec<Span>>>) -> RuleTypeRegistry {
    let mut registry = RuleTypeRegistry::with_builtins();
    registry.register("fail", Arc::new(FailingRule("boom")));
    registry.register(
        "timed",
        Arc::new(TimedRule {
            delay: Duration::from_millis(40),
            spans,
        }),
    );
    registry
}

pub fn root_module(rules: Vec<Rule>) -> StaticModuleLoader {
    StaticModuleLoader::new().with_module("/", rules).unwrap()
}

pub fn rule(name: &str, rule_type: &str) -> Rule {
    Rule::new("/", name, rule_type)
}

/// Command root and its `build` stage source.
pub fn stage_log() -> (Arc<LogSource>, Arc<LogSource>) {
    let root = LogSource::root("test");
    let stage = root.child("build");
    (root, stage)
}

pub fn modified(path: &Path) -> std::time::SystemTime {
    std::fs::metadata(path).unwrap().modified().unwrap()
}

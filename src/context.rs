//! Build environment and the per-rule execution context.

use crate::build_log::LogSource;
use crate::constants::{CACHE_DIR_NAME, GEN_DIR_NAME, OUT_DIR_NAME};
use crate::rule::{is_rule_reference, Rule, TargetRef};
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Filesystem layout of one project.
#[derive(Debug, Clone)]
pub struct BuildEnv {
    root_path: PathBuf,
    cache_dir: PathBuf,
}

impl BuildEnv {
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        let root_path = root_path.into();
        let cache_dir = root_path.join(CACHE_DIR_NAME);
        Self {
            root_path,
            cache_dir,
        }
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn out_root(&self) -> PathBuf {
        self.root_path.join(OUT_DIR_NAME)
    }

    pub fn gen_root(&self) -> PathBuf {
        self.root_path.join(GEN_DIR_NAME)
    }

    /// Directory of a module on disk.
    pub fn module_dir(&self, module_path: &str) -> PathBuf {
        let relative = module_path.trim_start_matches('/');
        if relative.is_empty() {
            self.root_path.clone()
        } else {
            self.root_path.join(relative)
        }
    }

    /// `build-out/<module>/<name>`: content and binary results.
    pub fn out_path(&self, module_path: &str, name: &str) -> PathBuf {
        Self::target_path(self.out_root(), module_path, name)
    }

    /// `build-gen/<module>/<name>`: generated code.
    pub fn gen_path(&self, module_path: &str, name: &str) -> PathBuf {
        Self::target_path(self.gen_root(), module_path, name)
    }

    fn target_path(base: PathBuf, module_path: &str, name: &str) -> PathBuf {
        let relative = module_path.trim_start_matches('/');
        if relative.is_empty() {
            base.join(name)
        } else {
            base.join(relative).join(name)
        }
    }

    /// Mirrors a source file under `build-out`. Sources that already live
    /// in `build-out` or `build-gen` keep their relative location.
    pub fn out_path_for_src(&self, src: &Path) -> PathBuf {
        self.out_root().join(self.strip_output_root(src))
    }

    /// Path relative to the project root, minus any leading output root.
    pub fn strip_output_root(&self, path: &Path) -> PathBuf {
        let relative = path.strip_prefix(&self.root_path).unwrap_or(path);
        let mut components = relative.components().peekable();
        if let Some(Component::Normal(first)) = components.peek() {
            if *first == OUT_DIR_NAME || *first == GEN_DIR_NAME {
                components.next();
            }
        }
        components.collect()
    }

    /// Whether `path` lives below one of the output roots.
    pub fn is_output_path(&self, path: &Path) -> bool {
        path.starts_with(self.out_root()) || path.starts_with(self.gen_root())
    }

    /// Removes every output root and the cache directory.
    pub fn clean_all(&self) -> Result<()> {
        for dir in [self.out_root(), self.gen_root(), self.cache_dir.clone()] {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)
                    .with_context(|| format!("Failed to remove {}", dir.display()))?;
                tracing::info!(path = %dir.display(), "Removed build directory");
            }
        }
        Ok(())
    }
}

/// Everything a rule action can see while it runs.
#[derive(Clone)]
pub struct RuleContext {
    pub rule: Arc<Rule>,
    pub env: Arc<BuildEnv>,
    /// Resolved input files, in source order and de-duplicated.
    pub inputs: Vec<PathBuf>,
    /// Declared outputs, filled in after `compute_outputs`.
    pub outputs: Vec<PathBuf>,
    pub log: Arc<LogSource>,
}

impl RuleContext {
    /// Resolves `rule.srcs` into input files.
    ///
    /// Rule references contribute the outputs recorded for that rule in
    /// `dep_outputs`. Other sources are module-relative paths, glob patterns
    /// or directories. With `strict` set, a literal path that does not exist
    /// is an error; otherwise it is passed through as is.
    pub fn resolve(
        rule: Arc<Rule>,
        env: Arc<BuildEnv>,
        dep_outputs: &HashMap<String, Vec<PathBuf>>,
        log: Arc<LogSource>,
        strict: bool,
    ) -> Result<Self> {
        let inputs = resolve_inputs(&rule, &env, dep_outputs, strict)?;
        Ok(Self {
            rule,
            env,
            inputs,
            outputs: Vec::new(),
            log,
        })
    }

    pub fn module_dir(&self) -> PathBuf {
        self.env.module_dir(&self.rule.module_path)
    }

    /// Output path named after the rule, or after `name` when given.
    pub fn out_path(&self, name: Option<&str>) -> PathBuf {
        self.env
            .out_path(&self.rule.module_path, name.unwrap_or(&self.rule.name))
    }

    pub fn gen_path(&self, name: Option<&str>) -> PathBuf {
        self.env
            .gen_path(&self.rule.module_path, name.unwrap_or(&self.rule.name))
    }

    pub fn out_path_for_src(&self, src: &Path) -> PathBuf {
        self.env.out_path_for_src(src)
    }

    pub fn ensure_parent_exists(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(())
    }
}

fn resolve_inputs(
    rule: &Rule,
    env: &BuildEnv,
    dep_outputs: &HashMap<String, Vec<PathBuf>>,
    strict: bool,
) -> Result<Vec<PathBuf>> {
    let filter = match &rule.src_filter {
        Some(pattern) => Some(
            glob::Pattern::new(pattern)
                .with_context(|| format!("Invalid src_filter \"{}\"", pattern))?,
        ),
        None => None,
    };
    let module_dir = env.module_dir(&rule.module_path);

    let mut seen = HashSet::new();
    let mut inputs = Vec::new();
    let mut push = |path: PathBuf| {
        if seen.insert(path.clone()) {
            inputs.push(path);
        }
    };

    for src in &rule.srcs {
        if is_rule_reference(src) {
            let target = TargetRef::parse(src, Some(&rule.module_path))?;
            let outputs = dep_outputs.get(&target.identity()).with_context(|| {
                format!("Outputs of {} are not available", target.identity())
            })?;
            for path in outputs {
                push(path.clone());
            }
            continue;
        }

        let mut files = Vec::new();
        if src.contains(['*', '?', '[']) {
            let pattern = module_dir.join(src);
            let pattern = pattern.to_string_lossy();
            let mut matched: Vec<PathBuf> = glob::glob(&pattern)
                .with_context(|| format!("Invalid glob pattern \"{}\"", src))?
                .filter_map(|entry| entry.ok())
                .filter(|p| p.is_file())
                .collect();
            matched.sort();
            files.extend(matched);
        } else {
            let path = module_dir.join(src);
            if path.is_dir() {
                files.extend(crate::hasher::walk_files(&path)?);
            } else if path.exists() || !strict {
                files.push(path);
            } else {
                anyhow::bail!("Source file not found: {}", path.display());
            }
        }

        for file in files {
            let keep = match &filter {
                Some(pattern) => file
                    .file_name()
                    .map(|n| pattern.matches(&n.to_string_lossy()))
                    .unwrap_or(false),
                None => true,
            };
            if keep {
                push(file);
            }
        }
    }
    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn ctx_for(root: &Path, rule: Rule, deps: &HashMap<String, Vec<PathBuf>>) -> Result<RuleContext> {
        RuleContext::resolve(
            Arc::new(rule),
            Arc::new(BuildEnv::new(root)),
            deps,
            LogSource::root("test"),
            true,
        )
    }

    #[test]
    fn test_output_paths() {
        let env = BuildEnv::new("/proj");
        assert_eq!(
            env.out_path("/assets", "bundle.js"),
            PathBuf::from("/proj/build-out/assets/bundle.js")
        );
        assert_eq!(env.gen_path("/", "x"), PathBuf::from("/proj/build-gen/x"));
        assert_eq!(
            env.out_path_for_src(Path::new("/proj/build-gen/a/b.txt")),
            PathBuf::from("/proj/build-out/a/b.txt")
        );
        assert_eq!(
            env.out_path_for_src(Path::new("/proj/src/b.txt")),
            PathBuf::from("/proj/build-out/src/b.txt")
        );
    }

    #[test]
    fn test_resolve_globs_dirs_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("m/data/nested")).unwrap();
        fs::write(root.join("m/a.txt"), "a").unwrap();
        fs::write(root.join("m/b.txt"), "b").unwrap();
        fs::write(root.join("m/c.md"), "c").unwrap();
        fs::write(root.join("m/data/nested/d.txt"), "d").unwrap();

        let rule = Rule::new("/m", "r", "file_set").with_srcs(["*.txt", "data", "a.txt"]);
        let ctx = ctx_for(root, rule, &HashMap::new()).unwrap();
        assert_eq!(
            ctx.inputs,
            vec![
                root.join("m/a.txt"),
                root.join("m/b.txt"),
                root.join("m/data/nested/d.txt"),
            ]
        );

        let filtered = Rule::new("/m", "r", "file_set")
            .with_srcs(["*.txt", "c.md"])
            .with_src_filter("*.md");
        let ctx = ctx_for(root, filtered, &HashMap::new()).unwrap();
        assert_eq!(ctx.inputs, vec![root.join("m/c.md")]);
    }

    #[test]
    fn test_resolve_uses_dependency_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut deps = HashMap::new();
        deps.insert("/m:gen".to_string(), vec![PathBuf::from("/out/g.txt")]);
        let rule = Rule::new("/m", "r", "file_set").with_srcs([":gen"]);
        let ctx = ctx_for(dir.path(), rule, &deps).unwrap();
        assert_eq!(ctx.inputs, vec![PathBuf::from("/out/g.txt")]);
    }

    #[test]
    fn test_missing_source_is_strict() {
        let dir = tempfile::tempdir().unwrap();
        let rule = Rule::new("/", "r", "file_set").with_srcs(["missing.txt"]);
        assert!(ctx_for(dir.path(), rule.clone(), &HashMap::new()).is_err());

        let lenient = RuleContext::resolve(
            Arc::new(rule),
            Arc::new(BuildEnv::new(dir.path())),
            &HashMap::new(),
            LogSource::root("clean"),
            false,
        )
        .unwrap();
        assert_eq!(lenient.inputs.len(), 1);
    }

    #[test]
    fn test_clean_all_removes_build_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let env = BuildEnv::new(dir.path());
        fs::create_dir_all(env.out_root().join("x")).unwrap();
        fs::create_dir_all(env.cache_dir()).unwrap();
        fs::write(dir.path().join("keep.txt"), "k").unwrap();

        env.clean_all().unwrap();
        assert!(!env.out_root().exists());
        assert!(!env.cache_dir().exists());
        assert!(dir.path().join("keep.txt").exists());
    }
}

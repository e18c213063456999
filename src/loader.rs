//! Module loading and reference resolution.

use crate::constants::MODULE_FILE_NAME;
use crate::error::GraphError;
use crate::rule::{normalize_module_path, Module, Rule, TargetRef, ROOT_MODULE};
use crate::rules::RuleTypeRegistry;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Source of rule declarations.
pub trait RuleLoader: Send + Sync {
    /// Loads the module at `path`, or `None` when no such module exists.
    fn load_module(&self, path: &str) -> Result<Option<Arc<Module>>, GraphError>;

    /// Resolves `reference` (as written in `requesting_module`) to exactly
    /// one rule.
    fn resolve(
        &self,
        reference: &str,
        requesting_module: Option<&str>,
    ) -> Result<Arc<Rule>, GraphError> {
        let target = TargetRef::parse(reference, requesting_module)?;
        let module = match self.load_module(&target.module_path)? {
            Some(module) => module,
            None if target.is_shorthand() => {
                return Err(GraphError::AmbiguousReference {
                    reference: reference.to_string(),
                })
            }
            None => {
                return Err(GraphError::UnresolvedTarget {
                    reference: reference.to_string(),
                    reason: format!("module {} not found", target.module_path),
                })
            }
        };
        match module.rule(&target.name) {
            Some(rule) => Ok(rule),
            None if target.is_shorthand() => Err(GraphError::AmbiguousReference {
                reference: reference.to_string(),
            }),
            None => Err(GraphError::UnresolvedTarget {
                reference: reference.to_string(),
                reason: format!("no rule named \"{}\" in {}", target.name, target.module_path),
            }),
        }
    }
}

/// In-memory modules, for embedding and tests.
#[derive(Debug, Default)]
pub struct StaticModuleLoader {
    modules: HashMap<String, Arc<Module>>,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a module built from `rules`.
    pub fn add_module(&mut self, path: &str, rules: Vec<Rule>) -> Result<(), GraphError> {
        let module = Module::new(path, rules)?;
        self.modules
            .insert(module.path().to_string(), Arc::new(module));
        Ok(())
    }

    pub fn with_module(mut self, path: &str, rules: Vec<Rule>) -> Result<Self, GraphError> {
        self.add_module(path, rules)?;
        Ok(self)
    }
}

impl RuleLoader for StaticModuleLoader {
    fn load_module(&self, path: &str) -> Result<Option<Arc<Module>>, GraphError> {
        let path = normalize_module_path(ROOT_MODULE, path)?;
        Ok(self.modules.get(&path).cloned())
    }
}

#[derive(Debug, Deserialize)]
struct ModuleFile {
    #[serde(default)]
    rules: Vec<Rule>,
}

/// Reads `<root>/<module>/BUILD` files holding a JSON rule declaration:
///
/// ```json
/// { "rules": [ { "name": "css", "type": "copy_files", "srcs": ["*.css"] } ] }
/// ```
///
/// Parsed modules are cached for the loader's lifetime.
pub struct FileModuleLoader {
    root: PathBuf,
    registry: Arc<RuleTypeRegistry>,
    modules: RwLock<HashMap<String, Option<Arc<Module>>>>,
}

impl FileModuleLoader {
    pub fn new(root: impl Into<PathBuf>, registry: Arc<RuleTypeRegistry>) -> Self {
        Self {
            root: root.into(),
            registry,
            modules: RwLock::new(HashMap::new()),
        }
    }

    fn module_file(&self, module_path: &str) -> PathBuf {
        let relative = module_path.trim_start_matches('/');
        if relative.is_empty() {
            self.root.join(MODULE_FILE_NAME)
        } else {
            self.root.join(relative).join(MODULE_FILE_NAME)
        }
    }

    fn parse_module(&self, module_path: &str) -> Result<Option<Module>, GraphError> {
        let file = self.module_file(module_path);
        if !file.is_file() {
            return Ok(None);
        }
        let load_error = |source: anyhow::Error| GraphError::ModuleLoad {
            module: module_path.to_string(),
            source,
        };
        let content = std::fs::read_to_string(&file).map_err(|e| load_error(e.into()))?;
        let parsed: ModuleFile =
            serde_json::from_str(&content).map_err(|e| load_error(e.into()))?;

        for rule in &parsed.rules {
            if !self.registry.contains(&rule.rule_type) {
                return Err(GraphError::UnknownRuleType {
                    rule: format!("{}:{}", module_path, rule.name),
                    rule_type: rule.rule_type.clone(),
                });
            }
        }
        tracing::debug!(module = %module_path, rules = parsed.rules.len(), "Loaded module");
        Module::new(module_path, parsed.rules).map(Some)
    }
}

impl RuleLoader for FileModuleLoader {
    fn load_module(&self, path: &str) -> Result<Option<Arc<Module>>, GraphError> {
        let path = normalize_module_path(ROOT_MODULE, path)?;
        if let Some(cached) = self.modules.read().get(&path) {
            return Ok(cached.clone());
        }
        let module = self.parse_module(&path)?.map(Arc::new);
        self.modules.write().insert(path, module.clone());
        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn loader() -> StaticModuleLoader {
        StaticModuleLoader::new()
            .with_module(
                "/",
                vec![
                    Rule::new("", "app", "file_set").with_srcs(["/lib:core"]),
                    Rule::new("", "lib", "file_set"),
                ],
            )
            .unwrap()
            .with_module("/lib", vec![Rule::new("", "core", "file_set")])
            .unwrap()
    }

    #[test]
    fn test_resolve_forms() {
        let loader = loader();
        assert_eq!(loader.resolve("/lib:core", None).unwrap().identity(), "/lib:core");
        assert_eq!(loader.resolve(":app", Some("/")).unwrap().identity(), "/:app");
        assert_eq!(loader.resolve("lib:core", Some("/")).unwrap().identity(), "/lib:core");
    }

    #[test]
    fn test_module_shorthand_without_match_is_ambiguous() {
        let loader = loader();
        // /lib has no rule named "lib"
        let err = loader.resolve("/lib", None).unwrap_err();
        assert!(matches!(err, GraphError::AmbiguousReference { .. }));
    }

    #[test]
    fn test_explicit_miss_is_unresolved() {
        let loader = loader();
        assert!(matches!(
            loader.resolve("/lib:nope", None).unwrap_err(),
            GraphError::UnresolvedTarget { .. }
        ));
        assert!(matches!(
            loader.resolve("/missing:x", None).unwrap_err(),
            GraphError::UnresolvedTarget { .. }
        ));
        assert!(matches!(
            loader.resolve(":nope", Some("/")).unwrap_err(),
            GraphError::AmbiguousReference { .. }
        ));
    }

    #[test]
    fn test_file_loader_reads_build_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("web")).unwrap();
        fs::write(
            dir.path().join("web").join("BUILD"),
            r#"{"rules":[{"name":"web","type":"copy_files","srcs":["*.css"]}]}"#,
        )
        .unwrap();

        let loader =
            FileModuleLoader::new(dir.path(), Arc::new(RuleTypeRegistry::with_builtins()));
        let rule = loader.resolve("/web", None).unwrap();
        assert_eq!(rule.identity(), "/web:web");
        assert_eq!(rule.srcs, vec!["*.css"]);
        assert!(loader.load_module("/nowhere").unwrap().is_none());
    }

    #[test]
    fn test_file_loader_rejects_unknown_types() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("BUILD"),
            r#"{"rules":[{"name":"x","type":"closure_js"}]}"#,
        )
        .unwrap();
        let loader =
            FileModuleLoader::new(dir.path(), Arc::new(RuleTypeRegistry::with_builtins()));
        assert!(matches!(
            loader.load_module("/").unwrap_err(),
            GraphError::UnknownRuleType { .. }
        ));
    }

    #[test]
    fn test_file_loader_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("BUILD"), "not json").unwrap();
        let loader =
            FileModuleLoader::new(dir.path(), Arc::new(RuleTypeRegistry::with_builtins()));
        assert!(matches!(
            loader.resolve(":x", Some("/")).unwrap_err(),
            GraphError::ModuleLoad { .. }
        ));
    }
}

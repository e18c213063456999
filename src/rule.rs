//! Rule declarations, modules and target references.

use crate::error::GraphError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Module path of the project root.
pub const ROOT_MODULE: &str = "/";

/// A named build action declared in a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default)]
    pub module_path: String,
    #[serde(rename = "type")]
    pub rule_type: String,
    #[serde(default)]
    pub srcs: Vec<String>,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_filter: Option<String>,
    /// Rule-type specific attributes.
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl Rule {
    pub fn new(
        module_path: impl Into<String>,
        name: impl Into<String>,
        rule_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            module_path: module_path.into(),
            rule_type: rule_type.into(),
            srcs: Vec::new(),
            deps: Vec::new(),
            src_filter: None,
            params: serde_json::Map::new(),
        }
    }

    pub fn with_srcs<I, S>(mut self, srcs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.srcs = srcs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_src_filter(mut self, filter: impl Into<String>) -> Self {
        self.src_filter = Some(filter.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Globally unique identity: `module_path:name`.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.module_path, self.name)
    }

    /// Every reference that must complete before this rule: rule references
    /// in `srcs` followed by `deps`, in declaration order.
    pub fn rule_references(&self) -> impl Iterator<Item = &str> {
        self.srcs
            .iter()
            .filter(|s| is_rule_reference(s))
            .chain(self.deps.iter())
            .map(String::as_str)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    /// String list parameter; a single string is accepted as a one-item list.
    pub fn param_list(&self, key: &str) -> Option<Vec<String>> {
        match self.params.get(key)? {
            serde_json::Value::String(s) => Some(vec![s.clone()]),
            serde_json::Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Content key of the declaration itself. Changing any attribute
    /// invalidates cached results of this rule.
    pub fn definition_key(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.identity().as_bytes());
        hasher.update(self.rule_type.as_bytes());
        for src in &self.srcs {
            hasher.update(b"src:");
            hasher.update(src.as_bytes());
        }
        for dep in &self.deps {
            hasher.update(b"dep:");
            hasher.update(dep.as_bytes());
        }
        if let Some(filter) = &self.src_filter {
            hasher.update(b"filter:");
            hasher.update(filter.as_bytes());
        }
        // serde_json::Map is ordered by key, so this is deterministic
        let params = serde_json::Value::Object(self.params.clone()).to_string();
        hasher.update(params.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Rule names must be non-empty, free of whitespace and must not start
/// with `:`.
pub fn validate_rule_name(name: &str) -> Result<(), GraphError> {
    let reason = if name.is_empty() {
        "rule names must not be empty"
    } else if name.chars().any(char::is_whitespace) {
        "rule names must not contain whitespace"
    } else if name.starts_with(':') {
        "rule names must not start with ':'"
    } else {
        return Ok(());
    };
    Err(GraphError::InvalidReference {
        reference: name.to_string(),
        reason: reason.to_string(),
    })
}

/// Whether `value` names a rule rather than a file: it contains `:` and no
/// path separator follows the last `:`.
pub fn is_rule_reference(value: &str) -> bool {
    match value.rfind(':') {
        Some(idx) => !value[idx + 1..].contains(['/', '\\']),
        None => false,
    }
}

/// A rule declared directly in a module, or one named by shorthand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// `/path:name` or `rel/path:name`
    Explicit,
    /// `/path`, naming the rule after the last path component
    ModuleShorthand,
    /// `:name`, inside the requesting module
    LocalShorthand,
}

/// A target reference after syntactic expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRef {
    pub reference: String,
    pub module_path: String,
    pub name: String,
    pub kind: RefKind,
}

impl TargetRef {
    /// Expands `reference` as seen from `requesting_module`. Purely
    /// syntactic: no module is loaded.
    pub fn parse(reference: &str, requesting_module: Option<&str>) -> Result<Self, GraphError> {
        let invalid = |reason: &str| GraphError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };
        let ambiguous = || GraphError::AmbiguousReference {
            reference: reference.to_string(),
        };

        if reference.trim().is_empty() {
            return Err(invalid("empty reference"));
        }

        let (module_part, name_part) = if is_rule_reference(reference) {
            let idx = reference.rfind(':').ok_or_else(|| invalid("missing ':'"))?;
            (&reference[..idx], Some(&reference[idx + 1..]))
        } else {
            (reference, None)
        };

        let base = requesting_module.unwrap_or(ROOT_MODULE);
        match name_part {
            Some(name) if module_part.is_empty() => {
                let module = requesting_module.ok_or_else(ambiguous)?;
                validate_rule_name(name)?;
                Ok(Self {
                    reference: reference.to_string(),
                    module_path: normalize_module_path(module, "")?,
                    name: name.to_string(),
                    kind: RefKind::LocalShorthand,
                })
            }
            Some(name) => {
                validate_rule_name(name)?;
                Ok(Self {
                    reference: reference.to_string(),
                    module_path: normalize_module_path(base, module_part)
                        .map_err(|_| invalid("module path escapes the project root"))?,
                    name: name.to_string(),
                    kind: RefKind::Explicit,
                })
            }
            None => {
                let module_path = normalize_module_path(base, module_part)
                    .map_err(|_| invalid("module path escapes the project root"))?;
                let name = module_path
                    .rsplit('/')
                    .find(|c| !c.is_empty())
                    .ok_or_else(ambiguous)?
                    .to_string();
                Ok(Self {
                    reference: reference.to_string(),
                    module_path,
                    name,
                    kind: RefKind::ModuleShorthand,
                })
            }
        }
    }

    pub fn identity(&self) -> String {
        format!("{}:{}", self.module_path, self.name)
    }

    pub fn is_shorthand(&self) -> bool {
        self.kind != RefKind::Explicit
    }
}

/// Joins `path` onto `base` (unless absolute) and normalizes `.`/`..`.
/// Results always start with `/`.
pub fn normalize_module_path(base: &str, path: &str) -> Result<String, GraphError> {
    let mut components: Vec<&str> = Vec::new();
    let joined: Vec<&str> = if path.starts_with('/') || path.starts_with('\\') {
        path.split(['/', '\\']).collect()
    } else {
        base.split(['/', '\\']).chain(path.split(['/', '\\'])).collect()
    };
    for component in joined {
        match component {
            "" | "." => {}
            ".." => {
                if components.pop().is_none() {
                    return Err(GraphError::InvalidReference {
                        reference: path.to_string(),
                        reason: "module path escapes the project root".to_string(),
                    });
                }
            }
            other => components.push(other),
        }
    }
    Ok(format!("/{}", components.join("/")))
}

/// All rules declared in one module file.
#[derive(Debug, Clone, Default)]
pub struct Module {
    path: String,
    rules: BTreeMap<String, Arc<Rule>>,
}

impl Module {
    /// Builds a module, stamping each rule with the module path. Names are
    /// validated and must be unique.
    pub fn new(path: impl Into<String>, rules: Vec<Rule>) -> Result<Self, GraphError> {
        let path = normalize_module_path(ROOT_MODULE, &path.into())?;
        let mut map = BTreeMap::new();
        for mut rule in rules {
            validate_rule_name(&rule.name)?;
            rule.module_path = path.clone();
            let identity = rule.identity();
            if map.insert(rule.name.clone(), Arc::new(rule)).is_some() {
                return Err(GraphError::DuplicateRule { rule: identity });
            }
        }
        Ok(Self { path, rules: map })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn rule(&self, name: &str) -> Option<Arc<Rule>> {
        self.rules.get(name).cloned()
    }

    pub fn rules(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

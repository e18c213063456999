use crate::error::CacheError;
use crate::hasher;
use crate::rule::Rule;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Decides whether a rule can be skipped and remembers what it produced.
pub trait RuleCache: Send + Sync {
    /// True when the rule definition, its inputs and its recorded outputs are
    /// exactly as they were after the last successful run. Never writes.
    fn is_unchanged(&self, rule: &Rule, inputs: &[PathBuf]) -> Result<bool, CacheError>;

    /// Stores the state after a successful run.
    fn record_outputs(
        &self,
        rule: &Rule,
        inputs: &[PathBuf],
        outputs: &[PathBuf],
    ) -> Result<(), CacheError>;

    /// Outputs stored by the last `record_outputs` for this rule.
    fn recorded_outputs(&self, rule: &Rule) -> Option<Vec<PathBuf>>;

    /// Drops the rule's record so its next build runs unconditionally.
    fn forget(&self, rule: &Rule) -> Result<(), CacheError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Hash of the rule declaration
    pub rule_key: String,
    /// Input path and content hash, in input order
    pub inputs: Vec<(PathBuf, String)>,
    pub outputs: Vec<PathBuf>,
    pub recorded_at: i64,
}

/// Rule cache persisted as a JSON index in the cache directory.
pub struct FileCache {
    index_path: PathBuf,
    store: Arc<RwLock<HashMap<String, CacheRecord>>>,
}

impl FileCache {
    /// Opens the index below `cache_dir`. A missing index is an empty cache;
    /// nothing is created until the first record is stored.
    pub fn open(cache_dir: &Path) -> Result<Self, CacheError> {
        let index_path = cache_dir.join(crate::constants::CACHE_INDEX_FILE);
        let store = Self::load_index(&index_path)?;
        Ok(Self {
            index_path,
            store: Arc::new(RwLock::new(store)),
        })
    }

    fn load_index(path: &Path) -> Result<HashMap<String, CacheRecord>, CacheError> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = fs::read_to_string(path).map_err(|source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match serde_json::from_str(&content) {
            Ok(store) => Ok(store),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Discarding corrupt cache index");
                Ok(HashMap::new())
            }
        }
    }

    // Called with the write lock held so concurrent records serialize.
    fn save_index(&self, store: &HashMap<String, CacheRecord>) -> Result<(), CacheError> {
        let io_error = |source| CacheError::Io {
            path: self.index_path.clone(),
            source,
        };
        if let Some(dir) = self.index_path.parent() {
            fs::create_dir_all(dir).map_err(io_error)?;
        }
        let content = serde_json::to_string_pretty(store)?;
        let tmp = self.index_path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(io_error)?;
        fs::rename(&tmp, &self.index_path).map_err(io_error)?;
        Ok(())
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    pub fn record(&self, identity: &str) -> Option<CacheRecord> {
        self.store.read().get(identity).cloned()
    }

    fn fingerprint(inputs: &[PathBuf]) -> Result<Vec<(PathBuf, String)>, CacheError> {
        hasher::fingerprint_files(inputs).map_err(|e| CacheError::Io {
            path: inputs.first().cloned().unwrap_or_default(),
            source: std::io::Error::new(std::io::ErrorKind::Other, format!("{:#}", e)),
        })
    }
}

impl RuleCache for FileCache {
    fn is_unchanged(&self, rule: &Rule, inputs: &[PathBuf]) -> Result<bool, CacheError> {
        let Some(record) = self.record(&rule.identity()) else {
            return Ok(false);
        };
        if record.rule_key != rule.definition_key() || record.inputs.len() != inputs.len() {
            return Ok(false);
        }
        if record
            .inputs
            .iter()
            .zip(inputs)
            .any(|((recorded, _), current)| recorded != current)
        {
            return Ok(false);
        }
        if !record.outputs.iter().all(|p| p.exists()) {
            return Ok(false);
        }
        let current = Self::fingerprint(inputs)?;
        Ok(current == record.inputs)
    }

    fn record_outputs(
        &self,
        rule: &Rule,
        inputs: &[PathBuf],
        outputs: &[PathBuf],
    ) -> Result<(), CacheError> {
        let record = CacheRecord {
            rule_key: rule.definition_key(),
            inputs: Self::fingerprint(inputs)?,
            outputs: outputs.to_vec(),
            recorded_at: chrono::Utc::now().timestamp(),
        };
        let mut store = self.store.write();
        store.insert(rule.identity(), record);
        self.save_index(&store)
    }

    fn recorded_outputs(&self, rule: &Rule) -> Option<Vec<PathBuf>> {
        self.record(&rule.identity()).map(|r| r.outputs)
    }

    fn forget(&self, rule: &Rule) -> Result<(), CacheError> {
        let mut store = self.store.write();
        if store.remove(&rule.identity()).is_some() {
            self.save_index(&store)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, FileCache, Rule, Vec<PathBuf>) {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.txt");
        fs::write(&input, "one").unwrap();
        let cache = FileCache::open(&dir.path().join(".build-cache")).unwrap();
        let rule = Rule::new("/", "a", "file_set").with_srcs(["a.txt"]);
        (dir, cache, rule, vec![input])
    }

    #[test]
    fn test_unknown_rule_is_changed() {
        let (_dir, cache, rule, inputs) = setup();
        assert!(!cache.is_unchanged(&rule, &inputs).unwrap());
        assert!(!cache.index_path().exists(), "lookups must not write");
    }

    #[test]
    fn test_record_then_unchanged_until_input_edit() {
        let (_dir, cache, rule, inputs) = setup();
        cache.record_outputs(&rule, &inputs, &inputs).unwrap();
        assert!(cache.is_unchanged(&rule, &inputs).unwrap());

        fs::write(&inputs[0], "two").unwrap();
        assert!(!cache.is_unchanged(&rule, &inputs).unwrap());
    }

    #[test]
    fn test_definition_change_invalidates() {
        let (_dir, cache, rule, inputs) = setup();
        cache.record_outputs(&rule, &inputs, &[]).unwrap();
        let edited = rule.clone().with_src_filter("*.txt");
        assert!(!cache.is_unchanged(&edited, &inputs).unwrap());
    }

    #[test]
    fn test_missing_output_invalidates() {
        let (dir, cache, rule, inputs) = setup();
        let output = dir.path().join("out.txt");
        fs::write(&output, "x").unwrap();
        cache
            .record_outputs(&rule, &inputs, &[output.clone()])
            .unwrap();
        assert!(cache.is_unchanged(&rule, &inputs).unwrap());
        fs::remove_file(&output).unwrap();
        assert!(!cache.is_unchanged(&rule, &inputs).unwrap());
    }

    #[test]
    fn test_index_persists_and_forget() {
        let (dir, cache, rule, inputs) = setup();
        cache.record_outputs(&rule, &inputs, &inputs).unwrap();

        let reopened = FileCache::open(&dir.path().join(".build-cache")).unwrap();
        assert_eq!(reopened.recorded_outputs(&rule), Some(inputs.clone()));

        reopened.forget(&rule).unwrap();
        let again = FileCache::open(&dir.path().join(".build-cache")).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_corrupt_index_is_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join(".build-cache");
        fs::create_dir_all(&cache_dir).unwrap();
        fs::write(cache_dir.join("index.json"), "{broken").unwrap();
        assert!(FileCache::open(&cache_dir).unwrap().is_empty());
    }
}

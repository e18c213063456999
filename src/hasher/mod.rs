pub mod ignore;
pub mod walker;

pub use ignore::IgnoreRules;
pub use walker::walk_dir;

use anyhow::{Context, Result};
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

/// Streams a file through BLAKE3.
pub fn hash_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Content fingerprints of `paths`, computed in parallel. The result keeps
/// the input order.
pub fn fingerprint_files(paths: &[PathBuf]) -> Result<Vec<(PathBuf, String)>> {
    paths
        .par_iter()
        .map(|path| Ok((path.clone(), hash_file(path)?)))
        .collect()
}

/// Files below a source directory, skipping build output directories.
pub fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    walk_dir(root, &IgnoreRules::build_dirs())
}

//! Bytecode cache.
//!
//! Compiled artifacts live in a `__etch__/` directory sibling to the
//! source file; the cache key is a content hash of the source, so edits
//! invalidate naturally and `--force` simply skips the lookup.

use std::{
    fs,
    path::{Path, PathBuf},
};

use etch_core::{crc32_ieee, CoreError, CoreResult};

/// Directory name used for cached bytecode.
pub const CACHE_DIR: &str = "__etch__";

/// Cache directory for a given source path (sibling `__etch__/`).
pub fn cache_dir(source: &Path) -> PathBuf {
    match source.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(CACHE_DIR),
        _ => PathBuf::from(CACHE_DIR),
    }
}

/// Cache key for source contents (hex CRC32).
pub fn cache_key(contents: &[u8]) -> String {
    format!("{:08x}", crc32_ieee(contents))
}

/// Path the cached artifact for `source` would live at. Reads the source
/// to derive the key.
pub fn cache_path(source: &Path) -> CoreResult<PathBuf> {
    let contents = fs::read(source)
        .map_err(|e| CoreError::corrupted(format!("cannot read {}: {e}", source.display())))?;
    Ok(cache_dir(source).join(format!("{}.etcx", cache_key(&contents))))
}

/// Looks up a cached artifact. `force` bypasses the cache entirely.
pub fn lookup(source: &Path, force: bool) -> CoreResult<Option<PathBuf>> {
    if force {
        return Ok(None);
    }
    let path = cache_path(source)?;
    Ok(path.is_file().then_some(path))
}

/// Stores freshly compiled bytecode for `source`, creating the cache
/// directory as needed. Returns the artifact path.
pub fn store(source: &Path, bytecode: &[u8]) -> CoreResult<PathBuf> {
    let path = cache_path(source)?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| CoreError::corrupted(format!("cannot create {}: {e}", dir.display())))?;
    }
    fs::write(&path, bytecode)
        .map_err(|e| CoreError::corrupted(format!("cannot write {}: {e}", path.display())))?;
    Ok(path)
}

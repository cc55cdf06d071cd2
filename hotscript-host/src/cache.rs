//! Content-addressed compile cache
//!
//! Entries live at `<dir>/<hash>-<hostVersion>.bin` (image) and `.pdb`
//! (symbols). The host version is part of the key, so upgrading the host
//! simply stops hitting old entries. Nothing is ever deleted here.

use crate::compiler::CompiledArtifact;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Cache read/write failure
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O failed at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Hex blake3 digest of the source text
pub fn source_hash(source: &str) -> String {
    blake3::hash(source.as_bytes()).to_hex().to_string()
}

/// Address of one cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub hash: String,
    pub host_version: String,
}

impl CacheKey {
    pub fn new(hash: impl Into<String>, host_version: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            host_version: host_version.into(),
        }
    }

    pub fn for_source(source: &str, host_version: &str) -> Self {
        Self::new(source_hash(source), host_version)
    }

    fn stem(&self) -> String {
        // Host versions come from config; keep them out of path syntax.
        let version: String = self
            .host_version
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        format!("{}-{}", self.hash, version)
    }
}

/// Filesystem-backed cache of compiled artifacts
#[derive(Debug, Clone)]
pub struct ScriptCache {
    dir: PathBuf,
}

impl ScriptCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Image and symbol file paths of an entry
    pub fn paths(&self, key: &CacheKey) -> (PathBuf, PathBuf) {
        let stem = key.stem();
        (
            self.dir.join(format!("{stem}.bin")),
            self.dir.join(format!("{stem}.pdb")),
        )
    }

    /// Load an entry; `None` unless both blobs exist
    pub fn load(&self, key: &CacheKey) -> Result<Option<CompiledArtifact>, CacheError> {
        let (bin, pdb) = self.paths(key);
        let Some(image) = read_optional(&bin)? else {
            return Ok(None);
        };
        let Some(symbols) = read_optional(&pdb)? else {
            return Ok(None);
        };
        Ok(Some(CompiledArtifact { image, symbols }))
    }

    /// Persist an entry. Each blob is written to a temp file and renamed so a
    /// crash never leaves a truncated entry behind.
    pub fn store(&self, key: &CacheKey, artifact: &CompiledArtifact) -> Result<(), CacheError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| CacheError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let (bin, pdb) = self.paths(key);
        write_atomic(&pdb, &artifact.symbols)?;
        write_atomic(&bin, &artifact.image)?;
        Ok(())
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, CacheError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(CacheError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes)
        .and_then(|_| std::fs::rename(&tmp, path))
        .map_err(|source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn artifact() -> CompiledArtifact {
        CompiledArtifact {
            image: b"image".to_vec(),
            symbols: b"symbols".to_vec(),
        }
    }

    #[test]
    fn test_key_layout() {
        let cache = ScriptCache::new("/cache");
        let key = CacheKey::new("abc", "1.2.0");
        let (bin, pdb) = cache.paths(&key);
        assert_eq!(bin, PathBuf::from("/cache/abc-1.2.0.bin"));
        assert_eq!(pdb, PathBuf::from("/cache/abc-1.2.0.pdb"));
    }

    #[test]
    fn test_hash_depends_on_content_only() {
        assert_eq!(source_hash("a"), source_hash("a"));
        assert_ne!(source_hash("a"), source_hash("b"));
        assert_eq!(source_hash("a").len(), 64);
    }

    #[test]
    fn test_store_then_load() {
        let temp = TempDir::new().unwrap();
        let cache = ScriptCache::new(temp.path().join("ScriptCache"));
        let key = CacheKey::for_source("(module)", "1.0.0");

        assert_eq!(cache.load(&key).unwrap(), None);
        cache.store(&key, &artifact()).unwrap();
        assert_eq!(cache.load(&key).unwrap(), Some(artifact()));
    }

    #[test]
    fn test_host_version_changes_key() {
        let temp = TempDir::new().unwrap();
        let cache = ScriptCache::new(temp.path());
        cache
            .store(&CacheKey::for_source("src", "1.0.0"), &artifact())
            .unwrap();

        assert!(cache
            .load(&CacheKey::for_source("src", "1.0.1"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_missing_symbols_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let cache = ScriptCache::new(temp.path());
        let key = CacheKey::for_source("src", "1.0.0");
        cache.store(&key, &artifact()).unwrap();
        std::fs::remove_file(cache.paths(&key).1).unwrap();

        assert_eq!(cache.load(&key).unwrap(), None);
    }
}

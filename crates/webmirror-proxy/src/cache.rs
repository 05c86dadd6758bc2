//! Disk-backed response cache.
//!
//! Each entry is a `<safeSlug>_<key>.json` metadata file plus a matching
//! `.bin` body file, both in one flat directory so purge-by-slug is a prefix
//! scan. Keys are hex SHA-256 over `method:url`. Reads treat any damaged or
//! expired entry as a miss and clean it up in passing; eviction is
//! oldest-write-first (access does not refresh `cached_at_ms`).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use webmirror_core::{Error, Result};

const SAFE_SLUG_MAX: usize = 80;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMeta {
    pub schema_version: u32,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub cached_at_ms: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub meta: CacheMeta,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: u64,
    pub used_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
    ttl_seconds: u64,
    max_bytes: u64,
}

/// Deterministic key: hex SHA-256 of `method:url`.
pub fn cache_key(method: &str, url: &str) -> String {
    let mut h = Sha256::new();
    h.update(method.as_bytes());
    h.update(b":");
    h.update(url.as_bytes());
    hex::encode(h.finalize())
}

/// Fold anything outside `[A-Za-z0-9_-]` to `_` and bound the length, so a
/// slug can never escape the cache directory or collide across filesystems.
pub fn safe_slug(slug: &str) -> String {
    slug.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(SAFE_SLUG_MAX)
        .collect()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>, ttl_seconds: u64, max_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            ttl_seconds,
            max_bytes,
        }
    }

    fn paths(&self, slug: &str, key: &str) -> (PathBuf, PathBuf) {
        let stem = format!("{}_{}", safe_slug(slug), key);
        (
            self.dir.join(format!("{stem}.json")),
            self.dir.join(format!("{stem}.bin")),
        )
    }

    fn is_expired(&self, meta: &CacheMeta) -> bool {
        now_ms().saturating_sub(meta.cached_at_ms) / 1000 > self.ttl_seconds
    }

    /// Fresh entry or `None`. Damaged, expired and half-evicted entries are
    /// removed on the way out and reported as misses.
    pub fn get(&self, slug: &str, key: &str) -> Result<Option<CachedEntry>> {
        let (meta_p, body_p) = self.paths(slug, key);
        let meta_bytes = match std::fs::read(&meta_p) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Cache(format!("read {}: {e}", meta_p.display()))),
        };
        let meta: CacheMeta = match serde_json::from_slice(&meta_bytes) {
            Ok(m) => m,
            Err(_) => {
                let _ = std::fs::remove_file(&meta_p);
                return Ok(None);
            }
        };
        if self.is_expired(&meta) {
            let _ = std::fs::remove_file(&meta_p);
            let _ = std::fs::remove_file(&body_p);
            return Ok(None);
        }
        let body = match std::fs::read(&body_p) {
            Ok(b) => b,
            // Raced an eviction: the metadata survived but the body is gone.
            Err(_) => {
                let _ = std::fs::remove_file(&meta_p);
                return Ok(None);
            }
        };
        Ok(Some(CachedEntry { meta, body }))
    }

    /// Store one 2xx response. Entries larger than half the cache budget are
    /// refused silently; everything else is written body-first so a reader
    /// never observes metadata without its body.
    pub fn set(
        &self,
        slug: &str,
        key: &str,
        status: u16,
        headers: &BTreeMap<String, String>,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<()> {
        let size = body.len() as u64;
        if size > self.max_bytes / 2 {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| Error::Cache(format!("mkdir {}: {e}", self.dir.display())))?;
        let (meta_p, body_p) = self.paths(slug, key);

        let meta = CacheMeta {
            schema_version: 1,
            status,
            headers: headers.clone(),
            content_type: content_type.map(|s| s.to_string()),
            cached_at_ms: now_ms(),
            size,
        };

        write_atomic(&self.dir, &body_p, body)?;
        let meta_bytes = serde_json::to_vec(&meta).map_err(|e| Error::Cache(e.to_string()))?;
        write_atomic(&self.dir, &meta_p, &meta_bytes)?;

        self.prune()
    }

    /// Drop expired entries and orphans, then evict oldest-first until total
    /// live bytes fit the budget.
    pub fn prune(&self) -> Result<()> {
        let mut live: Vec<(PathBuf, PathBuf, CacheMeta)> = Vec::new();
        for meta_p in self.metadata_files()? {
            let body_p = meta_p.with_extension("bin");
            let meta: Option<CacheMeta> = std::fs::read(&meta_p)
                .ok()
                .and_then(|b| serde_json::from_slice(&b).ok());
            let meta = match meta {
                Some(m) => m,
                None => {
                    let _ = std::fs::remove_file(&meta_p);
                    let _ = std::fs::remove_file(&body_p);
                    continue;
                }
            };
            if self.is_expired(&meta) || !body_p.exists() {
                let _ = std::fs::remove_file(&meta_p);
                let _ = std::fs::remove_file(&body_p);
                continue;
            }
            live.push((meta_p, body_p, meta));
        }

        // Bodies whose metadata is already gone are unreachable; drop them.
        for body_p in self.files_with_extension("bin")? {
            if !body_p.with_extension("json").exists() {
                let _ = std::fs::remove_file(&body_p);
            }
        }

        let mut total: u64 = live.iter().map(|(_, _, m)| m.size).sum();
        if total <= self.max_bytes {
            return Ok(());
        }
        live.sort_by_key(|(_, _, m)| m.cached_at_ms);
        for (meta_p, body_p, meta) in live {
            if total <= self.max_bytes {
                break;
            }
            let _ = std::fs::remove_file(&meta_p);
            let _ = std::fs::remove_file(&body_p);
            total = total.saturating_sub(meta.size);
        }
        Ok(())
    }

    pub fn purge_all(&self) -> Result<u64> {
        let mut removed = 0;
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::Cache(format!("readdir: {e}"))),
        };
        for entry in entries.flatten() {
            if entry.path().is_file() && std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn purge_by_slug(&self, slug: &str) -> Result<u64> {
        let prefix = format!("{}_", safe_slug(slug));
        let mut removed = 0;
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::Cache(format!("readdir: {e}"))),
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Count and byte-sum of non-expired entries.
    pub fn stats(&self) -> Result<CacheStats> {
        let mut entries = 0;
        let mut used_bytes = 0;
        for meta_p in self.metadata_files()? {
            let meta: Option<CacheMeta> = std::fs::read(&meta_p)
                .ok()
                .and_then(|b| serde_json::from_slice(&b).ok());
            if let Some(meta) = meta {
                if !self.is_expired(&meta) && meta_p.with_extension("bin").exists() {
                    entries += 1;
                    used_bytes += meta.size;
                }
            }
        }
        Ok(CacheStats {
            entries,
            used_bytes,
        })
    }

    fn metadata_files(&self) -> Result<Vec<PathBuf>> {
        self.files_with_extension("json")
    }

    fn files_with_extension(&self, ext: &str) -> Result<Vec<PathBuf>> {
        let rd = match std::fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Cache(format!("readdir: {e}"))),
        };
        Ok(rd
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some(ext))
            .collect())
    }
}

fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Error::Cache(format!("tempfile: {e}")))?;
    tmp.write_all(bytes)
        .map_err(|e| Error::Cache(format!("write: {e}")))?;
    tmp.persist(target)
        .map_err(|e| Error::Cache(format!("persist {}: {e}", target.display())))?;
    Ok(())
}

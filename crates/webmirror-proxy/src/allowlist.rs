//! Positive host policy, persisted as a single JSON document.
//!
//! The in-memory snapshot lives behind an `RwLock`; mutations rewrite the file
//! atomically (temp file + rename) before the snapshot is swapped, so a crash
//! mid-write never leaves a half-serialized policy on disk.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use url::Url;
use webmirror_core::{AllowlistEntry, Error, Result};

const ALLOWED_SCHEMES: &[&str] = &["https", "http"];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AllowlistFile {
    version: u32,
    entries: Vec<AllowlistEntry>,
}

impl Default for AllowlistFile {
    fn default() -> Self {
        Self {
            version: 1,
            entries: Vec::new(),
        }
    }
}

/// Upsert input: everything but `host` is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowlistUpsert {
    #[serde(default)]
    pub id: Option<String>,
    pub host: String,
    #[serde(default)]
    pub allow_subdomains: Option<bool>,
    #[serde(default)]
    pub schemes: Option<Vec<String>>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowlistPatch {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub allow_subdomains: Option<bool>,
    #[serde(default)]
    pub schemes: Option<Vec<String>>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug)]
pub struct AllowlistStore {
    path: PathBuf,
    inner: RwLock<AllowlistFile>,
}

impl AllowlistStore {
    /// Load the policy from `path`. A missing file is an empty policy, not an
    /// error; a present-but-unparseable file is an error (failing open on a
    /// corrupt allowlist would widen the egress policy).
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = read_allowlist_file(&path)?;
        Ok(Self {
            path,
            inner: RwLock::new(file),
        })
    }

    pub fn list(&self) -> Vec<AllowlistEntry> {
        self.inner.read().expect("allowlist lock").entries.clone()
    }

    pub fn get_by_id(&self, id: &str) -> Option<AllowlistEntry> {
        self.inner
            .read()
            .expect("allowlist lock")
            .entries
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    /// Insert or replace the entry identified by `id` (derived from the
    /// normalized host when absent).
    pub fn upsert(&self, input: AllowlistUpsert) -> Result<AllowlistEntry> {
        let host = normalize_host(&input.host);
        if host.is_empty() {
            return Err(Error::InvalidBody);
        }
        let id = match input.id {
            Some(id) if !id.trim().is_empty() => slugify(id.trim()),
            _ => slugify(&host),
        };
        let entry = AllowlistEntry {
            id,
            host,
            allow_subdomains: input.allow_subdomains.unwrap_or(false),
            schemes: normalize_schemes(input.schemes.unwrap_or_default()),
            enabled: input.enabled.unwrap_or(true),
            label: input.label.filter(|l| !l.trim().is_empty()),
        };

        let mut inner = self.inner.write().expect("allowlist lock");
        match inner.entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry.clone(),
            None => inner.entries.push(entry.clone()),
        }
        persist(&self.path, &inner)?;
        Ok(entry)
    }

    pub fn patch(&self, id: &str, patch: AllowlistPatch) -> Result<AllowlistEntry> {
        let mut inner = self.inner.write().expect("allowlist lock");
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(Error::NotFound)?;
        if let Some(host) = patch.host {
            let host = normalize_host(&host);
            if host.is_empty() {
                return Err(Error::InvalidBody);
            }
            entry.host = host;
        }
        if let Some(v) = patch.allow_subdomains {
            entry.allow_subdomains = v;
        }
        if let Some(schemes) = patch.schemes {
            entry.schemes = normalize_schemes(schemes);
        }
        if let Some(v) = patch.enabled {
            entry.enabled = v;
        }
        if let Some(label) = patch.label {
            entry.label = if label.trim().is_empty() {
                None
            } else {
                Some(label)
            };
        }
        let updated = entry.clone();
        persist(&self.path, &inner)?;
        Ok(updated)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().expect("allowlist lock");
        let before = inner.entries.len();
        inner.entries.retain(|e| e.id != id);
        if inner.entries.len() == before {
            return Err(Error::NotFound);
        }
        persist(&self.path, &inner)
    }

    /// Re-read the on-disk document and swap the snapshot in one step.
    pub fn reload(&self) -> Result<usize> {
        let file = read_allowlist_file(&self.path)?;
        let n = file.entries.len();
        *self.inner.write().expect("allowlist lock") = file;
        Ok(n)
    }

    /// First enabled entry whose host+scheme admit `url`, if any.
    pub fn match_url(&self, url: &Url) -> Option<AllowlistEntry> {
        let host = url.host_str()?.trim_end_matches('.').to_ascii_lowercase();
        let scheme = url.scheme();
        self.inner
            .read()
            .expect("allowlist lock")
            .entries
            .iter()
            .find(|e| {
                e.enabled
                    && e.schemes.iter().any(|s| s == scheme)
                    && entry_admits_host(e, &host)
            })
            .cloned()
    }

    pub fn is_allowed(&self, url: &Url) -> bool {
        self.match_url(url).is_some()
    }
}

/// Exact match, or strict suffix with a boundary dot when the entry opts in.
fn entry_admits_host(entry: &AllowlistEntry, host: &str) -> bool {
    host == entry.host
        || (entry.allow_subdomains && host.ends_with(&format!(".{}", entry.host)))
}

pub fn normalize_host(host: &str) -> String {
    host.trim().trim_matches('.').to_ascii_lowercase()
}

fn normalize_schemes(schemes: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for s in schemes {
        let s = s.trim().to_ascii_lowercase();
        if ALLOWED_SCHEMES.contains(&s.as_str()) && !out.contains(&s) {
            out.push(s);
        }
    }
    if out.is_empty() {
        out.push("https".to_string());
    }
    out
}

/// Slug-cased identifier: lowercase, non-alphanumeric runs folded to `-`.
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_dash = false;
    for c in s.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }
    out
}

fn read_allowlist_file(path: &Path) -> Result<AllowlistFile> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(AllowlistFile::default())
        }
        Err(e) => return Err(Error::Allowlist(format!("read {}: {e}", path.display()))),
    };
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::Allowlist(format!("parse {}: {e}", path.display())))
}

fn persist(path: &Path, file: &AllowlistFile) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .map_err(|e| Error::Allowlist(format!("mkdir {}: {e}", parent.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| Error::Allowlist(format!("tempfile: {e}")))?;
    let bytes = serde_json::to_vec_pretty(file).map_err(|e| Error::Allowlist(e.to_string()))?;
    tmp.write_all(&bytes)
        .map_err(|e| Error::Allowlist(format!("write: {e}")))?;
    tmp.persist(path)
        .map_err(|e| Error::Allowlist(format!("persist {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, AllowlistStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = AllowlistStore::load(dir.path().join("allowlist.json")).unwrap();
        (dir, store)
    }

    fn upsert_host(store: &AllowlistStore, host: &str) -> AllowlistEntry {
        store
            .upsert(AllowlistUpsert {
                id: None,
                host: host.to_string(),
                allow_subdomains: None,
                schemes: None,
                enabled: None,
                label: None,
            })
            .unwrap()
    }

    #[test]
    fn missing_file_is_an_empty_policy() {
        let (_dir, store) = store();
        assert!(store.list().is_empty());
        assert!(!store.is_allowed(&Url::parse("https://example.com/").unwrap()));
    }

    #[test]
    fn upsert_normalizes_and_defaults() {
        let (_dir, store) = store();
        let e = upsert_host(&store, "  .Example.COM. ");
        assert_eq!(e.id, "example-com");
        assert_eq!(e.host, "example.com");
        assert_eq!(e.schemes, vec!["https"]);
        assert!(e.enabled);
        assert!(!e.allow_subdomains);
    }

    #[test]
    fn match_requires_scheme_membership() {
        let (_dir, store) = store();
        upsert_host(&store, "example.com");
        assert!(store.is_allowed(&Url::parse("https://example.com/a").unwrap()));
        assert!(!store.is_allowed(&Url::parse("http://example.com/a").unwrap()));
    }

    #[test]
    fn subdomain_match_is_boundary_strict() {
        let (_dir, store) = store();
        store
            .upsert(AllowlistUpsert {
                id: None,
                host: "example.com".to_string(),
                allow_subdomains: Some(true),
                schemes: None,
                enabled: None,
                label: None,
            })
            .unwrap();
        assert!(store.is_allowed(&Url::parse("https://docs.example.com/").unwrap()));
        assert!(store.is_allowed(&Url::parse("https://a.b.example.com/").unwrap()));
        // No boundary dot: a lookalike registrable domain must not match.
        assert!(!store.is_allowed(&Url::parse("https://evilexample.com/").unwrap()));
    }

    #[test]
    fn disabled_entries_do_not_match() {
        let (_dir, store) = store();
        let e = upsert_host(&store, "example.com");
        store
            .patch(
                &e.id,
                AllowlistPatch {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!store.is_allowed(&Url::parse("https://example.com/").unwrap()));
    }

    #[test]
    fn mutations_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allowlist.json");
        let store = AllowlistStore::load(&path).unwrap();
        upsert_host(&store, "example.com");

        let second = AllowlistStore::load(&path).unwrap();
        assert_eq!(second.list().len(), 1);
        assert_eq!(second.list()[0].host, "example.com");

        second.remove("example-com").unwrap();
        assert_eq!(store.reload().unwrap(), 0);
        assert!(store.list().is_empty());
    }

    #[test]
    fn remove_unknown_id_is_not_found() {
        let (_dir, store) = store();
        assert_eq!(store.remove("nope").unwrap_err().code(), "not_found");
    }

    #[test]
    fn schemes_are_filtered_to_http_https() {
        let (_dir, store) = store();
        let e = store
            .upsert(AllowlistUpsert {
                id: None,
                host: "example.com".to_string(),
                allow_subdomains: None,
                schemes: Some(vec!["HTTPS".into(), "gopher".into(), "http".into()]),
                enabled: None,
                label: None,
            })
            .unwrap();
        assert_eq!(e.schemes, vec!["https", "http"]);
    }
}

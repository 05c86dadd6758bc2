//! Slug ↔ origin registry and append-only event log, on SQLite.
//!
//! All access goes through one connection behind a mutex: the registry is the
//! only writer of its tables and writes must serialize. Slug uniqueness and
//! the one-enabled-record-per-origin invariant are enforced by the schema, so
//! allocation races degrade into a constraint conflict plus a re-read instead
//! of duplicate records.

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use webmirror_core::{Error, Event, EventKind, EventLevel, MirrorRecord, Result};

pub const SLUG_MAX: usize = 48;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS mirrors (
    id TEXT PRIMARY KEY,
    slug TEXT NOT NULL UNIQUE,
    target_origin TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_path TEXT,
    disabled INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS mirrors_enabled_origin
    ON mirrors(target_origin) WHERE disabled = 0;
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    at TEXT NOT NULL,
    level TEXT NOT NULL,
    kind TEXT NOT NULL,
    slug TEXT,
    message TEXT NOT NULL,
    meta_json TEXT
);
"#;

const MIRROR_COLS: &str = "id, slug, target_origin, created_at, updated_at, last_path, disabled";

#[derive(Debug)]
pub struct Registry {
    conn: Mutex<Connection>,
    log_file: Option<PathBuf>,
}

/// Slug base for a hostname: lowercase, non-alphanumeric runs folded to `-`,
/// bounded, `site` when nothing survives.
pub fn base_slug_for_host(host: &str) -> String {
    let mut out = String::with_capacity(host.len());
    let mut pending_dash = false;
    for c in host.to_ascii_lowercase().chars() {
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
    out.truncate(SLUG_MAX);
    let out = out.trim_matches('-').to_string();
    if out.is_empty() {
        "site".to_string()
    } else {
        out
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Registry(e.to_string())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<MirrorRecord> {
    Ok(MirrorRecord {
        id: row.get(0)?,
        slug: row.get(1)?,
        target_origin: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        last_path: row.get(5)?,
        disabled: row.get::<_, i64>(6)? != 0,
    })
}

impl Registry {
    pub fn open(path: impl AsRef<Path>, log_file: Option<PathBuf>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Registry(format!("mkdir {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::init(conn, log_file)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, log_file: Option<PathBuf>) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err)?;
        // journal_mode returns a row, so query it rather than execute it.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            log_file,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn find_by_slug(&self, slug: &str) -> Result<Option<MirrorRecord>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {MIRROR_COLS} FROM mirrors WHERE slug = ?1"),
            params![slug],
            record_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn find_enabled_by_origin(&self, target_origin: &str) -> Result<Option<MirrorRecord>> {
        let conn = self.lock();
        find_enabled_by_origin_locked(&conn, target_origin)
    }

    /// Return the enabled record for `target_origin`, creating it (with a
    /// fresh unique slug) when absent. The boolean is `true` on creation.
    /// `last_path` refreshes the record either way when non-empty.
    pub fn upsert_by_origin(
        &self,
        target_origin: &str,
        host: &str,
        last_path: Option<&str>,
    ) -> Result<(MirrorRecord, bool)> {
        let conn = self.lock();
        if let Some(existing) = find_enabled_by_origin_locked(&conn, target_origin)? {
            touch_locked(&conn, &existing.slug, last_path)?;
            let refreshed = find_by_slug_locked(&conn, &existing.slug)?.unwrap_or(existing);
            return Ok((refreshed, false));
        }

        let base = base_slug_for_host(host);
        let now = now_iso();
        for candidate in slug_candidates(&base) {
            let id = uuid::Uuid::new_v4().to_string();
            let inserted = conn.execute(
                "INSERT INTO mirrors (id, slug, target_origin, created_at, updated_at, last_path, disabled) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                params![id, candidate, target_origin, now, now, last_path.filter(|p| !p.is_empty())],
            );
            match inserted {
                Ok(_) => {
                    let record = find_by_slug_locked(&conn, &candidate)?
                        .ok_or_else(|| Error::Registry("insert not visible".to_string()))?;
                    return Ok((record, true));
                }
                Err(e) if is_constraint_violation(&e) => {
                    // Either we lost an origin race (return the winner) or the
                    // slug is taken (try the next candidate).
                    if let Some(existing) = find_enabled_by_origin_locked(&conn, target_origin)? {
                        touch_locked(&conn, &existing.slug, last_path)?;
                        let refreshed =
                            find_by_slug_locked(&conn, &existing.slug)?.unwrap_or(existing);
                        return Ok((refreshed, false));
                    }
                }
                Err(e) => return Err(db_err(e)),
            }
        }
        Err(Error::Registry(format!("slug space exhausted for {base}")))
    }

    pub fn touch(&self, slug: &str, last_path: Option<&str>) -> Result<()> {
        let conn = self.lock();
        touch_locked(&conn, slug, last_path)
    }

    /// Returns false when no record carries `slug`.
    pub fn set_disabled(&self, slug: &str, disabled: bool) -> Result<bool> {
        let conn = self.lock();
        let n = conn
            .execute(
                "UPDATE mirrors SET disabled = ?1, updated_at = ?2 WHERE slug = ?3",
                params![disabled as i64, now_iso(), slug],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    pub fn list(&self) -> Result<Vec<MirrorRecord>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MIRROR_COLS} FROM mirrors ORDER BY created_at, slug"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], record_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    pub fn mirror_count(&self) -> Result<u64> {
        let conn = self.lock();
        conn.query_row("SELECT COUNT(*) FROM mirrors", [], |r| r.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(db_err)
    }

    /// Append one audit event; mirrored to the JSON-lines log file when
    /// configured (best-effort, never fails the caller).
    pub fn record_event(
        &self,
        level: EventLevel,
        kind: EventKind,
        slug: Option<&str>,
        message: &str,
        meta: Option<serde_json::Value>,
    ) -> Result<i64> {
        let at = now_iso();
        let meta_json = meta.as_ref().map(|m| m.to_string());
        let id = {
            let conn = self.lock();
            conn.execute(
                "INSERT INTO events (at, level, kind, slug, message, meta_json) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![at, level.as_str(), kind.as_str(), slug, message, meta_json],
            )
            .map_err(db_err)?;
            conn.last_insert_rowid()
        };

        if let Some(path) = &self.log_file {
            let line = serde_json::json!({
                "id": id,
                "at": at,
                "level": level.as_str(),
                "kind": kind.as_str(),
                "slug": slug,
                "message": message,
                "meta": meta,
            });
            if let Err(e) = append_log_line(path, &line) {
                tracing::warn!(path = %path.display(), error = %e, "event log mirror write failed");
            }
        }
        Ok(id)
    }

    /// Newest-first slice of the event log.
    pub fn recent_events(&self, limit: u32) -> Result<Vec<Event>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, at, level, kind, slug, message, meta_json \
                 FROM events ORDER BY id DESC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, at, level, kind, slug, message, meta_json)| {
                Some(Event {
                    id,
                    at,
                    level: EventLevel::parse(&level)?,
                    kind: EventKind::parse(&kind)?,
                    slug,
                    message,
                    meta: meta_json.and_then(|m| serde_json::from_str(&m).ok()),
                })
            })
            .collect())
    }
}

fn find_by_slug_locked(conn: &Connection, slug: &str) -> Result<Option<MirrorRecord>> {
    conn.query_row(
        &format!("SELECT {MIRROR_COLS} FROM mirrors WHERE slug = ?1"),
        params![slug],
        record_from_row,
    )
    .optional()
    .map_err(db_err)
}

fn find_enabled_by_origin_locked(
    conn: &Connection,
    target_origin: &str,
) -> Result<Option<MirrorRecord>> {
    conn.query_row(
        &format!("SELECT {MIRROR_COLS} FROM mirrors WHERE target_origin = ?1 AND disabled = 0"),
        params![target_origin],
        record_from_row,
    )
    .optional()
    .map_err(db_err)
}

fn touch_locked(conn: &Connection, slug: &str, last_path: Option<&str>) -> Result<()> {
    conn.execute(
        "UPDATE mirrors SET updated_at = ?1, last_path = COALESCE(?2, last_path) WHERE slug = ?3",
        params![now_iso(), last_path.filter(|p| !p.is_empty()), slug],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Base slug, then `-2`…`-999`, then a handful of random hex suffixes.
fn slug_candidates(base: &str) -> impl Iterator<Item = String> + '_ {
    let numbered = (2..=999u32).map(move |n| format!("{base}-{n}"));
    let random = (0..8).map(move |_| {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        format!("{base}-{}", &hex[..6])
    });
    std::iter::once(base.to_string()).chain(numbered).chain(random)
}

fn append_log_line(path: &Path, line: &serde_json::Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(f, "{line}")
}

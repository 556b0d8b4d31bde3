//! Mapping Repository - durable storage for canonical mappings
//!
//! SQLite tables:
//! - `canonical_map`: one row per `(dim, synonym_key)` where `synonym_key`
//!   is the lowercased synonym
//! - `canonical_meta`: key/value counters, currently only the global
//!   `version` (starts at 1, bumped by every promotion)

use crate::error::{NqlError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

/// A stored synonym -> canonical association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMapping {
    pub dimension: String,
    /// Synonym as it was promoted (original casing).
    pub synonym: String,
    pub canonical: String,
    pub score: f64,
    pub promoted_by: String,
    pub promoted_at: DateTime<Utc>,
    /// Global version assigned by the promotion that last wrote this row.
    pub version: i64,
}

/// What a promotion did to the `(dimension, synonym)` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted { version: i64 },
    Updated { previous_version: i64, version: i64 },
}

impl UpsertOutcome {
    pub fn version(&self) -> i64 {
        match self {
            UpsertOutcome::Inserted { version } | UpsertOutcome::Updated { version, .. } => *version,
        }
    }
}

pub struct MappingRepository {
    path: Option<PathBuf>,
    db: Mutex<Connection>,
}

impl MappingRepository {
    /// Open or create the mapping database at `path`.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db = Connection::open(&path).map_err(|e| {
            NqlError::unavailable(format!("Failed to open {}: {}", path.display(), e))
        })?;
        db.busy_timeout(busy_timeout)?;
        let repo = Self { path: Some(path), db: Mutex::new(db) };
        repo.init_schema()?;
        info!(path = %repo.describe(), "Opened canonical mapping store");
        Ok(repo)
    }

    /// Private in-memory database, for tests and one-off tooling.
    pub fn in_memory() -> Result<Self> {
        let repo = Self { path: None, db: Mutex::new(Connection::open_in_memory()?) };
        repo.init_schema()?;
        Ok(repo)
    }

    pub fn describe(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ":memory:".to_string())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| NqlError::unavailable("canonical store connection lock poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        let db = self.conn()?;
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS canonical_map (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                dim TEXT NOT NULL,
                synonym_key TEXT NOT NULL,
                synonym TEXT NOT NULL,
                canonical TEXT NOT NULL,
                score REAL NOT NULL DEFAULT 1.0,
                promoted_by TEXT NOT NULL,
                promoted_at TEXT NOT NULL,
                version INTEGER NOT NULL,
                UNIQUE(dim, synonym_key)
            );
            CREATE INDEX IF NOT EXISTS idx_canonical_map_dim ON canonical_map(dim);
            CREATE TABLE IF NOT EXISTS canonical_meta (
                k TEXT PRIMARY KEY,
                v INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO canonical_meta(k, v) VALUES ('version', 1);
            "#,
        )?;
        Ok(())
    }

    /// Global version as currently persisted.
    pub fn current_version(&self) -> Result<i64> {
        let db = self.conn()?;
        read_version(&db)
    }

    /// Insert or overwrite the mapping for `(dimension, lowercase(synonym))`
    /// and bump the global version, in one immediate transaction.
    pub fn upsert(
        &self,
        dimension: &str,
        synonym: &str,
        canonical: &str,
        score: f64,
        promoted_by: &str,
        promoted_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let key = synonym.trim().to_lowercase();
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let previous: Option<i64> = tx
            .query_row(
                "SELECT version FROM canonical_map WHERE dim = ?1 AND synonym_key = ?2",
                params![dimension, key],
                |row| row.get(0),
            )
            .optional()?;

        tx.execute("UPDATE canonical_meta SET v = v + 1 WHERE k = 'version'", [])?;
        let version = read_version(&tx)?;

        tx.execute(
            r#"
            INSERT INTO canonical_map
                (dim, synonym_key, synonym, canonical, score, promoted_by, promoted_at, version)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(dim, synonym_key) DO UPDATE SET
                synonym = excluded.synonym,
                canonical = excluded.canonical,
                score = excluded.score,
                promoted_by = excluded.promoted_by,
                promoted_at = excluded.promoted_at,
                version = excluded.version
            "#,
            params![
                dimension,
                key,
                synonym.trim(),
                canonical,
                score,
                promoted_by,
                promoted_at.to_rfc3339(),
                version,
            ],
        )?;
        tx.commit()?;

        debug!(dimension, synonym = %key, version, "Upserted canonical mapping");
        Ok(match previous {
            Some(previous_version) => UpsertOutcome::Updated { previous_version, version },
            None => UpsertOutcome::Inserted { version },
        })
    }

    /// Every mapping plus the version they are consistent with.
    pub fn load_all(&self) -> Result<(i64, Vec<CanonicalMapping>)> {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let version = read_version(&tx)?;
        let mappings = {
            let mut stmt = tx.prepare(
                r#"
                SELECT dim, synonym, canonical, score, promoted_by, promoted_at, version
                FROM canonical_map
                ORDER BY dim, synonym_key
                "#,
            )?;
            let rows = stmt.query_map([], |row| {
                let promoted_at: String = row.get(5)?;
                Ok(CanonicalMapping {
                    dimension: row.get(0)?,
                    synonym: row.get(1)?,
                    canonical: row.get(2)?,
                    score: row.get(3)?,
                    promoted_by: row.get(4)?,
                    promoted_at: parse_timestamp(5, &promoted_at)?,
                    version: row.get(6)?,
                })
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };
        tx.commit()?;
        Ok((version, mappings))
    }
}

fn read_version(db: &Connection) -> Result<i64> {
    let version: Option<i64> = db
        .query_row("SELECT v FROM canonical_meta WHERE k = 'version'", [], |row| row.get(0))
        .optional()?;
    Ok(version.unwrap_or(1))
}

fn parse_timestamp(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}

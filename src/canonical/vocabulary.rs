//! Dimension vocabulary
//!
//! Distinct raw values of a dimension, read from the analytical store.
//! Used as the candidate pool for suggestions and for exact
//! case-insensitive matches that need no stored mapping.

use crate::error::{NqlError, Result};
use crate::nql::sql::quote_ident;
use crate::semantic::{SemanticModel, SemanticRegistry};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub trait VocabularySource: Send + Sync {
    /// Up to `limit` distinct non-null values of `dimension`.
    fn distinct_values(&self, dimension: &str, limit: usize) -> Result<Vec<String>>;

    /// Stored spelling of `raw` when it exists, compared case-insensitively.
    ///
    /// Not subject to the candidate cap of `distinct_values`.
    fn find_value(&self, dimension: &str, raw: &str) -> Result<Option<String>> {
        let wanted = raw.trim().to_lowercase();
        Ok(self
            .distinct_values(dimension, usize::MAX)?
            .into_iter()
            .find(|v| v.trim().to_lowercase() == wanted))
    }
}

/// Vocabulary read from a SQLite copy of the fact table, opened read-only.
pub struct SqliteVocabulary {
    conn: Mutex<Connection>,
    model: Arc<SemanticModel>,
}

impl SqliteVocabulary {
    pub fn open(path: impl AsRef<Path>, model: Arc<SemanticModel>, timeout: Duration) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            NqlError::unavailable(format!(
                "Failed to open warehouse {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        conn.busy_timeout(timeout)?;
        Ok(Self::from_connection(conn, model))
    }

    /// Wrap an existing connection (the caller is responsible for it being read-only).
    pub fn from_connection(conn: Connection, model: Arc<SemanticModel>) -> Self {
        Self { conn: Mutex::new(conn), model }
    }
}

impl VocabularySource for SqliteVocabulary {
    fn distinct_values(&self, dimension: &str, limit: usize) -> Result<Vec<String>> {
        let Some(dim) = self.model.dimension(dimension) else {
            return Ok(Vec::new());
        };
        let expr = dim.expression();
        let sql = format!(
            "SELECT DISTINCT CAST({expr} AS TEXT) FROM {table} WHERE {expr} IS NOT NULL LIMIT ?1",
            expr = expr,
            table = quote_ident(&self.model.table),
        );
        let conn = self
            .conn
            .lock()
            .map_err(|_| NqlError::unavailable("warehouse connection lock poisoned"))?;
        let mut stmt = conn.prepare(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let values = stmt
            .query_map([limit], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(values)
    }

    fn find_value(&self, dimension: &str, raw: &str) -> Result<Option<String>> {
        let Some(dim) = self.model.dimension(dimension) else {
            return Ok(None);
        };
        let sql = format!(
            "SELECT CAST({expr} AS TEXT) FROM {table} \
             WHERE LOWER(TRIM(CAST({expr} AS TEXT))) = LOWER(TRIM(?1)) LIMIT 1",
            expr = dim.expression(),
            table = quote_ident(&self.model.table),
        );
        let conn = self
            .conn
            .lock()
            .map_err(|_| NqlError::unavailable("warehouse connection lock poisoned"))?;
        Ok(conn.query_row(&sql, [raw], |row| row.get::<_, String>(0)).optional()?)
    }
}

/// Fixed in-memory vocabulary.
#[derive(Debug, Clone, Default)]
pub struct StaticVocabulary {
    values: HashMap<String, Vec<String>>,
}

impl StaticVocabulary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values<I, S>(mut self, dimension: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.values
            .entry(dimension.to_string())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }
}

impl VocabularySource for StaticVocabulary {
    fn distinct_values(&self, dimension: &str, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .values
            .get(dimension)
            .map(|values| values.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

//! SQLite storage layer -- schema, queries, migrations.
//!
//! [`Store`] is the only way the orchestrator touches persistent state. Each
//! method checks out its own pooled connection, so workers running tests in
//! parallel never share a connection; WAL journaling plus `busy_timeout`
//! lets their inserts interleave.

mod catalog;
mod runs;
pub mod schema;
mod schedules;

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::Row;
use thiserror::Error;

pub use self::runs::RunCompletion;
pub use self::schedules::DueCandidate;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> StoreResult<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA busy_timeout = 5000;
                 PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Repository interface over the pooled database.
#[derive(Clone)]
pub struct Store {
    pool: Pool,
}

impl Store {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Open the database at `path`, creating parent directories as needed.
    pub fn open(path: &str) -> StoreResult<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Corrupt(format!("cannot create {}: {}", parent.display(), e)))?;
            }
        }
        Ok(Self::new(open_pool(path)?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn conn(&self) -> StoreResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

/// Canonical timestamp encoding: RFC 3339, UTC, microseconds.
pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

pub(crate) fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

pub(crate) fn enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_error(idx, e))
}

pub(crate) fn opt_enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| s.parse::<T>().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

pub(crate) fn json_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// File-backed store in a temp dir; the dir lives as long as the guard.
    pub fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowtest.db");
        let store = Store::open(path.to_str().unwrap()).unwrap();
        (dir, store)
    }
}

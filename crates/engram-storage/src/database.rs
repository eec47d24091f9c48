// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Async SQLite database handle.
//!
//! Wraps a [`tokio_rusqlite::Connection`], which serializes all access
//! through a single background thread. WAL mode gives readers snapshot
//! isolation from the writer.

use std::path::Path;

use engram_core::EngramError;
use tokio_rusqlite::Connection;
use tracing::debug;

use crate::migrations;

/// Convert a tokio_rusqlite error into [`EngramError::Storage`].
pub fn map_tr_err(e: tokio_rusqlite::Error) -> EngramError {
    EngramError::Storage {
        source: Box::new(e),
    }
}

/// Shared handle to the Engram SQLite database.
///
/// Cloning is cheap; all clones funnel into the same writer thread.
#[derive(Clone, Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database at `path`, apply pragmas, and run
    /// pending migrations.
    pub async fn open(path: &Path, busy_timeout_ms: u64) -> Result<Self, EngramError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(EngramError::storage)?;
        }
        let conn = Connection::open(path).await.map_err(EngramError::storage)?;
        let db = Self { conn };
        db.initialize(busy_timeout_ms).await?;
        debug!(path = %path.display(), "database opened");
        Ok(db)
    }

    /// Open an in-memory database with migrations applied. Used in tests.
    pub async fn open_in_memory() -> Result<Self, EngramError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(EngramError::storage)?;
        let db = Self { conn };
        db.initialize(1000).await?;
        Ok(db)
    }

    async fn initialize(&self, busy_timeout_ms: u64) -> Result<(), EngramError> {
        let pragmas = format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {busy_timeout_ms};"
        );
        self.conn
            .call(move |conn| -> Result<(), rusqlite::Error> {
                conn.execute_batch(&pragmas)?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)?;

        self.conn
            .call(|conn| -> Result<_, rusqlite::Error> {
                Ok(migrations::run_migrations(conn))
            })
            .await
            .map_err(map_tr_err)??;
        Ok(())
    }

    /// The underlying async connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Checkpoint the WAL. Called on shutdown.
    pub async fn checkpoint(&self) -> Result<(), EngramError> {
        self.conn
            .call(|conn| -> Result<(), rusqlite::Error> {
                conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)?;
        debug!("WAL checkpoint complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn open_creates_file_and_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engram.db");
        let db = Database::open(&path, 1000).await.unwrap();

        // All core tables exist after migration.
        let tables: Vec<String> = db
            .connection()
            .call(|conn| -> Result<Vec<String>, rusqlite::Error> {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                )?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(names)
            })
            .await
            .unwrap();

        for expected in [
            "memories",
            "episodes",
            "scratchpads",
            "attachments",
            "turns",
            "extraction_queue",
            "embedding_cache",
            "vector_index",
        ] {
            assert!(
                tables.iter().any(|t| t == expected),
                "missing table {expected}, got {tables:?}"
            );
        }
        assert!(path.exists());
    }

    #[tokio::test]
    async fn open_failure_surfaces_storage_error() {
        let dir = tempdir().unwrap();
        // The target is a directory, so SQLite cannot open it as a file.
        let err = Database::open(dir.path(), 1000).await.unwrap_err();
        assert!(matches!(err, EngramError::Storage { .. }));
    }

    #[tokio::test]
    async fn reopen_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engram.db");
        {
            let db = Database::open(&path, 1000).await.unwrap();
            db.checkpoint().await.unwrap();
        }
        // Second open re-runs the migration runner without error.
        Database::open(&path, 1000).await.unwrap();
    }

    #[tokio::test]
    async fn fts_triggers_track_memory_rows() {
        let db = Database::open_in_memory().await.unwrap();
        db.connection()
            .call(|conn| -> Result<(), rusqlite::Error> {
                conn.execute(
                    "INSERT INTO memories (id, kind, priority, content) VALUES ('m1', 'FACT', 'LONG_TERM', 'user prefers rust')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let hits: i64 = db
            .connection()
            .call(|conn| -> Result<i64, rusqlite::Error> {
                conn.query_row(
                    "SELECT count(*) FROM memories_fts WHERE memories_fts MATCH 'rust'",
                    [],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap();
        assert_eq!(hits, 1);
    }
}

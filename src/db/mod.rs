pub mod models;
pub mod queries;

use std::path::Path;

use rusqlite::Connection;
use thiserror::Error;

/// Backend failures, tagged by the operation class that hit them.
/// A failed batch leaves the store unchanged.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store read failed: {0}")]
    Read(String),
    #[error("store write failed: {0}")]
    Write(String),
    #[error("migration failed: {0}")]
    Migration(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// SQLite-backed index store. Single writer, multiple readers.
pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn =
            Connection::open(path).map_err(|e| StoreError::Migration(e.to_string()))?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Migration(e.to_string()))?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        // WAL keeps readers unblocked while the single writer commits
        self.pragma("journal_mode", "WAL")?;
        self.pragma("synchronous", "NORMAL")?;
        self.pragma("foreign_keys", "ON")?;
        self.migrate()?;
        Ok(())
    }

    fn pragma(&self, name: &str, value: &str) -> Result<()> {
        self.conn
            .pragma_update(None, name, value)
            .map_err(|e| StoreError::Migration(e.to_string()))
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version < 1 {
            self.migrate_v1()?;
        }

        self.conn
            .pragma_update(None, "user_version", 1)
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(())
    }

    /// V1: tracks, fingerprints (signature blob: one byte per bit), hashbins
    fn migrate_v1(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS tracks (
                    id              INTEGER PRIMARY KEY AUTOINCREMENT,
                    album_id        INTEGER,
                    artist          TEXT,
                    title           TEXT,
                    file_path       TEXT NOT NULL,
                    duration_ms     INTEGER NOT NULL DEFAULT 0,
                    tags            TEXT NOT NULL DEFAULT ''
                );

                CREATE TABLE IF NOT EXISTS fingerprints (
                    id              INTEGER PRIMARY KEY AUTOINCREMENT,
                    track_id        INTEGER NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
                    song_order      INTEGER NOT NULL,
                    total_per_track INTEGER NOT NULL,
                    signature       BLOB NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_fingerprints_track ON fingerprints(track_id);

                CREATE TABLE IF NOT EXISTS hashbins (
                    id              INTEGER PRIMARY KEY AUTOINCREMENT,
                    bin             INTEGER NOT NULL,
                    hash_table      INTEGER NOT NULL,
                    track_id        INTEGER NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
                    fingerprint_id  INTEGER NOT NULL REFERENCES fingerprints(id) ON DELETE CASCADE,
                    UNIQUE(fingerprint_id, hash_table)
                );
                CREATE INDEX IF NOT EXISTS idx_hashbins_bin ON hashbins(bin);
                CREATE INDEX IF NOT EXISTS idx_hashbins_fingerprint ON hashbins(fingerprint_id);
                ",
            )
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(())
    }
}

//! SQLite connection setup shared by the cache store and the write queue.

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Open or create the database at `path` and run migrations.
pub fn connect(path: &Path) -> Result<Connection> {
  // Ensure parent directory exists
  if let Some(parent) = path.parent() {
    if !parent.as_os_str().is_empty() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }
  }

  let conn = Connection::open(path)
    .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

  // Cache store and write queue each hold their own connection
  conn
    .busy_timeout(Duration::from_secs(5))
    .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;

  run_migrations(&conn)?;
  Ok(conn)
}

/// Open a private in-memory database (used by tests and dry runs).
pub fn connect_in_memory() -> Result<Connection> {
  let conn =
    Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
  run_migrations(&conn)?;
  Ok(conn)
}

/// Get the default database path
pub fn default_path() -> Result<PathBuf> {
  Ok(data_dir()?.join("worker.db"))
}

/// Directory for the database and log files.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("chitcache"))
}

fn run_migrations(conn: &Connection) -> Result<()> {
  conn
    .execute_batch(SCHEMA)
    .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
  Ok(())
}

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Named caches; rowid order is creation order
CREATE TABLE IF NOT EXISTS caches (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    kind TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, key_hash),
    FOREIGN KEY (cache_name) REFERENCES caches(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_key ON cache_entries(key_hash);

-- Shell generations that finished activation
CREATE TABLE IF NOT EXISTS activations (
    cache_name TEXT PRIMARY KEY,
    activated_at TEXT NOT NULL DEFAULT (datetime('now')),
    FOREIGN KEY (cache_name) REFERENCES caches(name) ON DELETE CASCADE
);

-- Writes attempted while offline, drained in seq order
CREATE TABLE IF NOT EXISTS write_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    operation TEXT NOT NULL,
    method TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

-- At most one drain at a time across every connection to this file
CREATE TABLE IF NOT EXISTS drain_lease (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    holder TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
"#;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_migrations_are_idempotent() {
    let conn = connect_in_memory().unwrap();
    run_migrations(&conn).unwrap();

    let tables: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
         AND name IN ('caches', 'cache_entries', 'activations', 'write_queue', 'drain_lease')",
        [],
        |row| row.get(0),
      )
      .unwrap();
    assert_eq!(tables, 5);
  }
}

//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::traits::{CachedEntry, RequestKey};
use crate::db;
use crate::net::{Response, ResponseKind};

/// Trait for cache storage backends.
///
/// Holds any number of named caches, each mapping request keys to responses.
pub trait CacheStorage: Send + Sync {
  /// Create the named cache if it doesn't exist.
  fn open(&self, cache: &str) -> Result<()>;

  /// Whether the named cache exists.
  fn has(&self, cache: &str) -> Result<bool>;

  /// All cache names, in creation order.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a cache and all of its entries. Returns false if it didn't exist.
  fn delete(&self, cache: &str) -> Result<bool>;

  /// Store (or replace) one entry, creating the cache if needed.
  fn put(&self, cache: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Store all entries, or none of them.
  fn put_all(&self, cache: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

  /// Look up a key in one cache.
  fn match_in(&self, cache: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Look up a key across all caches; the most recently stored entry wins.
  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// URLs stored in the named cache.
  fn entries(&self, cache: &str) -> Result<Vec<String>>;

  /// Record that the named cache finished activation.
  fn mark_activated(&self, cache: &str) -> Result<()>;

  /// Whether the named cache exists and finished activation.
  fn is_activated(&self, cache: &str) -> Result<bool>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache tables in the database at `path`.
  pub fn open_path(path: &Path) -> Result<Self> {
    Ok(Self::from_connection(db::connect(path)?))
  }

  pub fn open_in_memory() -> Result<Self> {
    Ok(Self::from_connection(db::connect_in_memory()?))
  }

  fn from_connection(conn: Connection) -> Self {
    Self {
      conn: Mutex::new(conn),
    }
  }
}

fn insert_cache(conn: &Connection, cache: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO caches (name, created_at) VALUES (?, datetime('now'))",
      params![cache],
    )
    .map_err(|e| eyre!("Failed to create cache {}: {}", cache, e))?;
  Ok(())
}

fn insert_entry(
  conn: &Connection,
  cache: &str,
  key: &RequestKey,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, key_hash, method, url, status, kind, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        cache,
        key.cache_hash(),
        key.method().as_str(),
        key.url().as_str(),
        response.status,
        response.kind.as_str(),
        headers,
        response.body,
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", key.url(), cache, e))?;
  Ok(())
}

type EntryRow = (String, u16, String, String, Vec<u8>, String);

fn row_to_entry(row: EntryRow) -> Result<CachedEntry> {
  let (cache_name, status, kind, headers, body, stored_at) = row;
  let headers: Vec<(String, String)> =
    serde_json::from_str(&headers).map_err(|e| eyre!("Failed to parse cached headers: {}", e))?;

  Ok(CachedEntry {
    response: Response {
      status,
      headers,
      body,
      kind: ResponseKind::parse(&kind),
    },
    cache_name,
    stored_at: parse_datetime(&stored_at)?,
  })
}

impl CacheStorage for SqliteStorage {
  fn open(&self, cache: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    insert_cache(&conn, cache)
  }

  fn has(&self, cache: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let found: Option<i64> = conn
      .query_row("SELECT 1 FROM caches WHERE name = ?", params![cache], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to look up cache {}: {}", cache, e))?;

    Ok(found.is_some())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM caches ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, cache: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    tx.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![cache],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", cache, e))?;
    tx.execute("DELETE FROM activations WHERE cache_name = ?", params![cache])
      .map_err(|e| eyre!("Failed to clear activation of {}: {}", cache, e))?;
    let removed = tx
      .execute("DELETE FROM caches WHERE name = ?", params![cache])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache, e))?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, cache: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    insert_cache(&conn, cache)?;
    insert_entry(&conn, cache, key, response)
  }

  fn put_all(&self, cache: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    insert_cache(&tx, cache)?;
    for (key, response) in entries {
      insert_entry(&tx, cache, key, response)?;
    }
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn match_in(&self, cache: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT cache_name, status, kind, headers, body, stored_at FROM cache_entries
         WHERE cache_name = ? AND key_hash = ?",
        params![cache, key.cache_hash()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache {}: {}", cache, e))?;

    row.map(row_to_entry).transpose()
  }

  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT ce.cache_name, ce.status, ce.kind, ce.headers, ce.body, ce.stored_at
         FROM cache_entries ce
         INNER JOIN caches c ON c.name = ce.cache_name
         WHERE ce.key_hash = ?
         ORDER BY ce.stored_at DESC, ce.rowid DESC
         LIMIT 1",
        params![key.cache_hash()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to query caches: {}", e))?;

    row.map(row_to_entry).transpose()
  }

  fn entries(&self, cache: &str) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT url FROM cache_entries WHERE cache_name = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls = stmt
      .query_map(params![cache], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list entries of {}: {}", cache, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read entry url: {}", e))?;

    Ok(urls)
  }

  fn mark_activated(&self, cache: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO activations (cache_name, activated_at)
         VALUES (?, datetime('now'))",
        params![cache],
      )
      .map_err(|e| eyre!("Failed to record activation of {}: {}", cache, e))?;
    Ok(())
  }

  fn is_activated(&self, cache: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM activations a INNER JOIN caches c ON c.name = a.cache_name
         WHERE a.cache_name = ?",
        params![cache],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up activation of {}: {}", cache, e))?;

    Ok(found.is_some())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

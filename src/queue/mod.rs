//! Durable queue of writes made while offline, replayed on background sync.
//!
//! Writes are drained oldest first. An item leaves the queue only after the
//! server accepted it; anything else stays put for the next sync signal.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::db;
use crate::net::{Fetcher, Method, Request, Response};

static WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);
static LEASE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// How long a drain lease stays valid without renewal.
const LEASE_TTL_SECS: i64 = 300;

/// A write the page wanted to send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedWrite {
  pub id: String,
  /// What the write does, e.g. "payment" or "contribution"
  pub operation: String,
  #[serde(default = "default_method")]
  pub method: String,
  /// Path (or absolute URL) the write is sent to
  pub endpoint: String,
  pub payload: serde_json::Value,
  pub created_at: DateTime<Utc>,
  /// Failed replays so far
  #[serde(default)]
  pub attempts: u32,
  #[serde(default)]
  pub last_error: Option<String>,
}

fn default_method() -> String {
  "POST".to_string()
}

impl QueuedWrite {
  pub fn new(
    operation: impl Into<String>,
    endpoint: impl Into<String>,
    payload: serde_json::Value,
  ) -> Self {
    let operation = operation.into();
    let endpoint = endpoint.into();
    let created_at = Utc::now();

    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    hasher.update(endpoint.as_bytes());
    hasher.update(payload.to_string().as_bytes());
    hasher.update(
      created_at
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .to_le_bytes(),
    );
    hasher.update(WRITE_COUNTER.fetch_add(1, Ordering::SeqCst).to_le_bytes());
    let id = format!("w-{}", &hex::encode(hasher.finalize())[..16]);

    Self {
      id,
      operation,
      method: default_method(),
      endpoint,
      payload,
      created_at,
      attempts: 0,
      last_error: None,
    }
  }

  /// The request this write makes, online or on replay.
  pub fn to_request(&self, config: &WorkerConfig) -> Result<Request> {
    let method = Method::from_bytes(self.method.as_bytes())
      .map_err(|e| eyre!("Invalid method '{}' on write {}: {}", self.method, self.id, e))?;
    let url = config.resolve(&self.endpoint)?;

    Request::new(method, url)
      .with_header("x-offline-write-id", &self.id)
      .with_json(&self.payload)
  }
}

/// Why a replay didn't go through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum ReplayFailure {
  /// The request never got an answer
  Network(String),
  /// The server answered with a non-2xx status
  Rejected(u16),
  /// The write couldn't be turned into a request
  Invalid(String),
}

impl std::fmt::Display for ReplayFailure {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Network(e) => write!(f, "network: {}", e),
      Self::Rejected(status) => write!(f, "rejected with HTTP {}", status),
      Self::Invalid(e) => write!(f, "invalid write: {}", e),
    }
  }
}

#[derive(Debug, Clone)]
pub enum ReplayOutcome {
  Delivered(Response),
  Failed(ReplayFailure),
}

/// Send one write over the network. Used for live submissions and drains alike.
pub async fn replay<F: Fetcher>(
  fetcher: &F,
  write: &QueuedWrite,
  config: &WorkerConfig,
) -> ReplayOutcome {
  let request = match write.to_request(config) {
    Ok(request) => request,
    Err(e) => return ReplayOutcome::Failed(ReplayFailure::Invalid(e.to_string())),
  };

  match fetcher.fetch(&request).await {
    Ok(response) if response.is_ok() => ReplayOutcome::Delivered(response),
    Ok(response) => ReplayOutcome::Failed(ReplayFailure::Rejected(response.status)),
    Err(e) => ReplayOutcome::Failed(ReplayFailure::Network(e.to_string())),
  }
}

/// Result of one drain pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainReport {
  pub delivered: Vec<String>,
  pub failed: Vec<(String, ReplayFailure)>,
  /// Another drain was already in flight; nothing was sent
  pub skipped: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
  pub pending: usize,
  pub oldest: Option<DateTime<Utc>>,
}

/// SQLite-backed write queue.
///
/// Drains are exclusive per database file, not per handle: a drain holds a
/// lease row that other connections (and other processes) respect.
pub struct SqliteQueue {
  conn: Mutex<Connection>,
}

/// Releases the drain lease when a drain ends, however it ends.
struct DrainGuard<'a> {
  queue: &'a SqliteQueue,
  holder: String,
}

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    if let Err(e) = self.queue.release_lease(&self.holder) {
      warn!(holder = %self.holder, error = %e, "failed to release drain lease");
    }
  }
}

impl SqliteQueue {
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

  /// Append a write. Fails if a write with the same id is already queued.
  pub fn enqueue(&self, write: &QueuedWrite) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let payload = serde_json::to_string(&write.payload)
      .map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    conn
      .execute(
        "INSERT INTO write_queue
           (id, operation, method, endpoint, payload, created_at, attempts, last_error)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          write.id,
          write.operation,
          write.method,
          write.endpoint,
          payload,
          write.created_at.to_rfc3339(),
          write.attempts,
          write.last_error,
        ],
      )
      .map_err(|e| eyre!("Failed to queue write {}: {}", write.id, e))?;

    debug!(id = %write.id, operation = %write.operation, "write queued");
    Ok(())
  }

  /// All queued writes, oldest first.
  pub fn pending(&self) -> Result<Vec<QueuedWrite>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT id, operation, method, endpoint, payload, created_at, attempts, last_error
         FROM write_queue ORDER BY seq",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    type Row = (
      String,
      String,
      String,
      String,
      String,
      String,
      u32,
      Option<String>,
    );
    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
          row.get(6)?,
          row.get(7)?,
        ))
      })
      .map_err(|e| eyre!("Failed to read queue: {}", e))?
      .collect::<rusqlite::Result<Vec<Row>>>()
      .map_err(|e| eyre!("Failed to read queued write: {}", e))?;

    rows
      .into_iter()
      .map(
        |(id, operation, method, endpoint, payload, created_at, attempts, last_error)| {
          let payload = serde_json::from_str(&payload)
            .map_err(|e| eyre!("Failed to parse payload of {}: {}", id, e))?;
          let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| eyre!("Failed to parse created_at of {}: {}", id, e))?
            .with_timezone(&Utc);
          Ok(QueuedWrite {
            id,
            operation,
            method,
            endpoint,
            payload,
            created_at,
            attempts,
            last_error,
          })
        },
      )
      .collect()
  }

  pub fn len(&self) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM write_queue", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queue: {}", e))?;

    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  pub fn status(&self) -> Result<QueueStatus> {
    let pending = self.pending()?;
    Ok(QueueStatus {
      pending: pending.len(),
      oldest: pending.first().map(|w| w.created_at),
    })
  }

  /// Remove a write. Returns false if it wasn't queued.
  pub fn remove(&self, id: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let removed = conn
      .execute("DELETE FROM write_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove write {}: {}", id, e))?;

    Ok(removed > 0)
  }

  fn record_failure(&self, id: &str, failure: &ReplayFailure) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "UPDATE write_queue SET attempts = attempts + 1, last_error = ? WHERE id = ?",
        params![failure.to_string(), id],
      )
      .map_err(|e| eyre!("Failed to update write {}: {}", id, e))?;

    Ok(())
  }

  /// Take the drain lease unless a live lease is held elsewhere. An expired
  /// lease (its drain died) is taken over.
  fn acquire_lease(&self, holder: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction_with_behavior(TransactionBehavior::Immediate)
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let now = Utc::now();
    let expires_at: Option<String> = tx
      .query_row("SELECT expires_at FROM drain_lease WHERE id = 1", [], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to read drain lease: {}", e))?;

    let live = expires_at
      .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
      .is_some_and(|t| t.with_timezone(&Utc) > now);
    if live {
      return Ok(false);
    }

    tx.execute(
      "INSERT OR REPLACE INTO drain_lease (id, holder, expires_at) VALUES (1, ?, ?)",
      params![holder, lease_expiry(now)],
    )
    .map_err(|e| eyre!("Failed to take drain lease: {}", e))?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(true)
  }

  /// Push the lease expiry forward. False if `holder` no longer holds it.
  fn renew_lease(&self, holder: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let renewed = conn
      .execute(
        "UPDATE drain_lease SET expires_at = ? WHERE id = 1 AND holder = ?",
        params![lease_expiry(Utc::now()), holder],
      )
      .map_err(|e| eyre!("Failed to renew drain lease: {}", e))?;

    Ok(renewed > 0)
  }

  fn release_lease(&self, holder: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM drain_lease WHERE id = 1 AND holder = ?",
        params![holder],
      )
      .map_err(|e| eyre!("Failed to release drain lease: {}", e))?;
    Ok(())
  }

  /// Replay every queued write, oldest first.
  ///
  /// Each item stands alone: a failure is recorded and the pass moves on.
  /// Returns immediately (with `skipped` set) if another drain is in flight.
  pub async fn drain<F: Fetcher>(&self, fetcher: &F, config: &WorkerConfig) -> Result<DrainReport> {
    let holder = format!(
      "{}-{}",
      std::process::id(),
      LEASE_COUNTER.fetch_add(1, Ordering::SeqCst)
    );
    if !self.acquire_lease(&holder)? {
      debug!("drain already in flight");
      return Ok(DrainReport {
        skipped: true,
        ..Default::default()
      });
    }
    let _guard = DrainGuard {
      queue: self,
      holder: holder.clone(),
    };

    let writes = self.pending()?;
    let mut report = DrainReport::default();

    for write in writes {
      match self.renew_lease(&holder) {
        Ok(true) => {}
        Ok(false) => {
          warn!(%holder, "drain lease lost, leaving the rest for the next sync");
          break;
        }
        Err(e) => {
          warn!(%holder, error = %e, "failed to renew drain lease");
          break;
        }
      }

      match replay(fetcher, &write, config).await {
        ReplayOutcome::Delivered(_) => {
          if let Err(e) = self.remove(&write.id) {
            warn!(id = %write.id, error = %e, "delivered write could not be removed");
          }
          report.delivered.push(write.id);
        }
        ReplayOutcome::Failed(failure) => {
          warn!(id = %write.id, %failure, "replay failed, keeping write");
          if let Err(e) = self.record_failure(&write.id, &failure) {
            warn!(id = %write.id, error = %e, "failed to record replay failure");
          }
          report.failed.push((write.id, failure));
        }
      }
    }

    info!(
      delivered = report.delivered.len(),
      failed = report.failed.len(),
      "drain finished"
    );
    Ok(report)
  }
}

fn lease_expiry(now: DateTime<Utc>) -> String {
  (now + chrono::Duration::seconds(LEASE_TTL_SECS)).to_rfc3339()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::MockFetcher;
  use serde_json::json;
  use std::sync::Arc;
  use std::time::Duration;

  fn payment(amount: u32) -> QueuedWrite {
    QueuedWrite::new(
      "payment",
      "/api/payments",
      json!({ "memberId": "m-1", "amount": amount }),
    )
  }

  #[test]
  fn test_ids_are_unique() {
    let a = payment(100);
    let b = payment(100);
    assert_ne!(a.id, b.id);
    assert!(a.id.starts_with("w-"));
  }

  #[test]
  fn test_enqueue_preserves_fifo() {
    let queue = SqliteQueue::open_in_memory().unwrap();
    let writes = [payment(1), payment(2), payment(3)];
    for w in &writes {
      queue.enqueue(w).unwrap();
    }

    let pending = queue.pending().unwrap();
    assert_eq!(pending, writes.to_vec());
    assert_eq!(queue.len().unwrap(), 3);
  }

  #[test]
  fn test_duplicate_id_rejected() {
    let queue = SqliteQueue::open_in_memory().unwrap();
    let w = payment(1);
    queue.enqueue(&w).unwrap();
    assert!(queue.enqueue(&w).is_err());
    assert_eq!(queue.len().unwrap(), 1);
  }

  #[test]
  fn test_request_carries_json_payload() {
    let w = payment(500);
    let request = w.to_request(&WorkerConfig::default()).unwrap();
    assert_eq!(request.method, Method::POST);
    assert_eq!(request.url.as_str(), "http://localhost:3000/api/payments");
    let body: serde_json::Value = serde_json::from_slice(request.body.as_ref().unwrap()).unwrap();
    assert_eq!(body["amount"], 500);
  }

  #[tokio::test]
  async fn test_drain_keeps_failed_item_in_place() {
    let queue = SqliteQueue::open_in_memory().unwrap();
    let (w1, w2, w3) = (payment(1), payment(2), payment(3));
    for w in [&w1, &w2, &w3] {
      queue.enqueue(w).unwrap();
    }

    let fetcher = MockFetcher::new()
      .then_respond(Response::new(201, "{}"))
      .then_fail()
      .then_respond(Response::new(201, "{}"));

    let report = queue.drain(&fetcher, &WorkerConfig::default()).await.unwrap();
    assert_eq!(report.delivered, vec![w1.id.clone(), w3.id.clone()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, w2.id);

    let remaining = queue.pending().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, w2.id);
    assert_eq!(remaining[0].attempts, 1);
    assert!(remaining[0].last_error.is_some());
  }

  #[tokio::test]
  async fn test_drain_sends_in_creation_order() {
    let queue = SqliteQueue::open_in_memory().unwrap();
    let writes = [payment(1), payment(2), payment(3)];
    for w in &writes {
      queue.enqueue(w).unwrap();
    }

    let fetcher = MockFetcher::new()
      .then_respond(Response::new(200, ""))
      .then_respond(Response::new(200, ""))
      .then_respond(Response::new(200, ""));
    queue.drain(&fetcher, &WorkerConfig::default()).await.unwrap();

    let sent: Vec<String> = fetcher
      .requests()
      .iter()
      .filter_map(|r| {
        r.headers
          .iter()
          .find(|(k, _)| k == "x-offline-write-id")
          .map(|(_, v)| v.clone())
      })
      .collect();
    let expected: Vec<String> = writes.iter().map(|w| w.id.clone()).collect();
    assert_eq!(sent, expected);
    assert!(queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_rejected_write_is_retained() {
    let queue = SqliteQueue::open_in_memory().unwrap();
    let w = payment(1);
    queue.enqueue(&w).unwrap();

    let fetcher = MockFetcher::new().then_respond(Response::new(500, "boom"));
    let report = queue.drain(&fetcher, &WorkerConfig::default()).await.unwrap();

    assert_eq!(report.failed, vec![(w.id.clone(), ReplayFailure::Rejected(500))]);
    assert_eq!(queue.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_overlapping_drain_is_skipped() {
    let queue = Arc::new(SqliteQueue::open_in_memory().unwrap());
    queue.enqueue(&payment(1)).unwrap();

    let fetcher = MockFetcher::new()
      .then_respond(Response::new(200, ""))
      .with_delay(Duration::from_millis(100));

    let first = {
      let queue = Arc::clone(&queue);
      let fetcher = fetcher.clone();
      tokio::spawn(async move { queue.drain(&fetcher, &WorkerConfig::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = queue.drain(&fetcher, &WorkerConfig::default()).await.unwrap();
    assert!(second.skipped);

    let first = first.await.unwrap().unwrap();
    assert!(!first.skipped);
    assert_eq!(first.delivered.len(), 1);
    assert_eq!(fetcher.calls(), 1);

    // Guard released: a later drain runs again
    let third = queue.drain(&fetcher, &WorkerConfig::default()).await.unwrap();
    assert!(!third.skipped);
  }

  fn temp_db(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
      "chitcache-{}-{}-{}.db",
      name,
      std::process::id(),
      Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ))
  }

  #[tokio::test]
  async fn test_drain_is_exclusive_across_connections() {
    let path = temp_db("lease");
    let first = SqliteQueue::open_path(&path).unwrap();
    let second = SqliteQueue::open_path(&path).unwrap();
    first.enqueue(&payment(7)).unwrap();

    let fetcher = MockFetcher::new()
      .then_respond(Response::new(200, ""))
      .with_delay(Duration::from_millis(100));
    let config = WorkerConfig::default();

    let (a, b) = tokio::join!(first.drain(&fetcher, &config), second.drain(&fetcher, &config));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(fetcher.calls(), 1);
    assert_ne!(a.skipped, b.skipped);
    assert_eq!(a.delivered.len() + b.delivered.len(), 1);
    assert!(second.is_empty().unwrap());

    // Lease released on both handles
    assert!(!second.drain(&fetcher, &config).await.unwrap().skipped);
    assert!(!first.drain(&fetcher, &config).await.unwrap().skipped);

    drop((first, second));
    let _ = std::fs::remove_file(&path);
  }

  #[tokio::test]
  async fn test_expired_lease_is_taken_over() {
    let queue = SqliteQueue::open_in_memory().unwrap();
    queue.enqueue(&payment(3)).unwrap();
    queue
      .conn
      .lock()
      .unwrap()
      .execute(
        "INSERT INTO drain_lease (id, holder, expires_at) VALUES (1, 'crashed', ?)",
        params![(Utc::now() - chrono::Duration::seconds(1)).to_rfc3339()],
      )
      .unwrap();

    let fetcher = MockFetcher::new().then_respond(Response::new(200, ""));
    let report = queue.drain(&fetcher, &WorkerConfig::default()).await.unwrap();
    assert!(!report.skipped);
    assert_eq!(report.delivered.len(), 1);
  }

  #[tokio::test]
  async fn test_live_lease_held_elsewhere_skips_drain() {
    let queue = SqliteQueue::open_in_memory().unwrap();
    queue.enqueue(&payment(3)).unwrap();
    assert!(queue.acquire_lease("other-process").unwrap());

    let fetcher = MockFetcher::new().then_respond(Response::new(200, ""));
    let report = queue.drain(&fetcher, &WorkerConfig::default()).await.unwrap();
    assert!(report.skipped);
    assert_eq!(fetcher.calls(), 0);
    assert_eq!(queue.len().unwrap(), 1);
  }

  #[test]
  fn test_queue_survives_reopen() {
    let path = std::env::temp_dir().join(format!(
      "chitcache-queue-{}-{}.db",
      std::process::id(),
      Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    let w = payment(42);

    {
      let queue = SqliteQueue::open_path(&path).unwrap();
      queue.enqueue(&w).unwrap();
    }

    let queue = SqliteQueue::open_path(&path).unwrap();
    assert_eq!(queue.pending().unwrap(), vec![w]);

    let _ = std::fs::remove_file(&path);
  }
}

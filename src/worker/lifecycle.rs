//! Worker versioning: install seeds the shell cache, activate evicts old
//! generations and takes over open views.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use super::Host;
use crate::cache::{CacheStorage, RequestKey};
use crate::config::WorkerConfig;
use crate::net::{Fetcher, Request};

/// Worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
  /// Started, not yet installed
  Parsed,
  Installing,
  /// Installed, waiting for the previous version to let go
  Waiting,
  Activating,
  /// Controls views and intercepts fetches
  Active,
  /// Install failed; this version never becomes active
  Redundant,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ActivationReport {
  /// Cache generations deleted during cleanup
  pub evicted: Vec<String>,
  /// Cleanup hit an error; stale generations may remain until next activation
  pub cleanup_incomplete: bool,
  pub claimed: bool,
}

pub struct Lifecycle<S: CacheStorage> {
  storage: Arc<S>,
  config: WorkerConfig,
  state: Mutex<WorkerState>,
  skip_waiting: AtomicBool,
}

impl<S: CacheStorage> Lifecycle<S> {
  /// Pick up where a previous process left off. An activated shell generation
  /// resumes as active; one that was installed but never activated resumes as
  /// waiting, so activation still evicts and claims.
  pub fn resume(storage: Arc<S>, config: WorkerConfig) -> Result<Self> {
    let shell = config.shell_cache();
    let state = if storage.is_activated(&shell)? {
      WorkerState::Active
    } else if storage.has(&shell)? {
      WorkerState::Waiting
    } else {
      WorkerState::Parsed
    };

    Ok(Self {
      storage,
      config,
      state: Mutex::new(state),
      skip_waiting: AtomicBool::new(state == WorkerState::Waiting),
    })
  }

  pub fn state(&self) -> WorkerState {
    self
      .state
      .lock()
      .map(|s| *s)
      .unwrap_or(WorkerState::Redundant)
  }

  fn set_state(&self, next: WorkerState) -> Result<()> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    info!(from = ?*state, to = ?next, "worker state");
    *state = next;
    Ok(())
  }

  /// Move to `next` only if the current state is one of `from`.
  fn transition(&self, from: &[WorkerState], next: WorkerState) -> Result<()> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if !from.contains(&*state) {
      return Err(eyre!("Cannot move worker from {:?} to {:?}", *state, next));
    }
    info!(from = ?*state, to = ?next, "worker state");
    *state = next;
    Ok(())
  }

  /// Install succeeded and asked to activate without waiting.
  pub fn should_skip_waiting(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  /// Fetch every manifest URL and store them all in the shell generation.
  ///
  /// All-or-nothing: if any URL fails or answers non-2xx, nothing is written
  /// and the worker becomes redundant.
  pub async fn install<F: Fetcher>(&self, fetcher: &F) -> Result<()> {
    match self.state() {
      WorkerState::Active => {
        self.skip_waiting.store(false, Ordering::SeqCst);
        info!(cache = %self.config.shell_cache(), "release already active, nothing to install");
        return Ok(());
      }
      WorkerState::Waiting => {
        self.skip_waiting.store(true, Ordering::SeqCst);
        info!(cache = %self.config.shell_cache(), "release already installed, awaiting activation");
        return Ok(());
      }
      _ => self.skip_waiting.store(false, Ordering::SeqCst),
    }
    self.transition(
      &[WorkerState::Parsed, WorkerState::Redundant],
      WorkerState::Installing,
    )?;

    match self.populate_shell(fetcher).await {
      Ok(count) => {
        info!(cache = %self.config.shell_cache(), entries = count, "shell cache populated");
        self.skip_waiting.store(true, Ordering::SeqCst);
        self.set_state(WorkerState::Waiting)
      }
      Err(e) => {
        self.set_state(WorkerState::Redundant)?;
        Err(e.wrap_err(format!("Install of {} failed", self.config.shell_cache())))
      }
    }
  }

  async fn populate_shell<F: Fetcher>(&self, fetcher: &F) -> Result<usize> {
    let requests = self
      .config
      .manifest
      .iter()
      .map(|path| self.config.resolve(path).map(Request::get))
      .collect::<Result<Vec<_>>>()?;

    let responses = join_all(requests.iter().map(|r| fetcher.fetch(r))).await;

    let mut entries = Vec::with_capacity(requests.len());
    for (request, response) in requests.iter().zip(responses) {
      let response = response.map_err(|e| e.wrap_err(format!("Failed to fetch {}", request.url)))?;
      if !response.is_ok() {
        return Err(eyre!(
          "Manifest entry {} answered HTTP {}",
          request.url,
          response.status
        ));
      }
      entries.push((RequestKey::get(&request.url), response));
    }

    self.storage.put_all(&self.config.shell_cache(), &entries)?;
    Ok(entries.len())
  }

  /// Delete every cache that is neither this shell generation nor the runtime
  /// cache, then claim open views. Cleanup is best-effort; claiming always runs
  /// after it completes.
  pub async fn activate<H: Host>(&self, host: &H) -> Result<ActivationReport> {
    self.transition(&[WorkerState::Waiting], WorkerState::Activating)?;

    let mut report = self.evict_stale();

    // Unrecorded activation is repeated on the next start
    if let Err(e) = self.storage.mark_activated(&self.config.shell_cache()) {
      warn!(cache = %self.config.shell_cache(), error = %e, "failed to record activation");
    }

    match host.claim().await {
      Ok(()) => report.claimed = true,
      Err(e) => warn!(error = %e, "failed to claim clients"),
    }

    self.set_state(WorkerState::Active)?;
    Ok(report)
  }

  fn evict_stale(&self) -> ActivationReport {
    let mut report = ActivationReport::default();
    let keep = [self.config.shell_cache(), self.config.runtime_cache.clone()];

    let names = match self.storage.keys() {
      Ok(names) => names,
      Err(e) => {
        warn!(error = %e, "cache cleanup skipped: could not list caches");
        report.cleanup_incomplete = true;
        return report;
      }
    };

    for name in names.into_iter().filter(|n| !keep.contains(n)) {
      match self.storage.delete(&name) {
        Ok(_) => {
          info!(cache = %name, "evicted stale cache");
          report.evicted.push(name);
        }
        Err(e) => {
          warn!(cache = %name, error = %e, "failed to evict cache");
          report.cleanup_incomplete = true;
        }
      }
    }

    report
  }
}

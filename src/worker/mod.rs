//! The offline worker: routes intercepted requests to fetch strategies,
//! manages install/activate, and forwards writes to the offline queue.

mod event;
pub mod lifecycle;
pub mod push;
pub mod route;

use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheStorage, RequestKey, Served};
use crate::config::{Config, PushConfig, WorkerConfig};
use crate::net::{Destination, Fetcher, Request, Response};
use crate::queue::{self, DrainReport, QueuedWrite, ReplayFailure, ReplayOutcome, SqliteQueue};

pub use event::{Event, EventOutcome, EventRecord};
pub use lifecycle::{ActivationReport, Lifecycle, WorkerState};
pub use push::{ClickAction, Notification};
pub use route::{classify, RouteClass};

/// What the worker needs from the environment hosting it.
pub trait Host: Send + Sync {
  /// Take control of all open views without a reload.
  fn claim(&self) -> impl Future<Output = Result<()>> + Send;

  fn open_window(&self, url: &Url) -> impl Future<Output = Result<()>> + Send;

  fn show_notification(&self, notification: &Notification)
    -> impl Future<Output = Result<()>> + Send;
}

/// Result of handling an intercepted request.
#[derive(Debug, Clone)]
pub enum Handled {
  /// Not intercepted; the request goes to the network untouched
  Passthrough,
  Served(Served),
  /// Every fallback missed; the page sees a failed load
  Failed(String),
}

impl Handled {
  pub fn summary(&self) -> Value {
    match self {
      Self::Passthrough => json!({ "passthrough": true }),
      Self::Served(served) => json!({
        "status": served.response.status,
        "source": format!("{:?}", served.source).to_lowercase(),
        "bytes": served.response.body.len(),
        "cached_at": served.cached_at,
      }),
      Self::Failed(reason) => json!({ "failed": reason }),
    }
  }
}

/// Result of a write submitted by the page.
#[derive(Debug, Clone)]
pub enum Submission {
  Delivered(Response),
  /// Stored for background sync ("pending sync" in the UI)
  Queued(String),
  /// Server refused it while online
  Rejected(u16),
}

impl Submission {
  pub fn summary(&self) -> Value {
    match self {
      Self::Delivered(response) => json!({ "delivered": response.status }),
      Self::Queued(id) => json!({ "queued": id }),
      Self::Rejected(status) => json!({ "rejected": status }),
    }
  }
}

/// Substitute responses, resolved once at startup.
struct Fallbacks {
  root: RequestKey,
  offline_document: RequestKey,
  icon: RequestKey,
}

pub struct Worker<S: CacheStorage, F: Fetcher, H: Host> {
  config: WorkerConfig,
  push: PushConfig,
  cache: CacheLayer<S>,
  lifecycle: Lifecycle<S>,
  queue: Arc<SqliteQueue>,
  fetcher: F,
  host: H,
  online: AtomicBool,
  fallbacks: Fallbacks,
}

impl<S: CacheStorage, F: Fetcher, H: Host> Worker<S, F, H> {
  pub fn start(
    config: &Config,
    storage: Arc<S>,
    queue: Arc<SqliteQueue>,
    fetcher: F,
    host: H,
  ) -> Result<Self> {
    let worker = config.worker.clone();
    let fallbacks = Fallbacks {
      root: RequestKey::get(&worker.resolve("/")?),
      offline_document: RequestKey::get(&worker.resolve(&worker.offline_document)?),
      icon: RequestKey::get(&worker.resolve(&worker.fallback_icon)?),
    };

    let lifecycle = Lifecycle::resume(Arc::clone(&storage), worker.clone())?;
    info!(
      shell = %worker.shell_cache(),
      state = ?lifecycle.state(),
      "worker started"
    );

    Ok(Self {
      cache: CacheLayer::new(storage, worker.runtime_cache.clone()),
      lifecycle,
      config: worker,
      push: config.push.clone(),
      queue,
      fetcher,
      host,
      online: AtomicBool::new(true),
      fallbacks,
    })
  }

  pub fn config(&self) -> &WorkerConfig {
    &self.config
  }

  pub fn state(&self) -> WorkerState {
    self.lifecycle.state()
  }

  pub fn storage(&self) -> &Arc<S> {
    self.cache.storage()
  }

  pub fn queue(&self) -> &Arc<SqliteQueue> {
    &self.queue
  }

  /// Connectivity hint from the host. While offline, writes go straight to the queue.
  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  pub async fn install(&self) -> Result<()> {
    self.lifecycle.install(&self.fetcher).await
  }

  /// Install, then activate right away if install asked to skip waiting.
  pub async fn update(&self) -> Result<Option<ActivationReport>> {
    self.install().await?;
    if self.lifecycle.should_skip_waiting() {
      return self.activate().await.map(Some);
    }
    Ok(None)
  }

  pub async fn activate(&self) -> Result<ActivationReport> {
    self.lifecycle.activate(&self.host).await
  }

  /// Route an intercepted request. Never errors: failures come back as
  /// `Handled::Failed`.
  pub async fn handle_fetch(&self, request: &Request) -> Handled {
    if self.lifecycle.state() != WorkerState::Active {
      return Handled::Passthrough;
    }

    let class = classify(request, &self.config.api_prefix);
    debug!(method = %request.method, url = %request.url, ?class, "fetch");

    let result = match class {
      RouteClass::Ignored => return Handled::Passthrough,
      RouteClass::Api => self.cache.network_first(&self.fetcher, request).await,
      RouteClass::Navigation => {
        let fallbacks = [
          self.fallbacks.root.clone(),
          self.fallbacks.offline_document.clone(),
        ];
        self
          .cache
          .network_first_with_fallback(&self.fetcher, request, &fallbacks)
          .await
      }
      RouteClass::Static => {
        let fallback = (request.destination == Destination::Image).then_some(&self.fallbacks.icon);
        self.cache.cache_first(&self.fetcher, request, fallback).await
      }
    };

    match result {
      Ok(served) => Handled::Served(served),
      Err(e) => {
        debug!(url = %request.url, error = %e, "no response available");
        Handled::Failed(format!("{:#}", e))
      }
    }
  }

  /// Handle a request end to end: anything the worker doesn't intercept is
  /// sent to the network as-is.
  pub async fn respond(&self, request: &Request) -> Handled {
    match self.handle_fetch(request).await {
      Handled::Passthrough => match self.fetcher.fetch(request).await {
        Ok(response) => Handled::Served(Served::from_network(response)),
        Err(e) => Handled::Failed(format!("{:#}", e)),
      },
      handled => handled,
    }
  }

  /// Send a write, or queue it if the network isn't there.
  pub async fn submit(&self, write: QueuedWrite) -> Result<Submission> {
    if !self.is_online() {
      self.queue.enqueue(&write)?;
      info!(id = %write.id, "offline, write queued");
      return Ok(Submission::Queued(write.id));
    }

    match queue::replay(&self.fetcher, &write, &self.config).await {
      ReplayOutcome::Delivered(response) => Ok(Submission::Delivered(response)),
      ReplayOutcome::Failed(ReplayFailure::Network(reason)) => {
        self.queue.enqueue(&write)?;
        info!(id = %write.id, %reason, "network failed, write queued");
        Ok(Submission::Queued(write.id))
      }
      ReplayOutcome::Failed(ReplayFailure::Rejected(status)) => Ok(Submission::Rejected(status)),
      ReplayOutcome::Failed(ReplayFailure::Invalid(reason)) => {
        Err(eyre!("Write {} is invalid: {}", write.id, reason))
      }
    }
  }

  /// Background sync. Returns None for tags this worker doesn't own.
  pub async fn sync(&self, tag: &str) -> Option<Result<DrainReport>> {
    if tag != self.config.sync_tag {
      debug!(%tag, "ignoring sync tag");
      return None;
    }
    Some(self.queue.drain(&self.fetcher, &self.config).await)
  }

  pub async fn push(&self, data: Option<&str>) -> Result<Notification> {
    let notification = push::build_notification(&self.push, data);
    self.host.show_notification(&notification).await?;
    Ok(notification)
  }

  pub async fn notification_click(&self, action: Option<&str>) -> Result<ClickAction> {
    let click = push::click_action(&self.push, action);
    if let ClickAction::Open(path) = &click {
      let url = self.config.resolve(path)?;
      self.host.open_window(&url).await?;
    }
    Ok(click)
  }

  /// Route one event to its handler.
  pub async fn dispatch(&self, event: Event) -> EventOutcome {
    match event {
      Event::Install => match self.install().await {
        Ok(()) => EventOutcome::Installed {
          skip_waiting: self.lifecycle.should_skip_waiting(),
        },
        Err(e) => failed("install", e),
      },
      Event::Activate => match self.activate().await {
        Ok(report) => EventOutcome::Activated(report),
        Err(e) => failed("activate", e),
      },
      Event::Fetch(request) => EventOutcome::Fetched(self.respond(&request).await),
      Event::Sync { tag } => match self.sync(&tag).await {
        Some(Ok(report)) => EventOutcome::Synced(report),
        Some(Err(e)) => {
          // Left for the next sync signal
          warn!(error = %e, "drain failed");
          failed("sync", e)
        }
        None => EventOutcome::SyncIgnored(tag),
      },
      Event::Push { data } => match self.push(data.as_deref()).await {
        Ok(notification) => EventOutcome::Notified(notification),
        Err(e) => failed("push", e),
      },
      Event::NotificationClick { action } => match self.notification_click(action.as_deref()).await
      {
        Ok(click) => EventOutcome::Clicked(click),
        Err(e) => failed("notification_click", e),
      },
      Event::Submit(write) => match self.submit(write).await {
        Ok(submission) => EventOutcome::Submitted(submission),
        Err(e) => failed("submit", e),
      },
    }
  }
}

fn failed(event: &'static str, e: color_eyre::Report) -> EventOutcome {
  EventOutcome::Failed {
    event,
    reason: format!("{:#}", e),
  }
}

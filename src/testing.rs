//! Test doubles: scripted network, flaky storage, recording host.

use color_eyre::{eyre::eyre, Result};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::cache::{CacheStorage, CachedEntry, RequestKey};
use crate::net::{Fetcher, Request, Response};
use crate::worker::push::Notification;
use crate::worker::Host;

#[derive(Default)]
struct Script {
  /// Outcomes consumed in call order before the URL table is consulted
  queued: VecDeque<Option<Response>>,
  by_url: HashMap<String, Response>,
  log: Vec<Request>,
}

/// Fetcher that answers from a script. Unscripted URLs fail like a dropped
/// connection.
#[derive(Clone, Default)]
pub struct MockFetcher {
  script: Arc<Mutex<Script>>,
  offline: Arc<AtomicBool>,
  delay: Option<Duration>,
}

impl MockFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(self, url: Url, response: Response) -> Self {
    self
      .script
      .lock()
      .unwrap()
      .by_url
      .insert(url.to_string(), response);
    self
  }

  /// Next call returns `response` regardless of URL.
  pub fn then_respond(self, response: Response) -> Self {
    self.script.lock().unwrap().queued.push_back(Some(response));
    self
  }

  /// Next call fails regardless of URL.
  pub fn then_fail(self) -> Self {
    self.script.lock().unwrap().queued.push_back(None);
    self
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  /// While offline every call fails, scripted or not.
  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.script.lock().unwrap().log.len()
  }

  pub fn requests(&self) -> Vec<Request> {
    self.script.lock().unwrap().log.clone()
  }
}

impl Fetcher for MockFetcher {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
    let outcome = {
      let mut script = self.script.lock().unwrap();
      script.log.push(request.clone());
      if self.offline.load(Ordering::SeqCst) {
        None
      } else {
        match script.queued.pop_front() {
          Some(outcome) => outcome,
          None => script.by_url.get(request.url.as_str()).cloned(),
        }
      }
    };
    let url = request.url.clone();
    let delay = self.delay;

    async move {
      if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
      }
      outcome.ok_or_else(|| eyre!("network unreachable: {}", url))
    }
  }
}

/// Storage wrapper whose writes or listing can be switched to fail.
pub struct FlakyStorage<S> {
  inner: S,
  fail_writes: AtomicBool,
  fail_listing: AtomicBool,
}

impl<S: CacheStorage> FlakyStorage<S> {
  pub fn new(inner: S) -> Self {
    Self {
      inner,
      fail_writes: AtomicBool::new(false),
      fail_listing: AtomicBool::new(false),
    }
  }

  pub fn failing_writes(self) -> Self {
    self.fail_writes.store(true, Ordering::SeqCst);
    self
  }

  pub fn failing_listing(self) -> Self {
    self.fail_listing.store(true, Ordering::SeqCst);
    self
  }

  fn check_write(&self) -> Result<()> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(eyre!("quota exceeded"));
    }
    Ok(())
  }
}

impl<S: CacheStorage> CacheStorage for FlakyStorage<S> {
  fn open(&self, cache: &str) -> Result<()> {
    self.inner.open(cache)
  }

  fn has(&self, cache: &str) -> Result<bool> {
    self.inner.has(cache)
  }

  fn keys(&self) -> Result<Vec<String>> {
    if self.fail_listing.load(Ordering::SeqCst) {
      return Err(eyre!("storage unavailable"));
    }
    self.inner.keys()
  }

  fn delete(&self, cache: &str) -> Result<bool> {
    self.inner.delete(cache)
  }

  fn put(&self, cache: &str, key: &RequestKey, response: &Response) -> Result<()> {
    self.check_write()?;
    self.inner.put(cache, key, response)
  }

  fn put_all(&self, cache: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    self.check_write()?;
    self.inner.put_all(cache, entries)
  }

  fn match_in(&self, cache: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    self.inner.match_in(cache, key)
  }

  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedEntry>> {
    self.inner.match_any(key)
  }

  fn entries(&self, cache: &str) -> Result<Vec<String>> {
    self.inner.entries(cache)
  }

  fn mark_activated(&self, cache: &str) -> Result<()> {
    self.check_write()?;
    self.inner.mark_activated(cache)
  }

  fn is_activated(&self, cache: &str) -> Result<bool> {
    self.inner.is_activated(cache)
  }
}

#[derive(Default)]
struct Recorded {
  claims: usize,
  windows: Vec<Url>,
  notifications: Vec<Notification>,
}

/// Host that records what the worker asked of it.
#[derive(Clone, Default)]
pub struct RecordingHost {
  recorded: Arc<Mutex<Recorded>>,
}

impl RecordingHost {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn claims(&self) -> usize {
    self.recorded.lock().unwrap().claims
  }

  pub fn windows(&self) -> Vec<Url> {
    self.recorded.lock().unwrap().windows.clone()
  }

  pub fn notifications(&self) -> Vec<Notification> {
    self.recorded.lock().unwrap().notifications.clone()
  }
}

impl Host for RecordingHost {
  fn claim(&self) -> impl Future<Output = Result<()>> + Send {
    self.recorded.lock().unwrap().claims += 1;
    std::future::ready(Ok(()))
  }

  fn open_window(&self, url: &Url) -> impl Future<Output = Result<()>> + Send {
    self.recorded.lock().unwrap().windows.push(url.clone());
    std::future::ready(Ok(()))
  }

  fn show_notification(
    &self,
    notification: &Notification,
  ) -> impl Future<Output = Result<()>> + Send {
    self
      .recorded
      .lock()
      .unwrap()
      .notifications
      .push(notification.clone());
    std::future::ready(Ok(()))
  }
}

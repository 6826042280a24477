//! Cache layer that orchestrates caching logic with network fetching.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::{CachedEntry, RequestKey, Served};
use crate::net::{Fetcher, Request, Response};

/// Fetch strategies over a cache storage backend.
///
/// Every strategy reads from all caches but writes only to the runtime cache,
/// and only responses that are successful and same-origin.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  runtime_cache: String,
}

impl<S: CacheStorage> CacheLayer<S> {
  pub fn new(storage: Arc<S>, runtime_cache: impl Into<String>) -> Self {
    Self {
      storage,
      runtime_cache: runtime_cache.into(),
    }
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  /// Network-first with the cached copy as fallback (API requests).
  ///
  /// 1. Fetch from network; on success cache a copy and return the live response
  /// 2. On network failure, return the cached entry for the same request
  /// 3. No cached entry: the request fails
  pub async fn network_first<F: Fetcher>(&self, fetcher: &F, request: &Request) -> Result<Served> {
    let key = cache_key(request)?;

    match fetcher.fetch(request).await {
      Ok(response) => {
        self.store(&key, &response);
        Ok(Served::from_network(response))
      }
      Err(err) => {
        debug!(url = %request.url, error = %err, "network failed, trying cache");
        match self.lookup(&key) {
          Some(entry) => Ok(Served::offline(entry)),
          None => Err(err.wrap_err(format!("No cached response for {}", request.url))),
        }
      }
    }
  }

  /// Network-first with substitute documents as fallback (page navigations).
  ///
  /// The live response is returned verbatim and not cached. On network failure
  /// the first `fallbacks` key present in any cache is served instead.
  pub async fn network_first_with_fallback<F: Fetcher>(
    &self,
    fetcher: &F,
    request: &Request,
    fallbacks: &[RequestKey],
  ) -> Result<Served> {
    match fetcher.fetch(request).await {
      Ok(response) => Ok(Served::from_network(response)),
      Err(err) => {
        debug!(url = %request.url, error = %err, "navigation failed, trying fallbacks");
        fallbacks
          .iter()
          .find_map(|key| self.lookup(key))
          .map(Served::fallback)
          .ok_or_else(|| err.wrap_err(format!("No offline document for {}", request.url)))
      }
    }
  }

  /// Cache-first with network fill (static assets).
  ///
  /// 1. Cache hit: return it without touching the network
  /// 2. Miss: fetch, cache qualifying responses, return
  /// 3. Network failure: serve `fallback` if given and cached, else fail
  pub async fn cache_first<F: Fetcher>(
    &self,
    fetcher: &F,
    request: &Request,
    fallback: Option<&RequestKey>,
  ) -> Result<Served> {
    let key = cache_key(request)?;

    if let Some(entry) = self.lookup(&key) {
      return Ok(Served::from_cache(entry));
    }

    match fetcher.fetch(request).await {
      Ok(response) => {
        self.store(&key, &response);
        Ok(Served::from_network(response))
      }
      Err(err) => fallback
        .and_then(|key| self.lookup(key))
        .map(Served::fallback)
        .ok_or(err),
    }
  }

  /// Read-side failures count as misses; the caller falls through to the next rule.
  fn lookup(&self, key: &RequestKey) -> Option<CachedEntry> {
    match self.storage.match_any(key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(url = %key.url(), error = %e, "cache read failed");
        None
      }
    }
  }

  /// Best-effort write of a copy into the runtime cache.
  fn store(&self, key: &RequestKey, response: &Response) {
    if !response.is_cacheable() {
      debug!(url = %key.url(), status = response.status, kind = ?response.kind, "not caching");
      return;
    }

    if let Err(e) = self.storage.put(&self.runtime_cache, key, response) {
      warn!(url = %key.url(), cache = %self.runtime_cache, error = %e, "cache write failed");
    }
  }
}

fn cache_key(request: &Request) -> Result<RequestKey> {
  RequestKey::for_request(request)
    .ok_or_else(|| eyre!("{} {} is not cacheable", request.method, request.url))
}

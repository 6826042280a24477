//! Core types for the caching system: request identity and response provenance.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

use crate::net::{Method, Request, Response};

/// Identity of a cacheable request: method + URL without fragment.
///
/// Only GET requests have a key; everything else is uncacheable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: Method,
  url: Url,
}

impl RequestKey {
  /// Key for a GET of `url`.
  pub fn get(url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: Method::GET,
      url,
    }
  }

  /// Returns None for non-GET requests.
  pub fn for_request(request: &Request) -> Option<Self> {
    request.is_get().then(|| Self::get(&request.url))
  }

  pub fn method(&self) -> &Method {
    &self.method
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// SHA256 hash for stable, fixed-length storage keys
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response read back from a cache.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: Response,
  /// Cache the entry was found in
  pub cache_name: String,
  /// When the entry was stored or last replaced
  pub stored_at: DateTime<Utc>,
}

/// Result of a fetch strategy, including the response and where it came from.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: ResponseSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(entry: CachedEntry) -> Self {
    Self {
      response: entry.response,
      source: ResponseSource::Cache,
      cached_at: Some(entry.stored_at),
    }
  }

  /// Network unavailable, serving cached data
  pub fn offline(entry: CachedEntry) -> Self {
    Self {
      response: entry.response,
      source: ResponseSource::Offline,
      cached_at: Some(entry.stored_at),
    }
  }

  pub fn fallback(entry: CachedEntry) -> Self {
    Self {
      response: entry.response,
      source: ResponseSource::Fallback,
      cached_at: Some(entry.stored_at),
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live network response
  Network,
  /// Cache hit served without touching the network
  Cache,
  /// Network failed, serving the cached copy of the same request
  Offline,
  /// Network failed, serving a substitute (root document, offline page, icon)
  Fallback,
}

//! Request/response records and the network seam the worker fetches through.

mod http;

use color_eyre::Result;
use serde::Serialize;
use std::future::Future;
use url::Url;

pub use http::HttpFetcher;
pub use reqwest::Method;

/// What kind of resource a request is loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
  Document,
  Image,
  Script,
  Style,
  Font,
  Manifest,
  #[default]
  Other,
}

impl Destination {
  /// Best guess from the URL path extension, for hosts that don't tag requests.
  pub fn infer(url: &Url) -> Self {
    let path = url.path().to_ascii_lowercase();
    let ext = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    match ext {
      "png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" | "ico" | "avif" => Self::Image,
      "js" | "mjs" => Self::Script,
      "css" => Self::Style,
      "woff" | "woff2" | "ttf" | "otf" => Self::Font,
      "webmanifest" => Self::Manifest,
      _ if path.ends_with("/manifest.json") => Self::Manifest,
      _ => Self::Other,
    }
  }
}

/// An intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  /// Top-level page navigation
  pub navigate: bool,
  pub destination: Destination,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    let destination = Destination::infer(&url);
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
      navigate: false,
      destination,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A page navigation (always a GET for a document).
  pub fn navigate(url: Url) -> Self {
    Self {
      navigate: true,
      destination: Destination::Document,
      ..Self::get(url)
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_json(mut self, payload: &serde_json::Value) -> Result<Self> {
    self.body = Some(serde_json::to_vec(payload)?);
    Ok(self.with_header("content-type", "application/json"))
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  pub fn is_http(&self) -> bool {
    matches!(self.url.scheme(), "http" | "https")
  }
}

/// Response type as seen by the page: same-origin, cross-origin, or opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
  Basic,
  Cors,
  Opaque,
}

impl ResponseKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Opaque => "opaque",
    }
  }

  pub fn parse(s: &str) -> Self {
    match s {
      "basic" => Self::Basic,
      "cors" => Self::Cors,
      _ => Self::Opaque,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub kind: ResponseKind,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
      kind: ResponseKind::Basic,
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_kind(mut self, kind: ResponseKind) -> Self {
    self.kind = kind;
    self
  }

  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Only successful same-origin responses may be written to a cache.
  pub fn is_cacheable(&self) -> bool {
    self.is_ok() && self.kind == ResponseKind::Basic
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// The network. `Err` means the fetch itself failed (offline, DNS, reset);
/// HTTP error statuses come back as `Ok` responses.
pub trait Fetcher: Send + Sync {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

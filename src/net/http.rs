//! `reqwest`-backed fetcher used by the CLI host.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::time::Duration;
use url::{Origin, Url};

use super::{Fetcher, Request, Response, ResponseKind};

/// Network client wrapper
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  origin: Origin,
}

impl HttpFetcher {
  /// `origin` decides which responses count as same-origin ("basic").
  pub fn new(origin: &Url) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(30))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      origin: origin.origin(),
    })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let origin = self.origin.clone();
    let url = request.url.clone();

    async move {
      let resp = builder
        .send()
        .await
        .map_err(|e| eyre!("Request to {} failed: {}", url, e))?;

      let status = resp.status().as_u16();
      let kind = if resp.url().origin() == origin {
        ResponseKind::Basic
      } else {
        ResponseKind::Cors
      };
      let headers = resp
        .headers()
        .iter()
        .filter_map(|(k, v)| {
          v.to_str()
            .ok()
            .map(|v| (k.as_str().to_string(), v.to_string()))
        })
        .collect();

      let body = resp
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read body from {}: {}", url, e))?
        .to_vec();

      Ok(Response {
        status,
        headers,
        body,
        kind,
      })
    }
  }
}

//! Request classification. Pure: no I/O, no state.

use crate::net::Request;

/// Which strategy handles a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
  /// Network-first, cached copy on failure
  Api,
  /// Network-first, root or offline document on failure
  Navigation,
  /// Cache-first, network fill
  Static,
  /// Not intercepted at all
  Ignored,
}

/// Rules, first match wins: non-GET and non-HTTP(S) requests are ignored,
/// then API prefix, then navigations, then everything else is static.
pub fn classify(request: &Request, api_prefix: &str) -> RouteClass {
  if !request.is_get() || !request.is_http() {
    return RouteClass::Ignored;
  }

  if request.url.path().starts_with(api_prefix) {
    RouteClass::Api
  } else if request.navigate {
    RouteClass::Navigation
  } else {
    RouteClass::Static
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::Method;
  use url::Url;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_non_get_ignored_even_under_api() {
    let req = Request::new(Method::POST, url("http://localhost:3000/api/payments"));
    assert_eq!(classify(&req, "/api/"), RouteClass::Ignored);
    let req = Request::new(Method::DELETE, url("http://localhost:3000/app.js"));
    assert_eq!(classify(&req, "/api/"), RouteClass::Ignored);
  }

  #[test]
  fn test_extension_scheme_ignored() {
    let req = Request::get(url("chrome-extension://abcdef/inject.js"));
    assert_eq!(classify(&req, "/api/"), RouteClass::Ignored);
  }

  #[test]
  fn test_api_beats_navigation() {
    let req = Request::navigate(url("http://localhost:3000/api/groups"));
    assert_eq!(classify(&req, "/api/"), RouteClass::Api);
  }

  #[test]
  fn test_navigation_and_static() {
    let nav = Request::navigate(url("http://localhost:3000/member"));
    assert_eq!(classify(&nav, "/api/"), RouteClass::Navigation);

    let asset = Request::get(url("http://localhost:3000/icons/icon-192x192.png"));
    assert_eq!(classify(&asset, "/api/"), RouteClass::Static);

    // Prefix is a plain string test
    let lookalike = Request::get(url("http://localhost:3000/apis.json"));
    assert_eq!(classify(&lookalike, "/api/"), RouteClass::Static);
  }
}

//! Host events as plain data, and what handling them produced.

use color_eyre::Result;
use serde::Deserialize;
use serde_json::{json, Value};

use super::lifecycle::ActivationReport;
use super::push::{ClickAction, Notification};
use super::{Handled, Submission};
use crate::config::WorkerConfig;
use crate::net::{Method, Request};
use crate::queue::{DrainReport, QueuedWrite};

/// Application events
#[derive(Debug, Clone)]
pub enum Event {
  Install,
  Activate,
  Fetch(Request),
  /// Background sync signal
  Sync { tag: String },
  Push { data: Option<String> },
  NotificationClick { action: Option<String> },
  /// A write from the page
  Submit(QueuedWrite),
}

/// Serialized form of an event, one JSON object per line on the CLI.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventRecord {
  Install,
  Activate,
  Fetch {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    navigate: bool,
  },
  Sync {
    tag: String,
  },
  Push {
    #[serde(default)]
    data: Option<String>,
  },
  NotificationClick {
    #[serde(default)]
    action: Option<String>,
  },
  Submit {
    operation: String,
    endpoint: String,
    #[serde(default)]
    payload: Value,
  },
}

impl EventRecord {
  /// Resolve relative URLs against the configured origin.
  pub fn into_event(self, config: &WorkerConfig) -> Result<Event> {
    Ok(match self {
      Self::Install => Event::Install,
      Self::Activate => Event::Activate,
      Self::Fetch {
        url,
        method,
        navigate,
      } => {
        let url = config.resolve(&url)?;
        let method = match method {
          Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())?,
          None => Method::GET,
        };
        if navigate && method == Method::GET {
          Event::Fetch(Request::navigate(url))
        } else {
          Event::Fetch(Request::new(method, url))
        }
      }
      Self::Sync { tag } => Event::Sync { tag },
      Self::Push { data } => Event::Push { data },
      Self::NotificationClick { action } => Event::NotificationClick { action },
      Self::Submit {
        operation,
        endpoint,
        payload,
      } => Event::Submit(QueuedWrite::new(operation, endpoint, payload)),
    })
  }
}

/// What handling one event produced.
#[derive(Debug)]
pub enum EventOutcome {
  Installed { skip_waiting: bool },
  Activated(ActivationReport),
  Fetched(Handled),
  Synced(DrainReport),
  /// Sync tag this worker doesn't handle
  SyncIgnored(String),
  Notified(Notification),
  Clicked(ClickAction),
  Submitted(Submission),
  Failed { event: &'static str, reason: String },
}

impl EventOutcome {
  /// One-line JSON summary for the CLI.
  pub fn summary(&self) -> Value {
    match self {
      Self::Installed { skip_waiting } => json!({ "installed": true, "skip_waiting": skip_waiting }),
      Self::Activated(report) => json!({ "activated": report }),
      Self::Fetched(handled) => json!({ "fetch": handled.summary() }),
      Self::Synced(report) => json!({ "sync": report }),
      Self::SyncIgnored(tag) => json!({ "sync_ignored": tag }),
      Self::Notified(n) => json!({ "notification": n }),
      Self::Clicked(action) => json!({ "click": action }),
      Self::Submitted(submission) => json!({ "submit": submission.summary() }),
      Self::Failed { event, reason } => json!({ "failed": event, "reason": reason }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_fetch_record() {
    let record: EventRecord =
      serde_json::from_str(r#"{"kind":"fetch","url":"/member","navigate":true}"#).unwrap();
    let event = record.into_event(&WorkerConfig::default()).unwrap();
    match event {
      Event::Fetch(req) => {
        assert!(req.navigate);
        assert_eq!(req.url.as_str(), "http://localhost:3000/member");
      }
      other => panic!("unexpected event {:?}", other),
    }
  }

  #[test]
  fn test_parse_post_is_not_navigation() {
    let record: EventRecord = serde_json::from_str(
      r#"{"kind":"fetch","url":"/api/payments","method":"post","navigate":true}"#,
    )
    .unwrap();
    match record.into_event(&WorkerConfig::default()).unwrap() {
      Event::Fetch(req) => {
        assert_eq!(req.method, Method::POST);
        assert!(!req.navigate);
      }
      other => panic!("unexpected event {:?}", other),
    }
  }

  #[test]
  fn test_parse_push_without_data() {
    let record: EventRecord = serde_json::from_str(r#"{"kind":"push"}"#).unwrap();
    assert!(matches!(
      record.into_event(&WorkerConfig::default()).unwrap(),
      Event::Push { data: None }
    ));
  }

  #[test]
  fn test_unknown_kind_rejected() {
    assert!(serde_json::from_str::<EventRecord>(r#"{"kind":"message"}"#).is_err());
  }
}

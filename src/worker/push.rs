//! Push messages to notifications, and notification clicks to actions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::PushConfig;

static NOTIFICATION_COUNTER: AtomicU64 = AtomicU64::new(1);

pub const ACTION_VIEW: &str = "view";
pub const ACTION_DISMISS: &str = "dismiss";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  pub icon: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
  pub date_of_arrival: DateTime<Utc>,
  pub primary_key: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub data: NotificationData,
  pub actions: Vec<NotificationAction>,
}

/// Build the notification for a push message. A missing or blank payload
/// gets the configured default body.
pub fn build_notification(config: &PushConfig, payload: Option<&str>) -> Notification {
  let body = payload
    .filter(|text| !text.trim().is_empty())
    .unwrap_or(&config.default_body)
    .to_string();

  Notification {
    title: config.title.clone(),
    body,
    icon: config.icon.clone(),
    badge: config.badge.clone(),
    vibrate: vec![100, 50, 100],
    data: NotificationData {
      date_of_arrival: Utc::now(),
      primary_key: NOTIFICATION_COUNTER.fetch_add(1, Ordering::Relaxed),
    },
    actions: vec![
      NotificationAction {
        action: ACTION_VIEW.to_string(),
        title: "View".to_string(),
        icon: config.view_icon.clone(),
      },
      NotificationAction {
        action: ACTION_DISMISS.to_string(),
        title: "Dismiss".to_string(),
        icon: config.dismiss_icon.clone(),
      },
    ],
  }
}

/// What a click on a notification does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum ClickAction {
  /// Open the given path in a window
  Open(String),
  /// Just close the notification
  Close,
}

/// `None` is a click on the notification body.
pub fn click_action(config: &PushConfig, action: Option<&str>) -> ClickAction {
  match action {
    Some(ACTION_DISMISS) => ClickAction::Close,
    None | Some(ACTION_VIEW) | Some("") => ClickAction::Open(config.open_url.clone()),
    Some(_) => ClickAction::Close,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_payload_becomes_body() {
    let config = PushConfig::default();
    let n = build_notification(&config, Some("Payment of 5000 received"));
    assert_eq!(n.body, "Payment of 5000 received");
    assert_eq!(n.title, config.title);
  }

  #[test]
  fn test_missing_payload_uses_default() {
    let config = PushConfig::default();
    let n = build_notification(&config, None);
    assert_eq!(n.body, config.default_body);
    assert!(!n.body.is_empty());

    let blank = build_notification(&config, Some("  "));
    assert_eq!(blank.body, config.default_body);
  }

  #[test]
  fn test_two_actions_with_icons() {
    let config = PushConfig::default();
    let n = build_notification(&config, None);
    let names: Vec<&str> = n.actions.iter().map(|a| a.action.as_str()).collect();
    assert_eq!(names, vec![ACTION_VIEW, ACTION_DISMISS]);
    assert_eq!(n.actions[0].icon, config.view_icon);
    assert_eq!(n.actions[1].icon, config.dismiss_icon);
  }

  #[test]
  fn test_click_actions() {
    let config = PushConfig::default();
    assert_eq!(click_action(&config, Some("view")), ClickAction::Open("/".into()));
    assert_eq!(click_action(&config, None), ClickAction::Open("/".into()));
    assert_eq!(click_action(&config, Some("dismiss")), ClickAction::Close);
    assert_eq!(click_action(&config, Some("snooze")), ClickAction::Close);
  }
}

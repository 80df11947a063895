//! Background sync, push, notification click and client message handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{Gateway, GatewayState};
use crate::cache::CacheStorage;
use crate::error::GatewayError;
use crate::network::Network;

pub const BACKGROUND_SYNC_TAG: &str = "background-sync";

const NOTIFICATION_TITLE: &str = "MoldPark";
const DEFAULT_BODY: &str = "MoldPark bildirimi";
const ICON: &str = "/static/images/moldpark_logo.jpg";
const BADGE: &str = "/static/favicon.ico";

/// Notification handed to the host's display primitive.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub data: NotificationData,
  pub actions: Vec<NotificationAction>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
  pub date_of_arrival: DateTime<Utc>,
  pub primary_key: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  pub icon: String,
}

impl NotificationAction {
  fn new(action: &str, title: &str) -> Self {
    Self {
      action: action.to_string(),
      title: title.to_string(),
      icon: BADGE.to_string(),
    }
  }
}

/// What the host should do after a notification click.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
  /// Close the notification and open a window at this URL
  OpenWindow(String),
  /// Close the notification only
  Dismissed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
  Completed,
  Ignored,
}

/// Control messages posted by the page.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
  #[serde(rename = "SKIP_WAITING")]
  SkipWaiting,
  #[serde(other)]
  Unknown,
}

impl ClientMessage {
  /// Messages without a recognizable `type` are treated as unknown.
  pub fn parse(data: &Value) -> Self {
    ClientMessage::deserialize(data).unwrap_or(ClientMessage::Unknown)
  }
}

impl<S: CacheStorage, N: Network> Gateway<S, N> {
  /// Run the reconciliation task registered under `tag`.
  pub async fn handle_sync(&self, tag: &str) -> SyncOutcome {
    if tag != BACKGROUND_SYNC_TAG {
      debug!(tag, "Ignoring sync event");
      return SyncOutcome::Ignored;
    }

    info!("Background sync triggered");
    self.background_sync().await;
    SyncOutcome::Completed
  }

  /// Nothing is queued while offline yet, so there is nothing to replay.
  async fn background_sync(&self) {
    debug!(cache = %self.cache_name(), "Performing background sync");
  }

  pub fn handle_push(&self, payload: Option<&str>) -> Notification {
    info!("Push notification received");

    Notification {
      title: NOTIFICATION_TITLE.to_string(),
      body: payload.unwrap_or(DEFAULT_BODY).to_string(),
      icon: ICON.to_string(),
      badge: BADGE.to_string(),
      vibrate: vec![100, 50, 100],
      data: NotificationData {
        date_of_arrival: Utc::now(),
        primary_key: 1,
      },
      actions: vec![
        NotificationAction::new("explore", "Görüntüle"),
        NotificationAction::new("close", "Kapat"),
      ],
    }
  }

  pub fn handle_notification_click(&self, action: Option<&str>) -> ClickOutcome {
    info!(action = action.unwrap_or(""), "Notification clicked");

    match action {
      Some("explore") => ClickOutcome::OpenWindow("/".to_string()),
      _ => ClickOutcome::Dismissed,
    }
  }

  /// Handle a message posted by a controlled page.
  ///
  /// `SKIP_WAITING` activates an installed version right away.
  pub async fn handle_message(&self, data: &Value) -> Result<GatewayState, GatewayError> {
    info!(%data, "Message received");

    match ClientMessage::parse(data) {
      ClientMessage::SkipWaiting => {
        self.skip_waiting();
        if self.state() == GatewayState::Waiting {
          self.activate().await?;
        }
      }
      ClientMessage::Unknown => warn!(%data, "Ignoring unknown message"),
    }

    Ok(self.state())
  }
}

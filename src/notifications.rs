//! Client for the notification endpoints behind the page's badge.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::config::Config;

/// Reply from the notification backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NotificationAck {
  pub success: bool,
  /// Absent on mark-all, which always leaves zero unread
  #[serde(default)]
  pub unread_count: u32,
}

/// Text for the unread badge, or None to hide it.
pub fn badge_label(count: u32) -> Option<String> {
  (count > 0).then(|| count.to_string())
}

pub fn read_path(notification_id: u64) -> String {
  format!("/center/notifications/{}/read/", notification_id)
}

pub const MARK_ALL_READ_PATH: &str = "/center/notifications/mark-all-read/";

#[derive(Clone)]
pub struct NotificationClient {
  client: reqwest::Client,
  origin: Url,
  csrf_token: String,
}

impl NotificationClient {
  pub fn new(config: &Config) -> Result<Self> {
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      origin: config.origin_url()?,
      csrf_token: config.get_csrf_token()?,
    })
  }

  /// Mark one notification as read
  pub async fn mark_read(&self, notification_id: u64) -> Result<NotificationAck> {
    self.post(&read_path(notification_id)).await
  }

  /// Mark every notification as read
  pub async fn mark_all_read(&self) -> Result<NotificationAck> {
    let mut ack = self.post(MARK_ALL_READ_PATH).await?;
    if ack.success {
      ack.unread_count = 0;
    }
    Ok(ack)
  }

  async fn post(&self, path: &str) -> Result<NotificationAck> {
    let url = self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid notification path {}: {}", path, e))?;

    debug!(%url, "Posting notification update");

    let response = self
      .client
      .post(url.clone())
      .header("X-CSRFToken", &self.csrf_token)
      .header("Content-Type", "application/json")
      .send()
      .await
      .map_err(|e| eyre!("Notification request to {} failed: {}", url, e))?;

    let status = response.status();
    let ack: NotificationAck = response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse notification reply ({}): {}", status, e))?;

    if !ack.success {
      warn!(%url, %status, "Notification backend reported failure");
    }

    Ok(ack)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::network::testing::{direct_client, http_reply, serve_once};

  async fn client_for(reply: &str) -> (NotificationClient, tokio::task::JoinHandle<String>) {
    let (origin, server) = serve_once(http_reply("200 OK", "application/json", reply)).await;
    let client = NotificationClient {
      client: direct_client(),
      origin,
      csrf_token: "csrf-123".to_string(),
    };
    (client, server)
  }

  #[test]
  fn test_badge_label() {
    assert_eq!(badge_label(0), None);
    assert_eq!(badge_label(3), Some("3".to_string()));
  }

  #[test]
  fn test_paths() {
    assert_eq!(read_path(42), "/center/notifications/42/read/");
    assert_eq!(MARK_ALL_READ_PATH, "/center/notifications/mark-all-read/");
  }

  #[test]
  fn test_ack_parsing() {
    let ack: NotificationAck =
      serde_json::from_str(r#"{"success": true, "unread_count": 4}"#).unwrap();
    assert_eq!(
      ack,
      NotificationAck {
        success: true,
        unread_count: 4
      }
    );

    let ack: NotificationAck = serde_json::from_str(r#"{"success": true}"#).unwrap();
    assert_eq!(ack.unread_count, 0);

    assert!(serde_json::from_str::<NotificationAck>(r#"{"unread_count": 1}"#).is_err());
  }

  #[test]
  fn test_client_requires_csrf_token() {
    if std::env::var("MOLDGATE_CSRF_TOKEN").is_ok() {
      return;
    }
    assert!(NotificationClient::new(&Config::default()).is_err());

    let config = Config {
      csrf_token: Some("token".to_string()),
      ..Config::default()
    };
    assert!(NotificationClient::new(&config).is_ok());
  }

  #[tokio::test]
  async fn test_mark_read_posts_with_csrf_token() {
    let (client, server) = client_for(r#"{"success": true, "unread_count": 3}"#).await;

    let ack = client.mark_read(42).await.unwrap();
    assert_eq!(
      ack,
      NotificationAck {
        success: true,
        unread_count: 3
      }
    );

    let head = server.await.unwrap();
    assert!(head.starts_with("post /center/notifications/42/read/ http/1.1"));
    assert!(head.contains("x-csrftoken: csrf-123"));
    assert!(head.contains("content-type: application/json"));
  }

  #[tokio::test]
  async fn test_mark_all_read_clears_count() {
    let (client, server) = client_for(r#"{"success": true, "unread_count": 5}"#).await;

    let ack = client.mark_all_read().await.unwrap();
    assert!(ack.success);
    assert_eq!(ack.unread_count, 0);

    let head = server.await.unwrap();
    assert!(head.starts_with("post /center/notifications/mark-all-read/ http/1.1"));
  }

  #[tokio::test]
  async fn test_rejected_mark_all_keeps_count() {
    let (client, server) = client_for(r#"{"success": false, "unread_count": 2}"#).await;

    let ack = client.mark_all_read().await.unwrap();
    assert!(!ack.success);
    assert_eq!(ack.unread_count, 2);
    server.await.unwrap();
  }

  #[tokio::test]
  async fn test_unparseable_reply_is_an_error() {
    let (client, server) = client_for("<html>login</html>").await;
    assert!(client.mark_read(1).await.is_err());
    server.await.unwrap();
  }
}

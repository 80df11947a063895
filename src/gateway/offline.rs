//! Page served to navigations when neither cache nor network can answer.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;

use crate::http::Response;

/// Self-contained, no external assets.
pub const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>MoldPark - Çevrimdışı</title>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <style>
        body {
            font-family: Arial, sans-serif;
            text-align: center;
            padding: 50px;
            background: linear-gradient(135deg, #F5B427 0%, #D49A1F 100%);
            color: white;
            margin: 0;
            min-height: 100vh;
            display: flex;
            align-items: center;
            justify-content: center;
            flex-direction: column;
        }
        .offline-container {
            background: rgba(255, 255, 255, 0.1);
            padding: 40px;
            border-radius: 20px;
            backdrop-filter: blur(10px);
            box-shadow: 0 8px 32px rgba(0, 0, 0, 0.3);
        }
        h1 { color: #fff; margin-bottom: 20px; }
        .retry-btn {
            background: #4CAF50;
            color: white;
            border: none;
            padding: 12px 24px;
            border-radius: 25px;
            cursor: pointer;
            font-size: 16px;
            margin-top: 20px;
            transition: all 0.3s ease;
        }
        .retry-btn:hover {
            background: #45a049;
            transform: translateY(-2px);
        }
    </style>
</head>
<body>
    <div class="offline-container">
        <h1>🔌 İnternet Bağlantısı Yok</h1>
        <p>MoldPark'a erişmek için internet bağlantınızı kontrol edin.</p>
        <button class="retry-btn" onclick="window.location.reload()">
            🔄 Tekrar Dene
        </button>
    </div>
</body>
</html>
"#;

/// Read a replacement offline page from disk.
pub fn load_offline_page(path: &Path) -> Result<String> {
  std::fs::read_to_string(path)
    .map_err(|e| eyre!("Failed to read offline page {}: {}", path.display(), e))
}

pub fn offline_response(page: &str) -> Response {
  Response::html(page)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_builtin_page() {
    let response = offline_response(OFFLINE_PAGE);
    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("text/html"));

    let text = response.text();
    assert!(text.contains("İnternet Bağlantısı Yok"));
    assert!(text.contains("window.location.reload()"));
    assert!(!text.contains("<link"));
    assert!(!text.contains("<script src"));
  }

  #[test]
  fn test_load_custom_page() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.html");
    std::fs::write(&path, "<h1>offline</h1>").unwrap();

    assert_eq!(load_offline_page(&path).unwrap(), "<h1>offline</h1>");
    assert!(load_offline_page(&dir.path().join("missing.html")).is_err());
  }
}

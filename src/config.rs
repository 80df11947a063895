use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin server every relative URL resolves against
  pub origin: String,
  pub gateway: GatewayConfig,
  pub storage: StorageConfig,
  pub network: NetworkConfig,
  /// Also write logs to this file
  pub log_file: Option<PathBuf>,
  /// CSRF token sent with notification backend calls
  pub csrf_token: Option<String>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8000".to_string(),
      gateway: GatewayConfig::default(),
      storage: StorageConfig::default(),
      network: NetworkConfig::default(),
      log_file: None,
      csrf_token: None,
    }
  }
}

/// Immutable gateway configuration. Bump `cache_version` whenever the
/// manifest or interception policy changes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
  /// Name of the current cache store
  pub cache_version: String,
  /// URLs pre-cached at install, in order
  pub static_manifest: Vec<String>,
  /// Path prefix of static assets cached on first fetch
  pub static_prefix: String,
  pub denylist: DenylistConfig,
  /// Replaces the built-in offline page
  pub offline_page: Option<PathBuf>,
}

impl Default for GatewayConfig {
  fn default() -> Self {
    Self {
      cache_version: "moldpark-cache-v2".to_string(),
      static_manifest: vec![
        "/".to_string(),
        "/static/js/custom.js".to_string(),
        "/static/images/moldpark_logo.jpg".to_string(),
        "/static/favicon.ico".to_string(),
      ],
      static_prefix: "/static/".to_string(),
      denylist: DenylistConfig::default(),
      offline_page: None,
    }
  }
}

/// Requests matching any of these pass straight through to the network.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DenylistConfig {
  /// URL scheme prefixes, e.g. browser extensions
  pub schemes: Vec<String>,
  /// Substrings anywhere in the URL
  pub patterns: Vec<String>,
  /// Bypass every URL with a query string
  pub bypass_query: bool,
}

impl Default for DenylistConfig {
  fn default() -> Self {
    Self {
      schemes: vec!["chrome-extension://".to_string()],
      patterns: vec![
        "/.well-known/".to_string(),
        "/api/".to_string(),
        "/django-admin/".to_string(),
      ],
      bypass_query: true,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Database path (default: $XDG_DATA_HOME/moldgate/cache.db)
  pub path: Option<PathBuf>,
  /// Keep cache stores in memory only
  pub in_memory: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Per-request timeout in seconds, 0 for none
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 30 }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./moldgate.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/moldgate/config.yaml
  ///
  /// Falls back to the built-in defaults when no file is found.
  /// `MOLDGATE_ORIGIN` overrides the configured origin.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        info!("No configuration file found, using defaults");
        Config::default()
      }
    };

    if let Ok(origin) = std::env::var("MOLDGATE_ORIGIN") {
      config.origin = origin;
    }

    config.origin_url()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("moldgate.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("moldgate").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Get the CSRF token, preferring `MOLDGATE_CSRF_TOKEN` over the config file.
  pub fn get_csrf_token(&self) -> Result<String> {
    std::env::var("MOLDGATE_CSRF_TOKEN")
      .ok()
      .or_else(|| self.csrf_token.clone())
      .ok_or_else(|| {
        eyre!("CSRF token not found. Set MOLDGATE_CSRF_TOKEN or csrf_token in the config file.")
      })
  }
}

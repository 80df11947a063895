//! Offline cache gateway.
//!
//! Sits between a page's fetches and the origin server:
//! - Install pre-caches the static manifest into the store named by the
//!   current version
//! - Activate deletes every other store and takes control of clients
//! - Fetches are served cache-first, static assets are cached on a miss,
//!   and failed HTML navigations get an offline page
//!
//! The hosting adapter drives the lifecycle and forwards each request to
//! [`Gateway::handle_fetch`].

mod hooks;
mod offline;
mod policy;

pub use hooks::{ClickOutcome, Notification, SyncOutcome};
pub use offline::load_offline_page;

use offline::OFFLINE_PAGE;
use policy::{BypassReason, InterceptPolicy, Interception};

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheSource, CacheStorage};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::http::{Request, Response};
use crate::network::Network;

/// Lifecycle of one gateway version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
  Uninstalled,
  Installing,
  /// Installed, waiting to take over from the previous version
  Waiting,
  Activating,
  Active,
  /// Install failed; this version will never activate
  Redundant,
}

impl fmt::Display for GatewayState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      GatewayState::Uninstalled => "uninstalled",
      GatewayState::Installing => "installing",
      GatewayState::Waiting => "waiting",
      GatewayState::Activating => "activating",
      GatewayState::Active => "active",
      GatewayState::Redundant => "redundant",
    };
    f.write_str(name)
  }
}

/// Where a fetch response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Cache,
  Network,
  /// Not intercepted, handed straight to the network
  Passthrough,
  /// Synthesized offline page
  Offline,
}

impl From<CacheSource> for ResponseSource {
  fn from(source: CacheSource) -> Self {
    match source {
      CacheSource::Cache => ResponseSource::Cache,
      CacheSource::Network => ResponseSource::Network,
    }
  }
}

impl fmt::Display for ResponseSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ResponseSource::Cache => "cache",
      ResponseSource::Network => "network",
      ResponseSource::Passthrough => "passthrough",
      ResponseSource::Offline => "offline",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
  pub response: Response,
  pub source: ResponseSource,
  /// When the entry was stored, for responses served from cache
  pub cached_at: Option<DateTime<Utc>>,
}

pub struct Gateway<S: CacheStorage, N: Network> {
  config: Arc<GatewayConfig>,
  origin: Url,
  policy: InterceptPolicy,
  offline_page: String,
  storage: Arc<S>,
  network: N,
  state: RwLock<GatewayState>,
  skip_waiting: AtomicBool,
  /// Store serving fetches: ours once active, else the previous version's
  controller: RwLock<Option<String>>,
}

impl<S: CacheStorage, N: Network> Gateway<S, N> {
  pub fn new(config: GatewayConfig, origin: Url, storage: Arc<S>, network: N) -> Self {
    let policy = InterceptPolicy::new(&config);

    Self {
      config: Arc::new(config),
      origin,
      policy,
      offline_page: OFFLINE_PAGE.to_string(),
      storage,
      network,
      state: RwLock::new(GatewayState::Uninstalled),
      skip_waiting: AtomicBool::new(false),
      controller: RwLock::new(None),
    }
  }

  /// Replace the built-in offline page.
  pub fn with_offline_page(mut self, page: String) -> Self {
    self.offline_page = page;
    self
  }

  #[allow(dead_code)]
  pub fn config(&self) -> &GatewayConfig {
    &self.config
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Name of the store this version installs into.
  pub fn cache_name(&self) -> &str {
    &self.config.cache_version
  }

  pub fn state(&self) -> GatewayState {
    *self.state.read().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, state: GatewayState) {
    *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
  }

  /// Move to `next` if the current state is one of `allowed`.
  fn transition(
    &self,
    operation: &'static str,
    allowed: &[GatewayState],
    next: GatewayState,
  ) -> Result<(), GatewayError> {
    let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
    if !allowed.contains(&*state) {
      return Err(GatewayError::InvalidState {
        operation,
        state: *state,
      });
    }
    *state = next;
    Ok(())
  }

  /// Store currently serving fetches, if any version controls clients.
  pub fn controller(&self) -> Option<String> {
    self
      .controller
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  fn set_controller(&self, name: Option<String>) {
    *self.controller.write().unwrap_or_else(|e| e.into_inner()) = name;
  }

  /// Ask to activate as soon as installed, without waiting for clients to
  /// release the previous version.
  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  /// Adopt the persisted registration.
  ///
  /// A registration naming this version makes it active right away. One
  /// naming an older version whose store still exists makes that store the
  /// controller. Returns true in the first case.
  fn adopt_registration(&self) -> Result<bool, GatewayError> {
    let current = self.cache_name().to_string();
    let registered = self
      .storage
      .get_registration()
      .map_err(GatewayError::Storage)?;

    let Some(previous) = registered else {
      return Ok(false);
    };
    if !self
      .storage
      .has_store(&previous)
      .map_err(GatewayError::Storage)?
    {
      return Ok(false);
    }

    if previous == current {
      self.set_controller(Some(current));
      self.set_state(GatewayState::Active);
      return Ok(true);
    }

    debug!(cache = %previous, "Previous gateway controls clients");
    self.set_controller(Some(previous));
    Ok(false)
  }

  /// Rebuild the lifecycle state left by an earlier process.
  ///
  /// An installed store that is not yet registered is `Waiting`. Nothing is
  /// fetched.
  pub fn restore(&self) -> Result<GatewayState, GatewayError> {
    if self.adopt_registration()? {
      return Ok(GatewayState::Active);
    }

    let installed = self
      .storage
      .has_store(self.cache_name())
      .map_err(GatewayError::Storage)?;
    if installed && self.state() == GatewayState::Uninstalled {
      debug!(cache = %self.cache_name(), "Installed version is waiting");
      self.set_state(GatewayState::Waiting);
    }

    Ok(self.state())
  }

  /// Bring this version up: reuse a prior activation, or install and activate.
  ///
  /// If install fails, the previously registered version (if any) keeps
  /// serving fetches and the install error is returned.
  pub async fn register(&self) -> Result<GatewayState, GatewayError> {
    if self.adopt_registration()? {
      info!(cache = %self.cache_name(), "Gateway already active");
      return Ok(GatewayState::Active);
    }

    self.install().await?;

    if self.skip_waiting_requested() || self.controller().is_none() {
      self.activate().await?;
    }

    Ok(self.state())
  }

  /// Open the current store and pre-cache every manifest URL.
  ///
  /// The manifest is all-or-nothing: one failing URL fails the install,
  /// leaves no entries behind and marks this version redundant.
  pub async fn install(&self) -> Result<(), GatewayError> {
    self.transition(
      "install",
      &[GatewayState::Uninstalled, GatewayState::Redundant],
      GatewayState::Installing,
    )?;
    info!(cache = %self.cache_name(), "Installing gateway");

    match self.populate().await {
      Ok(()) => {
        info!(
          cache = %self.cache_name(),
          assets = self.config.static_manifest.len(),
          "Static assets cached"
        );
        self.skip_waiting();
        self.set_state(GatewayState::Waiting);
        Ok(())
      }
      Err(e) => {
        warn!(cache = %self.cache_name(), error = %e, "Install failed");
        self.set_state(GatewayState::Redundant);
        Err(e)
      }
    }
  }

  async fn populate(&self) -> Result<(), GatewayError> {
    let name = self.cache_name();
    let created = self
      .storage
      .open_store(name)
      .map_err(|e| GatewayError::Install {
        url: name.to_string(),
        reason: e.to_string(),
      })?;

    let cache = CacheLayer::new(Arc::clone(&self.storage), name);
    let requests = self
      .config
      .static_manifest
      .iter()
      .map(|url| Request::get(url.as_str()).resolve(&self.origin))
      .collect();

    let network = &self.network;
    let result = cache
      .add_all(requests, |request| async move { network.fetch(&request).await })
      .await;

    if result.is_err() && created {
      if let Err(e) = self.storage.delete_store(name) {
        warn!(cache = %name, error = %e, "Failed to remove incomplete store");
      }
    }

    result
  }

  /// Delete stale stores and take control of clients.
  pub async fn activate(&self) -> Result<(), GatewayError> {
    self.transition(
      "activate",
      &[GatewayState::Waiting],
      GatewayState::Activating,
    )?;
    info!(cache = %self.cache_name(), "Activating gateway");

    if let Err(e) = self.purge_stale_stores() {
      self.set_state(GatewayState::Waiting);
      return Err(e);
    }

    self.claim_clients();
    self.set_state(GatewayState::Active);
    info!(cache = %self.cache_name(), "Gateway activated");
    Ok(())
  }

  fn purge_stale_stores(&self) -> Result<(), GatewayError> {
    let current = self.cache_name();
    let names = self.storage.store_names().map_err(GatewayError::Storage)?;

    for name in names.iter().filter(|name| name.as_str() != current) {
      info!(cache = %name, "Deleting old cache");
      self
        .storage
        .delete_store(name)
        .map_err(GatewayError::Storage)?;
    }

    self
      .storage
      .set_registration(current)
      .map_err(GatewayError::Storage)
  }

  fn claim_clients(&self) {
    self.set_controller(Some(self.cache_name().to_string()));
  }

  /// Answer a fetch from a controlled page.
  pub async fn handle_fetch(&self, request: &Request) -> Result<FetchOutcome, GatewayError> {
    let request = request.resolve(&self.origin);

    let Some(store) = self.controller() else {
      return self.passthrough(&request, BypassReason::Uncontrolled).await;
    };

    let static_asset = match self.policy.decide(&request) {
      Interception::Bypass(reason) => return self.passthrough(&request, reason).await,
      Interception::CacheFirst { static_asset } => static_asset,
    };

    let cache = CacheLayer::new(Arc::clone(&self.storage), store);
    let result = cache
      .fetch_cache_first(&request, static_asset, || self.network.fetch(&request))
      .await;

    match result {
      Ok(found) => Ok(FetchOutcome {
        response: found.data,
        source: found.source.into(),
        cached_at: found.cached_at,
      }),
      Err(e) if request.accepts_html() => {
        warn!(url = %request.url, error = %e, "Serving offline page");
        Ok(FetchOutcome {
          response: offline::offline_response(&self.offline_page),
          source: ResponseSource::Offline,
          cached_at: None,
        })
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Fetch failed");
        Err(e)
      }
    }
  }

  async fn passthrough(
    &self,
    request: &Request,
    reason: BypassReason,
  ) -> Result<FetchOutcome, GatewayError> {
    debug!(url = %request.url, %reason, "Passing request through");

    let response = self.network.fetch(request).await?;
    Ok(FetchOutcome {
      response,
      source: ResponseSource::Passthrough,
      cached_at: None,
    })
  }
}

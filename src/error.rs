use thiserror::Error;

use crate::gateway::GatewayState;

#[derive(Error, Debug)]
pub enum GatewayError {
  /// A manifest asset could not be fetched or stored during install.
  #[error("Install failed: could not cache {url}: {reason}")]
  Install { url: String, reason: String },

  #[error("Fetch failed for {url}: {reason}")]
  Fetch { url: String, reason: String },

  #[error("Cache storage error: {0}")]
  Storage(color_eyre::Report),

  #[error("Cannot {operation} while gateway is {state}")]
  InvalidState {
    operation: &'static str,
    state: GatewayState,
  },
}

impl GatewayError {
  pub fn fetch(url: impl Into<String>, reason: impl ToString) -> Self {
    GatewayError::Fetch {
      url: url.into(),
      reason: reason.to_string(),
    }
  }
}

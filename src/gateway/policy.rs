//! Decides which requests the gateway intercepts.

use std::fmt;

use crate::config::GatewayConfig;
use crate::http::{Method, Request};

/// Why a request was passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BypassReason {
  /// No active version controls clients yet
  Uncontrolled,
  NotGet(Method),
  Scheme(String),
  Pattern(String),
  QueryString,
}

impl fmt::Display for BypassReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BypassReason::Uncontrolled => write!(f, "no active gateway"),
      BypassReason::NotGet(method) => write!(f, "{} request", method),
      BypassReason::Scheme(scheme) => write!(f, "scheme {}", scheme),
      BypassReason::Pattern(pattern) => write!(f, "matches {}", pattern),
      BypassReason::QueryString => write!(f, "has query string"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interception {
  Bypass(BypassReason),
  /// Serve cache-first; `static_asset` responses are cached on a miss
  CacheFirst { static_asset: bool },
}

/// Denylist and static-asset rules, fixed for the lifetime of a gateway.
#[derive(Debug, Clone)]
pub struct InterceptPolicy {
  schemes: Vec<String>,
  patterns: Vec<String>,
  bypass_query: bool,
  static_prefix: String,
}

impl InterceptPolicy {
  pub fn new(config: &GatewayConfig) -> Self {
    Self {
      schemes: config.denylist.schemes.clone(),
      patterns: config.denylist.patterns.clone(),
      bypass_query: config.denylist.bypass_query,
      static_prefix: config.static_prefix.clone(),
    }
  }

  pub fn decide(&self, request: &Request) -> Interception {
    if request.method != Method::Get {
      return Interception::Bypass(BypassReason::NotGet(request.method));
    }

    let url = request.url.as_str();

    if let Some(scheme) = self.schemes.iter().find(|s| url.starts_with(s.as_str())) {
      return Interception::Bypass(BypassReason::Scheme(scheme.clone()));
    }

    if let Some(pattern) = self.patterns.iter().find(|p| url.contains(p.as_str())) {
      return Interception::Bypass(BypassReason::Pattern(pattern.clone()));
    }

    // Also bypasses cache-busted static assets like custom.js?v=3
    if self.bypass_query && url.contains('?') {
      return Interception::Bypass(BypassReason::QueryString);
    }

    Interception::CacheFirst {
      static_asset: self.is_static(url),
    }
  }

  pub fn is_static(&self, url: &str) -> bool {
    url.contains(&self.static_prefix)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn policy() -> InterceptPolicy {
    InterceptPolicy::new(&GatewayConfig::default())
  }

  fn decide(url: &str) -> Interception {
    policy().decide(&Request::get(url))
  }

  #[test]
  fn test_non_get_bypassed() {
    let request = Request::new(Method::Post, "https://moldpark.test/static/js/custom.js");
    assert_eq!(
      policy().decide(&request),
      Interception::Bypass(BypassReason::NotGet(Method::Post))
    );
  }

  #[test]
  fn test_denylist() {
    assert!(matches!(
      decide("chrome-extension://abcdef/content.js"),
      Interception::Bypass(BypassReason::Scheme(_))
    ));
    assert!(matches!(
      decide("https://moldpark.test/.well-known/appspecific/com.chrome.devtools.json"),
      Interception::Bypass(BypassReason::Pattern(_))
    ));
    assert!(matches!(
      decide("https://moldpark.test/api/data"),
      Interception::Bypass(BypassReason::Pattern(_))
    ));
    assert!(matches!(
      decide("https://moldpark.test/django-admin/login/"),
      Interception::Bypass(BypassReason::Pattern(_))
    ));
  }

  #[test]
  fn test_query_string_bypassed() {
    assert_eq!(
      decide("https://moldpark.test/center/list/?page=2"),
      Interception::Bypass(BypassReason::QueryString)
    );
    assert_eq!(
      decide("https://moldpark.test/static/js/custom.js?v=3"),
      Interception::Bypass(BypassReason::QueryString)
    );
  }

  #[test]
  fn test_query_string_allowed_when_disabled() {
    let mut config = GatewayConfig::default();
    config.denylist.bypass_query = false;
    let policy = InterceptPolicy::new(&config);

    assert_eq!(
      policy.decide(&Request::get("https://moldpark.test/static/app.css?v=3")),
      Interception::CacheFirst { static_asset: true }
    );
  }

  #[test]
  fn test_static_and_dynamic_pages() {
    assert_eq!(
      decide("https://moldpark.test/static/images/moldpark_logo.jpg"),
      Interception::CacheFirst { static_asset: true }
    );
    assert_eq!(
      decide("https://moldpark.test/center/dashboard/"),
      Interception::CacheFirst {
        static_asset: false
      }
    );
  }
}

//! Handle on a single named cache store, with cache-first fetching.

use color_eyre::Result;
use futures::future::try_join_all;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::{check_cacheable, CacheResult, CachedResponse, SkipReason};
use crate::error::GatewayError;
use crate::http::{Request, Response};

/// Cache layer bound to one named store.
///
/// This layer sits between the gateway and the network, providing
/// cache-first lookups and fill-on-miss for the store it was opened on.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  name: String,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a layer on the named store. Only `add_all` creates the store.
  pub fn new(storage: Arc<S>, name: impl Into<String>) -> Self {
    Self {
      storage,
      name: name.into(),
    }
  }

  /// Look up a request in this store.
  pub fn match_request(&self, request: &Request) -> Result<Option<CachedResponse>> {
    self.storage.get_entry(&self.name, &request.cache_key())
  }

  /// Store a copy of a response under the request's key.
  ///
  /// Never recreates the store: returns false if it has been deleted.
  pub fn put(&self, request: &Request, response: &Response) -> Result<bool> {
    self
      .storage
      .put_existing(&self.name, &request.cache_key(), response)
  }

  /// Fetch every request and store all the responses.
  ///
  /// All requests are fetched concurrently. If any fetch fails or returns a
  /// non-2xx status, nothing is written and the failing URL is reported.
  pub async fn add_all<F, Fut>(
    &self,
    requests: Vec<Request>,
    fetcher: F,
  ) -> Result<(), GatewayError>
  where
    F: Fn(Request) -> Fut,
    Fut: Future<Output = Result<Response, GatewayError>>,
  {
    let fetches = requests.into_iter().map(|request| {
      let url = request.url.clone();
      let key = request.cache_key();
      let pending = fetcher(request);
      async move {
        let response = pending.await.map_err(|e| GatewayError::Install {
          url: url.clone(),
          reason: e.to_string(),
        })?;

        if !response.is_ok() {
          return Err(GatewayError::Install {
            url,
            reason: format!("HTTP {}", response.status),
          });
        }

        Ok((key, response))
      }
    });

    let entries = try_join_all(fetches).await?;

    self
      .storage
      .put_entries(&self.name, &entries)
      .map_err(|e| GatewayError::Install {
        url: self.name.clone(),
        reason: e.to_string(),
      })
  }

  /// Serve a request cache-first.
  ///
  /// 1. Check the store - if present, return it without touching the network
  /// 2. On a miss, fetch from network
  /// 3. If `store_on_miss`, write cacheable responses back to the store
  ///
  /// Storage failures never fail the request: a broken lookup counts as a
  /// miss and a broken write only skips caching.
  pub async fn fetch_cache_first<F, Fut>(
    &self,
    request: &Request,
    store_on_miss: bool,
    fetcher: F,
  ) -> Result<CacheResult<Response>, GatewayError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, GatewayError>>,
  {
    // Check cache first
    match self.match_request(request) {
      Ok(Some(cached)) => {
        debug!(url = %cached.url, cache = %self.name, "Serving from cache");
        return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
      }
      Ok(None) => {}
      Err(e) => {
        warn!(url = %request.url, error = %e, "Cache lookup failed, using network");
      }
    }

    let response = fetcher().await?;

    if store_on_miss {
      let written = check_cacheable(&response).and_then(|()| {
        match self.put(request, &response) {
          Ok(true) => Ok(()),
          Ok(false) => Err(SkipReason::StoreDeleted),
          Err(e) => Err(SkipReason::Storage(e.to_string())),
        }
      });

      match written {
        Ok(()) => debug!(url = %request.url, cache = %self.name, "Cached network response"),
        Err(reason @ SkipReason::Storage(_)) => {
          warn!(url = %request.url, %reason, "Response not cached")
        }
        Err(reason) => debug!(url = %request.url, %reason, "Response not cached"),
      }
    }

    Ok(CacheResult::from_network(response))
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      name: self.name.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::CacheSource;
  use crate::cache::MemoryStorage;
  use crate::http::ResponseType;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn layer() -> CacheLayer<MemoryStorage> {
    let storage = Arc::new(MemoryStorage::new());
    storage.open_store("moldpark-cache-v2").unwrap();
    CacheLayer::new(storage, "moldpark-cache-v2")
  }

  #[tokio::test]
  async fn test_miss_then_hit() {
    let cache = layer();
    let counter = AtomicUsize::new(0);
    let calls = &counter;
    let request = Request::get("https://moldpark.test/static/js/custom.js");

    let fetch = move || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      Ok(Response::new(200, "body"))
    };

    let first = cache.fetch_cache_first(&request, true, fetch).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);

    let second = cache.fetch_cache_first(&request, true, fetch).await.unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert!(second.cached_at.is_some());
    assert_eq!(second.data.body, b"body");
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_fill_does_not_recreate_deleted_store() {
    let storage = Arc::new(MemoryStorage::new());
    storage.open_store("moldpark-cache-v1").unwrap();
    let cache = CacheLayer::new(Arc::clone(&storage), "moldpark-cache-v1");
    let request = Request::get("https://moldpark.test/static/slow.js");

    let result = cache
      .fetch_cache_first(&request, true, || async {
        // Activation of a newer version lands mid-flight
        storage.delete_store("moldpark-cache-v1").unwrap();
        Ok(Response::new(200, "slow"))
      })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"slow");
    assert!(storage.store_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_store_on_miss_disabled() {
    let cache = layer();
    let request = Request::get("https://moldpark.test/about");

    cache
      .fetch_cache_first(&request, false, || async { Ok(Response::new(200, "page")) })
      .await
      .unwrap();

    assert!(cache.match_request(&request).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_ineligible_response_not_cached() {
    let cache = layer();
    let request = Request::get("https://moldpark.test/static/missing.css");

    let result = cache
      .fetch_cache_first(&request, true, || async { Ok(Response::new(404, "nope")) })
      .await
      .unwrap();
    assert_eq!(result.data.status, 404);
    assert!(cache.match_request(&request).unwrap().is_none());

    let cors = Request::get("https://cdn.test/static/lib.js");
    cache
      .fetch_cache_first(&cors, true, || async {
        Ok(Response::new(200, "lib").with_type(ResponseType::Cors))
      })
      .await
      .unwrap();
    assert!(cache.match_request(&cors).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_add_all_is_all_or_nothing() {
    let cache = layer();
    let requests = vec![
      Request::get("https://moldpark.test/"),
      Request::get("https://moldpark.test/static/favicon.ico"),
    ];

    let err = cache
      .add_all(requests.clone(), |request| async move {
        if request.url.ends_with("favicon.ico") {
          Ok(Response::new(404, ""))
        } else {
          Ok(Response::new(200, "home"))
        }
      })
      .await
      .unwrap_err();

    match err {
      GatewayError::Install { url, reason } => {
        assert_eq!(url, "https://moldpark.test/static/favicon.ico");
        assert_eq!(reason, "HTTP 404");
      }
      other => panic!("unexpected error: {other}"),
    }
    assert!(cache.match_request(&requests[0]).unwrap().is_none());

    cache
      .add_all(requests.clone(), |_| async { Ok(Response::new(200, "ok")) })
      .await
      .unwrap();
    for request in &requests {
      assert!(cache.match_request(request).unwrap().is_some());
    }
  }
}

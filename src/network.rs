//! The fetch primitive the gateway delegates to on a cache miss.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::error::GatewayError;
use crate::http::{Headers, Request, Response, ResponseType};

/// Something that can perform a network fetch.
pub trait Network: Send + Sync {
  /// Fetch a request. Resolves with any HTTP response, including error
  /// statuses; fails only when no response was received at all.
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response, GatewayError>> + Send;
}

/// Network access through reqwest, scoped to one origin.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  origin: Url,
}

impl HttpNetwork {
  pub fn new(config: &Config) -> Result<Self> {
    let mut builder = reqwest::Client::builder();
    if config.network.timeout_secs > 0 {
      builder = builder.timeout(Duration::from_secs(config.network.timeout_secs));
    }

    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      origin: config.origin_url()?,
    })
  }

  fn response_type(&self, url: &Url) -> ResponseType {
    if url.origin() == self.origin.origin() {
      ResponseType::Basic
    } else {
      ResponseType::Cors
    }
  }
}

impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, GatewayError> {
    let url = self
      .origin
      .join(&request.url)
      .map_err(|e| GatewayError::fetch(&request.url, e))?;

    if !matches!(url.scheme(), "http" | "https") {
      return Err(GatewayError::fetch(
        &request.url,
        format!("unsupported scheme {}", url.scheme()),
      ));
    }

    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
      .map_err(|e| GatewayError::fetch(&request.url, e))?;

    let mut builder = self.client.request(method, url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| GatewayError::fetch(&request.url, e))?;

    let status = response.status().as_u16();
    let response_type = self.response_type(response.url());
    let headers: Headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| GatewayError::fetch(&request.url, e))?;

    debug!(url = %url, status, %response_type, "Network fetch complete");

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
      response_type,
    })
  }
}

#[cfg(test)]
pub mod testing {
  //! Scripted network for gateway tests.

  use super::*;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  /// Network that answers from a fixed route table and counts calls.
  /// Unrouted URLs fail as if the host were unreachable.
  #[derive(Default)]
  pub struct MockNetwork {
    routes: Mutex<HashMap<String, Response>>,
    calls: AtomicUsize,
    requested: Mutex<Vec<String>>,
  }

  impl MockNetwork {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn route(self, url: &str, response: Response) -> Self {
      self.set_route(url, response);
      self
    }

    pub fn set_route(&self, url: &str, response: Response) {
      self
        .routes
        .lock()
        .unwrap()
        .insert(url.to_string(), response);
    }

    /// Drop every route, simulating loss of connectivity.
    pub fn go_offline(&self) {
      self.routes.lock().unwrap().clear();
    }

    pub fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }

    pub fn requested(&self) -> Vec<String> {
      self.requested.lock().unwrap().clone()
    }
  }

  /// Serve a single canned reply on a local port.
  ///
  /// Returns the base URL and a handle resolving to the raw request head.
  pub async fn serve_once(reply: String) -> (Url, tokio::task::JoinHandle<String>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut head = Vec::new();
      let mut buf = [0u8; 1024];
      while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
          break;
        }
        head.extend_from_slice(&buf[..n]);
      }
      socket.write_all(reply.as_bytes()).await.unwrap();
      socket.shutdown().await.unwrap();
      String::from_utf8_lossy(&head).to_ascii_lowercase()
    });

    (Url::parse(&format!("http://{}", addr)).unwrap(), handle)
  }

  pub fn http_reply(status: &str, content_type: &str, body: &str) -> String {
    format!(
      "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
      status,
      content_type,
      body.len(),
      body
    )
  }

  /// Client that ignores proxy settings from the environment.
  pub fn direct_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
  }

  impl Network for MockNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, GatewayError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      self.requested.lock().unwrap().push(request.url.clone());

      let routed = self.routes.lock().unwrap().get(&request.url).cloned();
      routed.ok_or_else(|| GatewayError::fetch(&request.url, "network unreachable"))
    }
  }
}

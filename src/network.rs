//! Network seam: the trait the pipeline fetches through, and its reqwest implementation.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::time::Duration;
use url::Url;

use crate::cache::ResponseSnapshot;

/// How a request is allowed to cross origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
  /// Target must be on the local origin (rewritten requests, manifest assets)
  SameOrigin,
  /// Relaxed cross-origin request, announced with an `Origin` header
  Cors,
}

/// A request as issued to the network.
#[derive(Debug, Clone)]
pub struct FetchRequest {
  pub url: Url,
  pub method: String,
  pub mode: FetchMode,
}

impl FetchRequest {
  pub fn get(url: Url, mode: FetchMode) -> Self {
    Self {
      url,
      method: "GET".to_string(),
      mode,
    }
  }
}

/// Anything that can turn a request into a response.
///
/// `Err` means the request never produced a response (offline, DNS, refused,
/// timeout). Non-2xx responses are `Ok`.
pub trait Network: Send + Sync + 'static {
  fn fetch(&self, request: FetchRequest) -> impl Future<Output = Result<ResponseSnapshot>> + Send;
}

/// Network access over HTTP(S).
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  origin: Url,
}

impl HttpNetwork {
  pub fn new(origin: Url, timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, origin })
  }
}

impl Network for HttpNetwork {
  async fn fetch(&self, request: FetchRequest) -> Result<ResponseSnapshot> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let mut builder = self.client.request(method, request.url.clone());
    match request.mode {
      FetchMode::SameOrigin => {
        if request.url.origin() != self.origin.origin() {
          return Err(eyre!(
            "Refusing same-origin fetch of {} from {}",
            request.url,
            self.origin.origin().ascii_serialization()
          ));
        }
      }
      FetchMode::Cors => {
        builder = builder.header(
          reqwest::header::ORIGIN,
          self.origin.origin().ascii_serialization(),
        );
      }
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    // Redirects are followed, so the final hop has to be checked too
    if request.mode == FetchMode::SameOrigin && response.url().origin() != self.origin.origin() {
      return Err(eyre!(
        "Same-origin fetch of {} was redirected to {}",
        request.url,
        response.url()
      ));
    }

    let status = response.status();
    let headers = response
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
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(ResponseSnapshot {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      headers,
      body: body.to_vec(),
    })
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  /// Answer a single connection with a canned HTTP response.
  async fn serve_once(response: String) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut buf = [0u8; 4096];
      let _ = socket.read(&mut buf).await;
      socket.write_all(response.as_bytes()).await.unwrap();
      let _ = socket.shutdown().await;
    });

    Url::parse(&format!("http://{}/", addr)).unwrap()
  }

  /// A local origin that redirects every request to another origin.
  async fn redirecting_origin() -> Url {
    let foreign = serve_once(
      "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nhi".to_string(),
    )
    .await;
    serve_once(format!(
      "HTTP/1.1 302 Found\r\nLocation: {}lib.js\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
      foreign
    ))
    .await
  }

  #[tokio::test]
  async fn test_same_origin_fetch_rejects_redirect_off_origin() {
    let origin = redirecting_origin().await;
    let network = HttpNetwork::new(origin.clone(), Duration::from_secs(5)).unwrap();

    let request = FetchRequest::get(origin.join("/app.js").unwrap(), FetchMode::SameOrigin);
    let err = network.fetch(request).await.unwrap_err();
    assert!(err.to_string().contains("redirected"), "{}", err);
  }

  #[tokio::test]
  async fn test_cors_fetch_follows_redirect_off_origin() {
    let origin = redirecting_origin().await;
    let network = HttpNetwork::new(
      Url::parse("http://localhost:8080").unwrap(),
      Duration::from_secs(5),
    )
    .unwrap();

    let request = FetchRequest::get(origin.join("/app.js").unwrap(), FetchMode::Cors);
    let response = network.fetch(request).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"hi");
  }

  #[tokio::test]
  async fn test_same_origin_fetch_rejects_foreign_target() {
    let network = HttpNetwork::new(
      Url::parse("http://127.0.0.1:1").unwrap(),
      Duration::from_secs(1),
    )
    .unwrap();

    let request = FetchRequest::get(
      Url::parse("https://cdn.example.com/lib.js").unwrap(),
      FetchMode::SameOrigin,
    );
    let err = network.fetch(request).await.unwrap_err();
    assert!(err.to_string().contains("same-origin"));
  }

  #[tokio::test]
  async fn test_unreachable_origin_is_an_error() {
    let network = HttpNetwork::new(
      Url::parse("http://127.0.0.1:1").unwrap(),
      Duration::from_secs(1),
    )
    .unwrap();

    let request = FetchRequest::get(
      Url::parse("http://127.0.0.1:1/index.html").unwrap(),
      FetchMode::SameOrigin,
    );
    assert!(network.fetch(request).await.is_err());
  }
}

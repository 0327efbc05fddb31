//! Core types shared by the store, the pipeline and the lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Captured response, as stored in a generation and handed back to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl ResponseSnapshot {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      status_text: String::new(),
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// 2xx, the only responses worth storing.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Response synthesized when neither cache nor network can answer.
  pub fn offline() -> Self {
    Self {
      status: OFFLINE_STATUS,
      status_text: "Offline".to_string(),
      headers: vec![(
        "content-type".to_string(),
        "text/plain; charset=utf-8".to_string(),
      )],
      body: OFFLINE_MESSAGE.as_bytes().to_vec(),
    }
  }
}

pub const OFFLINE_STATUS: u16 = 503;
pub const OFFLINE_MESSAGE: &str =
  "The application is offline and this resource has not been cached yet.";

/// A stored response together with its storage metadata.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: ResponseSnapshot,
  pub cached_at: DateTime<Utc>,
}

/// Summary of one generation in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationInfo {
  pub name: String,
  pub entries: usize,
  pub created_at: DateTime<Utc>,
}

/// Per-request context. Lives only for the duration of one intercepted call.
#[derive(Debug, Clone)]
pub struct RequestContext {
  pub url: Url,
  pub method: String,
  /// Identifier of the client (page/session) that issued the request
  pub client: Option<String>,
  /// Set once the redirect step has run
  pub rewritten: bool,
}

impl RequestContext {
  pub fn get(url: Url) -> Self {
    Self {
      url,
      method: "GET".to_string(),
      client: None,
      rewritten: false,
    }
  }

  pub fn with_method(mut self, method: impl Into<String>) -> Self {
    self.method = method.into().to_uppercase();
    self
  }

  pub fn with_client(mut self, client: impl Into<String>) -> Self {
    self.client = Some(client.into());
    self
  }

  pub fn is_get(&self) -> bool {
    self.method.eq_ignore_ascii_case("GET")
  }
}

/// Where a response came from. These are the observable outcomes of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Served from the active generation, no network access
  Cache,
  /// Served from the network; `stored` is false when write-back was skipped or failed
  Network { stored: bool },
  /// Bypass-listed endpoint, forwarded without touching the cache
  Bypass,
  /// Network failed and nothing was cached: synthesized 503
  Offline,
}

impl CacheSource {
  pub fn label(&self) -> &'static str {
    match self {
      Self::Cache => "cache",
      Self::Network { .. } => "network",
      Self::Bypass => "bypass",
      Self::Offline => "offline",
    }
  }
}

/// Result of dispatching one request.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: ResponseSnapshot,
  pub source: CacheSource,
  /// Key the request was looked up under, if the cache was consulted
  pub key: Option<String>,
}

impl Served {
  pub fn from_cache(response: ResponseSnapshot, key: String) -> Self {
    Self {
      response,
      source: CacheSource::Cache,
      key: Some(key),
    }
  }

  pub fn from_network(response: ResponseSnapshot, key: Option<String>, stored: bool) -> Self {
    Self {
      response,
      source: CacheSource::Network { stored },
      key,
    }
  }

  pub fn bypassed(response: ResponseSnapshot) -> Self {
    Self {
      response,
      source: CacheSource::Bypass,
      key: None,
    }
  }

  pub fn offline(key: Option<String>) -> Self {
    Self {
      response: ResponseSnapshot::offline(),
      source: CacheSource::Offline,
      key,
    }
  }
}

//! Per-request interception: rewrite, key, cache lookup, network fallback,
//! write-back, offline synthesis.
//!
//! Only the bypass path can return `Err`. Every other failure ends in a
//! response, from the network or synthesized.

use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::cache::{cache_key, CacheStore, RequestContext, ResponseSnapshot, Served};
use crate::network::{FetchMode, FetchRequest, Network};
use crate::registry::ClientRegistry;
use crate::rewrite::{Rewrite, Rewriter};

/// The interception pipeline. Cheap to share behind an `Arc`; holds no
/// per-request state.
pub struct Pipeline<S: CacheStore, N: Network> {
  store: Arc<S>,
  network: Arc<N>,
  rewriter: Rewriter,
  /// Full-URL substrings that are never cached
  bypass: Vec<String>,
  /// Generation reads and writes go through; `None` before the first activation
  active: watch::Receiver<Option<String>>,
  clients: ClientRegistry,
}

impl<S: CacheStore, N: Network> Pipeline<S, N> {
  pub fn new(
    store: Arc<S>,
    network: Arc<N>,
    rewriter: Rewriter,
    bypass_paths: &[String],
    active: watch::Receiver<Option<String>>,
  ) -> Self {
    let origin = rewriter.origin().origin().ascii_serialization();
    let bypass = bypass_paths
      .iter()
      .map(|path| format!("{}{}", origin, path))
      .collect();

    Self {
      store,
      network,
      rewriter,
      bypass,
      active,
      clients: ClientRegistry::new(),
    }
  }

  pub fn clients(&self) -> &ClientRegistry {
    &self.clients
  }

  pub fn rewriter(&self) -> &Rewriter {
    &self.rewriter
  }

  /// Generation currently serving traffic.
  pub fn active_generation(&self) -> Option<String> {
    self.active.borrow().clone()
  }

  pub fn is_bypassed(&self, url: &str) -> bool {
    self.bypass.iter().any(|b| url.contains(b.as_str()))
  }

  /// Register a client under whichever generation is active right now.
  pub fn register_client(&self, id: &str) -> Result<()> {
    self.clients.register(id, self.active_generation())
  }

  pub fn release_client(&self, id: &str) -> Result<bool> {
    self.clients.release(id)
  }

  /// Register `id` on its first request.
  fn track_client(&self, id: &str) -> Result<()> {
    if self.clients.get(id)?.is_none() {
      self.register_client(id)?;
    }
    Ok(())
  }

  /// Effective target of a request, falling back to the original URL if the
  /// rewritten one can't be built.
  pub fn rewrite(&self, ctx: &RequestContext) -> Rewrite {
    self.rewriter.rewrite(&ctx.url).unwrap_or_else(|e| {
      warn!(url = %ctx.url, "rewrite failed, using original URL: {}", e);
      Rewrite {
        target: ctx.url.clone(),
        rewritten: false,
      }
    })
  }

  /// Serve one intercepted request.
  pub async fn handle(&self, mut ctx: RequestContext) -> Result<Served> {
    if let Some(client) = ctx.client.as_deref() {
      if let Err(e) = self.track_client(client) {
        warn!(%client, "could not track client: {}", e);
      }
    }

    if self.is_bypassed(ctx.url.as_str()) {
      debug!(url = %ctx.url, "bypassing cache");
      let request = FetchRequest {
        url: ctx.url.clone(),
        method: ctx.method.clone(),
        mode: FetchMode::Cors,
      };
      let response = self.network.fetch(request).await?;
      return Ok(Served::bypassed(response));
    }

    let Rewrite { target, rewritten } = self.rewrite(&ctx);
    ctx.rewritten = rewritten;
    if rewritten {
      debug!(from = %ctx.url, to = %target, "redirected");
    }

    let key = cache_key(&target, self.rewriter.origin());
    // Read once: a cutover mid-request at worst serves this request from the old generation
    let generation = self.active_generation();

    if ctx.is_get() {
      if let Some(generation) = generation.as_deref() {
        match self.store.get(generation, &key) {
          Ok(Some(entry)) => {
            debug!(%key, generation, cached_at = %entry.cached_at, "cache hit");
            return Ok(Served::from_cache(entry.response, key));
          }
          Ok(None) => debug!(%key, generation, "cache miss"),
          Err(e) => warn!(%key, generation, "cache read failed, going to network: {}", e),
        }
      }
    }

    let mode = if ctx.rewritten {
      FetchMode::SameOrigin
    } else {
      FetchMode::Cors
    };
    let request = FetchRequest {
      url: target,
      method: ctx.method.clone(),
      mode,
    };

    let response = match self.network.fetch(request).await {
      Ok(response) => response,
      Err(e) => {
        error!(url = %ctx.url, "network failed and nothing cached: {}", e);
        return Ok(Served::offline(Some(key)));
      }
    };

    let stored = match generation.as_deref() {
      Some(generation) if ctx.is_get() && response.is_success() => {
        self.write_back(generation, &key, &response)
      }
      _ => false,
    };

    Ok(Served::from_network(response, Some(key), stored))
  }

  /// Store a copy of a network response. Failure is logged, never returned.
  fn write_back(&self, generation: &str, key: &str, response: &ResponseSnapshot) -> bool {
    match self.store.put(generation, key, response) {
      Ok(()) => true,
      Err(e) => {
        warn!(%key, generation, "write-back failed: {}", e);
        false
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStore, ROOT_KEY};
  use crate::manifest::Manifest;
  use crate::network::testing::StubNetwork;
  use url::Url;

  const GEN: &str = "pwa-offline-cache-v1";

  struct Harness {
    store: Arc<MemoryStore>,
    network: Arc<StubNetwork>,
    pipeline: Pipeline<MemoryStore, StubNetwork>,
    active: watch::Sender<Option<String>>,
  }

  fn harness(network: StubNetwork) -> Harness {
    let store = Arc::new(MemoryStore::new());
    store.open_generation(GEN).unwrap();
    let network = Arc::new(network);
    let manifest = Manifest::builtin();
    let rewriter = Rewriter::from_pairs(
      Url::parse("http://localhost:8080").unwrap(),
      &manifest.redirects,
    );
    let (tx, rx) = watch::channel(Some(GEN.to_string()));
    let pipeline = Pipeline::new(
      Arc::clone(&store),
      Arc::clone(&network),
      rewriter,
      &manifest.bypass,
      rx,
    );

    Harness {
      store,
      network,
      pipeline,
      active: tx,
    }
  }

  fn get(url: &str) -> RequestContext {
    RequestContext::get(Url::parse(url).unwrap())
  }

  #[tokio::test]
  async fn test_second_request_is_served_from_cache() {
    let h = harness(StubNetwork::new().route("http://localhost:8080/app.js", "B"));

    let first = h.pipeline.handle(get("http://localhost:8080/app.js")).await.unwrap();
    assert_eq!(first.source, CacheSource::Network { stored: true });

    h.network.set_offline(true);
    let second = h.pipeline.handle(get("http://localhost:8080/app.js")).await.unwrap();

    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.response.body, b"B");
    assert_eq!(h.network.call_count(), 1);
  }

  #[tokio::test]
  async fn test_offline_miss_synthesizes_unavailable() {
    let h = harness(StubNetwork::new());
    h.network.set_offline(true);

    let served = h.pipeline.handle(get("http://localhost:8080/never.js")).await.unwrap();

    assert_eq!(served.source, CacheSource::Offline);
    assert_eq!(served.response.status, 503);
    assert!(!served.response.body.is_empty());
  }

  #[tokio::test]
  async fn test_bypass_is_never_cached() {
    let h = harness(StubNetwork::new().route("http://localhost:8080/version", "v2.6.6"));

    for _ in 0..3 {
      let served = h.pipeline.handle(get("http://localhost:8080/version")).await.unwrap();
      assert_eq!(served.source, CacheSource::Bypass);
      assert_eq!(served.response.body, b"v2.6.6");
    }

    assert_eq!(h.network.call_count(), 3);
    assert_eq!(h.store.generations().unwrap()[0].entries, 0);
    assert!(h
      .store
      .get(GEN, "http://localhost:8080/version")
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_bypass_failure_propagates() {
    let h = harness(StubNetwork::new());
    h.network.set_offline(true);

    assert!(h.pipeline.handle(get("http://localhost:8080/version")).await.is_err());
  }

  #[tokio::test]
  async fn test_rewritten_request_is_same_origin_and_keyed_locally() {
    let local = "http://localhost:8080/vendor/pyodide/pyodide/pyodide.js";
    let h = harness(StubNetwork::new().route(local, "runtime"));

    let served = h
      .pipeline
      .handle(get("https://cdn.jsdelivr.net/pyodide/v0.23.4/full/pyodide.js"))
      .await
      .unwrap();

    assert_eq!(served.key.as_deref(), Some(local));
    let calls = h.network.calls();
    assert_eq!(calls[0].url.as_str(), local);
    assert_eq!(calls[0].mode, FetchMode::SameOrigin);

    // The bundled copy requested directly hits the same entry
    h.network.set_offline(true);
    let direct = h.pipeline.handle(get(local)).await.unwrap();
    assert_eq!(direct.source, CacheSource::Cache);
  }

  #[tokio::test]
  async fn test_unrewritten_request_uses_cors() {
    let h = harness(StubNetwork::new().route("https://example.com/data.json", "{}"));

    h.pipeline.handle(get("https://example.com/data.json")).await.unwrap();

    assert_eq!(h.network.calls()[0].mode, FetchMode::Cors);
  }

  #[tokio::test]
  async fn test_entry_document_query_variants_share_one_entry() {
    let h = harness(StubNetwork::new().route("http://localhost:8080/?x=1", "shell"));

    let first = h.pipeline.handle(get("http://localhost:8080/?x=1")).await.unwrap();
    assert_eq!(first.key.as_deref(), Some(ROOT_KEY));

    h.network.set_offline(true);
    for url in ["http://localhost:8080/?x=2", "http://localhost:8080/", "http://localhost:8080/index.html"] {
      let served = h.pipeline.handle(get(url)).await.unwrap();
      assert_eq!(served.source, CacheSource::Cache, "{}", url);
      assert_eq!(served.response.body, b"shell");
    }
  }

  #[tokio::test]
  async fn test_error_status_is_returned_but_not_stored() {
    let h = harness(StubNetwork::new().respond(
      "http://localhost:8080/gone.js",
      ResponseSnapshot::new(404, "nope"),
    ));

    let served = h.pipeline.handle(get("http://localhost:8080/gone.js")).await.unwrap();

    assert_eq!(served.response.status, 404);
    assert_eq!(served.source, CacheSource::Network { stored: false });
    assert_eq!(h.store.generations().unwrap()[0].entries, 0);
  }

  #[tokio::test]
  async fn test_non_get_skips_cache() {
    let h = harness(StubNetwork::new().route("http://localhost:8080/compile", "ok"));
    let post = || get("http://localhost:8080/compile").with_method("POST");

    let served = h.pipeline.handle(post()).await.unwrap();
    assert_eq!(served.source, CacheSource::Network { stored: false });

    h.network.set_offline(true);
    let offline = h.pipeline.handle(post()).await.unwrap();
    assert_eq!(offline.source, CacheSource::Offline);
  }

  #[tokio::test]
  async fn test_write_back_failure_still_returns_response() {
    let h = harness(StubNetwork::new().route("http://localhost:8080/app.js", "B"));
    h.store.delete_generation(GEN).unwrap();

    let served = h.pipeline.handle(get("http://localhost:8080/app.js")).await.unwrap();

    assert_eq!(served.response.body, b"B");
    assert_eq!(served.source, CacheSource::Network { stored: false });
  }

  #[tokio::test]
  async fn test_noactive_generation_goes_to_network() {
    let h = harness(StubNetwork::new().route("http://localhost:8080/app.js", "B"));
    h.active.send_replace(None);

    let served = h.pipeline.handle(get("http://localhost:8080/app.js")).await.unwrap();

    assert_eq!(served.source, CacheSource::Network { stored: false });
    assert_eq!(h.store.generations().unwrap()[0].entries, 0);
  }

  #[tokio::test]
  async fn test_first_request_registers_client() {
    let h = harness(StubNetwork::new().route("http://localhost:8080/app.js", "B"));

    h.pipeline
      .handle(get("http://localhost:8080/app.js").with_client("tab-1"))
      .await
      .unwrap();

    let entry = h.pipeline.clients().get("tab-1").unwrap().unwrap();
    assert_eq!(entry.controller.as_deref(), Some(GEN));
  }

  #[tokio::test]
  async fn test_broken_client_registry_does_not_fail_request() {
    let h = harness(StubNetwork::new().route("http://localhost:8080/app.js", "B"));
    h.pipeline.clients().poison();

    let served = h
      .pipeline
      .handle(get("http://localhost:8080/app.js").with_client("tab-1"))
      .await
      .unwrap();

    assert_eq!(served.response.body, b"B");
    assert_eq!(served.source, CacheSource::Network { stored: true });
  }

  #[tokio::test]
  async fn test_foreign_site_root_does_not_get_app_shell() {
    let h = harness(StubNetwork::new().route("https://pypi.org/?q=x", "search"));
    h.store
      .put(GEN, ROOT_KEY, &ResponseSnapshot::new(200, "shell"))
      .unwrap();

    let served = h.pipeline.handle(get("https://pypi.org/?q=x")).await.unwrap();

    assert_eq!(served.response.body, b"search");
    assert_eq!(served.key.as_deref(), Some("https://pypi.org/?q=x"));
  }
}

//! Background population of the deferred manifest.
//!
//! Runs after activation and never blocks it. A request for an asset that
//! hasn't been prefetched yet just takes the normal miss path and gets cached
//! on first use.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

use crate::cache::CacheStore;
use crate::generation::fetch_asset;
use crate::network::Network;

/// What a prefetch run managed to store.
#[derive(Debug, Clone, Default)]
pub struct PrefetchReport {
  pub stored: usize,
  /// Paths that failed, with the reason
  pub failed: Vec<(String, String)>,
}

/// Populates a generation with deferred assets, best effort.
pub struct PrefetchScheduler<S: CacheStore, N: Network> {
  store: Arc<S>,
  network: Arc<N>,
  origin: Url,
  concurrency: usize,
}

impl<S: CacheStore + 'static, N: Network> PrefetchScheduler<S, N> {
  pub fn new(store: Arc<S>, network: Arc<N>, origin: Url, concurrency: usize) -> Self {
    Self {
      store,
      network,
      origin,
      concurrency: concurrency.max(1),
    }
  }

  /// Start populating `generation` in the background.
  pub fn spawn(&self, generation: String, assets: Vec<String>) -> JoinHandle<PrefetchReport> {
    let scheduler = Self {
      store: Arc::clone(&self.store),
      network: Arc::clone(&self.network),
      origin: self.origin.clone(),
      concurrency: self.concurrency,
    };

    tokio::spawn(async move { scheduler.populate(&generation, &assets).await })
  }

  /// Fetch and store every asset; individual failures don't stop the batch.
  pub async fn populate(&self, generation: &str, assets: &[String]) -> PrefetchReport {
    info!(generation, assets = assets.len(), "prefetching deferred assets");

    let results: Vec<_> = stream::iter(assets.iter().cloned())
      .map(|path: String| async move {
        let result = fetch_asset(self.network.as_ref(), &self.origin, &path)
          .await
          .and_then(|(key, response)| self.store.put(generation, &key, &response));
        (path, result)
      })
      .buffer_unordered(self.concurrency)
      .collect()
      .await;

    let mut report = PrefetchReport::default();
    for (path, result) in results {
      match result {
        Ok(()) => report.stored += 1,
        Err(e) => {
          warn!(generation, path = %path, "prefetch failed: {}", e);
          report.failed.push((path, e.to_string()));
        }
      }
    }

    info!(
      generation,
      stored = report.stored,
      failed = report.failed.len(),
      "prefetch finished"
    );
    report
  }
}

//! Generation lifecycle: install a versioned store, promote it, delete the rest.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{cache_key, CacheStore, ResponseSnapshot};
use crate::manifest::generation_name;
use crate::network::{FetchMode, FetchRequest, Network};

/// Outcome of removing stale generations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cleanup {
  pub deleted: Vec<String>,
  /// Generations that could not be deleted; they are orphaned, never served
  pub failed: Vec<String>,
}

/// Owns creation, promotion and deletion of generations.
pub struct GenerationManager<S: CacheStore, N: Network> {
  store: Arc<S>,
  network: Arc<N>,
  origin: Url,
}

impl<S: CacheStore, N: Network> GenerationManager<S, N> {
  pub fn new(store: Arc<S>, network: Arc<N>, origin: Url) -> Self {
    Self {
      store,
      network,
      origin,
    }
  }

  /// Create the store for `version` and populate it with every minimal asset.
  ///
  /// All assets are fetched before anything is written, so a failed install
  /// leaves no trace and the previous generation keeps serving.
  pub async fn install(&self, version: &str, minimal: &[String]) -> Result<String> {
    let name = generation_name(version);
    info!(generation = %name, assets = minimal.len(), "installing");

    let fetches = minimal
      .iter()
      .map(|path| fetch_asset(self.network.as_ref(), &self.origin, path));

    let entries = try_join_all(fetches).await.map_err(|e| {
      error!(generation = %name, "install failed: {}", e);
      eyre!("Install of {} failed: {}", name, e)
    })?;

    self.store.open_generation(&name)?;
    if let Err(e) = self.store.put_all(&name, &entries) {
      error!(generation = %name, "install failed while storing: {}", e);
      if let Err(cleanup) = self.store.delete_generation(&name) {
        warn!(generation = %name, "could not remove partial generation: {}", cleanup);
      }
      return Err(e);
    }

    info!(generation = %name, "installed, ready to activate");
    Ok(name)
  }

  /// Record `version`'s store as the one all reads and writes go through.
  pub fn promote(&self, version: &str) -> Result<String> {
    let name = generation_name(version);

    if !self.store.has_generation(&name)? {
      return Err(eyre!("Generation {} is not installed", name));
    }

    self.store.set_active_generation(&name)?;
    Ok(name)
  }

  /// Delete every generation whose name is not `keep`. Best effort: failures
  /// are logged and reported, never returned as errors.
  pub fn delete_stale(&self, keep: &str) -> Cleanup {
    let mut cleanup = Cleanup::default();

    let generations = match self.store.generations() {
      Ok(generations) => generations,
      Err(e) => {
        warn!("Could not list generations, skipping cleanup: {}", e);
        return cleanup;
      }
    };

    for generation in generations.into_iter().filter(|g| g.name != keep) {
      match self.store.delete_generation(&generation.name) {
        Ok(_) => {
          info!(generation = %generation.name, "deleted stale generation");
          cleanup.deleted.push(generation.name);
        }
        Err(e) => {
          warn!(generation = %generation.name, "failed to delete stale generation: {}", e);
          cleanup.failed.push(generation.name);
        }
      }
    }

    cleanup
  }
}

/// Fetch one manifest path from the local origin as a storable entry.
///
/// Non-2xx counts as failure: a manifest asset that isn't there is a broken build.
pub async fn fetch_asset<N: Network>(
  network: &N,
  origin: &Url,
  path: &str,
) -> Result<(String, ResponseSnapshot)> {
  let url = origin
    .join(path)
    .map_err(|e| eyre!("Invalid asset path {}: {}", path, e))?;
  let key = cache_key(&url, origin);

  debug!(%url, "fetching asset");
  let response = network
    .fetch(FetchRequest::get(url.clone(), FetchMode::SameOrigin))
    .await?;

  if !response.is_success() {
    return Err(eyre!("{} answered {}", url, response.status));
  }

  Ok((key, response))
}

//! Explicit lifecycle state machine for one build's generation.
//!
//! `Installing → Active → Superseded`. Requests are dispatched through the
//! pipeline in every phase; while this build is still installing they are
//! served by whatever generation was active before it.

use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheStore, RequestContext, Served};
use crate::generation::{Cleanup, GenerationManager};
use crate::manifest::Manifest;
use crate::network::Network;
use crate::pipeline::Pipeline;
use crate::prefetch::{PrefetchReport, PrefetchScheduler};
use crate::rewrite::Rewriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  /// Being populated, or populated and waiting for the old generation's clients
  Installing,
  /// Serving all reads and writes
  Active,
  /// A newer build activated after this one
  Superseded,
}

struct State {
  phase: Phase,
  /// Install finished; eligible for activation
  ready: bool,
  prefetch: Option<JoinHandle<PrefetchReport>>,
}

/// Drives one build's generation from install to cutover and routes requests.
pub struct Lifecycle<S: CacheStore + 'static, N: Network> {
  manifest: Manifest,
  store: Arc<S>,
  generations: GenerationManager<S, N>,
  prefetch: PrefetchScheduler<S, N>,
  pipeline: Arc<Pipeline<S, N>>,
  active: watch::Sender<Option<String>>,
  state: Mutex<State>,
  force: AtomicBool,
}

impl<S: CacheStore + 'static, N: Network> Lifecycle<S, N> {
  /// Build the lifecycle, routing to whatever generation the store says was
  /// active last.
  pub fn new(
    store: Arc<S>,
    network: Arc<N>,
    origin: Url,
    manifest: Manifest,
    prefetch_concurrency: usize,
  ) -> Result<Self> {
    let previous = store.active_generation()?;
    if let Some(previous) = previous.as_deref() {
      info!(generation = previous, "resuming with previously active generation");
    }

    let (active, routing) = watch::channel(previous);
    let rewriter = Rewriter::from_pairs(origin.clone(), &manifest.redirects);
    let pipeline = Pipeline::new(
      Arc::clone(&store),
      Arc::clone(&network),
      rewriter,
      &manifest.bypass,
      routing,
    );

    Ok(Self {
      generations: GenerationManager::new(
        Arc::clone(&store),
        Arc::clone(&network),
        origin.clone(),
      ),
      prefetch: PrefetchScheduler::new(
        Arc::clone(&store),
        network,
        origin,
        prefetch_concurrency,
      ),
      pipeline: Arc::new(pipeline),
      manifest,
      store,
      active,
      state: Mutex::new(State {
        phase: Phase::Installing,
        ready: false,
        prefetch: None,
      }),
      force: AtomicBool::new(false),
    })
  }

  pub fn pipeline(&self) -> Arc<Pipeline<S, N>> {
    Arc::clone(&self.pipeline)
  }

  pub fn generation_name(&self) -> String {
    self.manifest.generation_name()
  }

  pub fn phase(&self) -> Result<Phase> {
    let state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(state.phase)
  }

  /// Populate this build's generation with the minimal manifest.
  ///
  /// On failure nothing changes: the previous generation keeps serving.
  pub async fn install(&self) -> Result<()> {
    self
      .generations
      .install(&self.manifest.version, &self.manifest.minimal)
      .await?;

    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    state.ready = true;

    Ok(())
  }

  /// Install in the background, then try to activate right away.
  ///
  /// Requests keep flowing through the pipeline meanwhile; later
  /// [`Self::check`] calls finish the cutover if the grace period holds it up.
  pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
    let lifecycle = Arc::clone(self);

    tokio::spawn(async move {
      if let Err(e) = lifecycle.install().await {
        warn!("continuing on the previous generation: {}", e);
        return;
      }
      if let Err(e) = lifecycle.check() {
        warn!("lifecycle check failed: {}", e);
      }
    })
  }

  /// Skip the grace period. Idempotent; takes effect on the next [`Self::check`].
  pub fn force_activate(&self) {
    if !self.force.swap(true, Ordering::SeqCst) {
      info!(generation = %self.generation_name(), "force activation requested");
    }
  }

  /// Advance the state machine if it can move. Returns the new phase.
  pub fn check(&self) -> Result<Phase> {
    let (phase, ready) = {
      let state = self
        .state
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      (state.phase, state.ready)
    };

    match phase {
      Phase::Installing if ready && self.grace_period_over()? => {
        self.activate()?;
      }
      Phase::Active => self.detect_supersession()?,
      _ => {}
    }

    self.phase()
  }

  /// Whether nothing holds the old generation any more (or a force signal arrived).
  fn grace_period_over(&self) -> Result<bool> {
    let ours = self.generation_name();
    let current = self.active.borrow().clone();

    // First install, or reinstall of the running build: nobody to wait for
    if current.is_none() || current.as_deref() == Some(ours.as_str()) {
      return Ok(true);
    }

    if self.force.load(Ordering::SeqCst) {
      return Ok(true);
    }

    let waiting = self.pipeline.clients().held_elsewhere(&ours)?;
    if waiting > 0 {
      info!(clients = waiting, "waiting for clients of the previous generation");
    }
    Ok(waiting == 0)
  }

  /// Cut over to this build's generation.
  ///
  /// Routing switches before stale generations are deleted, so nothing is ever
  /// read from a generation that is being removed. Activating an already
  /// active generation repeats the cleanup and does nothing else.
  pub fn activate(&self) -> Result<Cleanup> {
    let name = self.generations.promote(&self.manifest.version)?;
    self.active.send_replace(Some(name.clone()));

    let cleanup = self.generations.delete_stale(&name);
    let claimed = self.pipeline.clients().claim(&name)?;

    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if state.phase != Phase::Active {
      info!(generation = %name, claimed, deleted = cleanup.deleted.len(), "activated");
      state.phase = Phase::Active;
      state.ready = true;
      state.prefetch = Some(
        self
          .prefetch
          .spawn(name, self.manifest.deferred.clone()),
      );
    }

    Ok(cleanup)
  }

  /// A later build took over the store: follow it and stand down.
  fn detect_supersession(&self) -> Result<()> {
    let ours = self.generation_name();
    let persisted = self.store.active_generation()?;

    if let Some(newer) = persisted.filter(|name| *name != ours) {
      warn!(generation = %ours, newer = %newer, "superseded by a newer generation");
      self.active.send_replace(Some(newer));

      let mut state = self
        .state
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      state.phase = Phase::Superseded;
    }

    Ok(())
  }

  /// Wait for the background prefetch started at activation, if any.
  pub async fn finish_prefetch(&self) -> Option<PrefetchReport> {
    let handle = self.state.lock().ok()?.prefetch.take()?;

    match handle.await {
      Ok(report) => Some(report),
      Err(e) => {
        warn!("prefetch task failed: {}", e);
        None
      }
    }
  }

  /// Route one request through the pipeline, whatever the phase.
  pub async fn dispatch(&self, ctx: RequestContext) -> Result<Served> {
    self.pipeline.handle(ctx).await
  }
}

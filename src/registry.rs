//! Registry of the clients (pages, sessions) the layer serves.
//!
//! Clients are inserted explicitly when they start and removed when they go
//! away. Each remembers which generation controls it, which is what the
//! lifecycle looks at before cutting over to a new one.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct ClientEntry {
  /// Generation serving this client, if any was active when it registered
  pub controller: Option<String>,
}

#[derive(Default)]
pub struct ClientRegistry {
  clients: Mutex<HashMap<String, ClientEntry>>,
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Insert (or refresh) a client, controlled by `controller`.
  pub fn register(&self, id: &str, controller: Option<String>) -> Result<()> {
    let mut clients = self
      .clients
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    clients.insert(id.to_string(), ClientEntry { controller });
    Ok(())
  }

  /// Remove a client. Returns false if it wasn't registered.
  pub fn release(&self, id: &str) -> Result<bool> {
    let mut clients = self
      .clients
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(clients.remove(id).is_some())
  }

  pub fn get(&self, id: &str) -> Result<Option<ClientEntry>> {
    let clients = self
      .clients
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(clients.get(id).cloned())
  }

  /// Put every registered client under `generation`. Returns how many changed hands.
  pub fn claim(&self, generation: &str) -> Result<usize> {
    let mut clients = self
      .clients
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut claimed = 0;
    for entry in clients.values_mut() {
      if entry.controller.as_deref() != Some(generation) {
        entry.controller = Some(generation.to_string());
        claimed += 1;
      }
    }
    Ok(claimed)
  }

  /// Clients still controlled by some generation other than `generation`.
  pub fn held_elsewhere(&self, generation: &str) -> Result<usize> {
    let clients = self
      .clients
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(
      clients
        .values()
        .filter(|c| matches!(c.controller.as_deref(), Some(g) if g != generation))
        .count(),
    )
  }

  /// Poison the lock, as a panic while holding it would.
  #[cfg(test)]
  pub fn poison(&self) {
    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
      let _clients = self.clients.lock().unwrap();
      panic!("panic while holding the registry");
    }));
  }

  pub fn len(&self) -> Result<usize> {
    let clients = self
      .clients
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(clients.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_register_and_release() {
    let registry = ClientRegistry::new();
    registry.register("tab-1", Some("g1".to_string())).unwrap();

    assert_eq!(registry.len().unwrap(), 1);
    assert_eq!(
      registry.get("tab-1").unwrap().unwrap().controller.as_deref(),
      Some("g1")
    );
    assert!(registry.release("tab-1").unwrap());
    assert!(!registry.release("tab-1").unwrap());
    assert_eq!(registry.len().unwrap(), 0);
  }

  #[test]
  fn test_held_elsewhere_ignores_uncontrolled_clients() {
    let registry = ClientRegistry::new();
    registry.register("old", Some("g1".to_string())).unwrap();
    registry.register("new", Some("g2".to_string())).unwrap();
    registry.register("fresh", None).unwrap();

    assert_eq!(registry.held_elsewhere("g2").unwrap(), 1);
    assert_eq!(registry.held_elsewhere("g3").unwrap(), 2);
  }

  #[test]
  fn test_claim_moves_everyone() {
    let registry = ClientRegistry::new();
    registry.register("a", Some("g1".to_string())).unwrap();
    registry.register("b", None).unwrap();
    registry.register("c", Some("g2".to_string())).unwrap();

    assert_eq!(registry.claim("g2").unwrap(), 2);
    assert_eq!(registry.held_elsewhere("g2").unwrap(), 0);
    assert_eq!(registry.claim("g2").unwrap(), 0);
  }

  #[test]
  fn test_poisoned_registry_reports_errors() {
    let registry = ClientRegistry::new();
    registry.poison();

    assert!(registry.register("tab-1", None).is_err());
    assert!(registry.len().is_err());
  }
}

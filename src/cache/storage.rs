//! Generation-aware cache store trait with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use super::traits::{CachedEntry, GenerationInfo, ResponseSnapshot};

/// Trait for cache store backends.
///
/// Implementations must be safe for concurrent readers and writers; callers do
/// no locking of their own.
pub trait CacheStore: Send + Sync {
  /// Create the named generation if it doesn't exist yet.
  fn open_generation(&self, name: &str) -> Result<()>;

  /// All generations currently in the store, by name.
  fn generations(&self) -> Result<Vec<GenerationInfo>>;

  fn has_generation(&self, name: &str) -> Result<bool>;

  /// Delete a generation and everything in it. Returns false if it didn't exist.
  fn delete_generation(&self, name: &str) -> Result<bool>;

  /// Look up an entry in a generation.
  fn get(&self, generation: &str, key: &str) -> Result<Option<CachedEntry>>;

  /// Store an entry, replacing any previous value for the key.
  /// Fails if the generation does not exist.
  fn put(&self, generation: &str, key: &str, response: &ResponseSnapshot) -> Result<()>;

  /// Store a batch of entries atomically: all of them or none.
  fn put_all(&self, generation: &str, entries: &[(String, ResponseSnapshot)]) -> Result<()>;

  /// Generation that served traffic when the store was last written.
  fn active_generation(&self) -> Result<Option<String>>;

  fn set_active_generation(&self, name: &str) -> Result<()>;
}

/// SQLite-based cache store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// A store that lives only as long as this process.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per generation (versioned store)
CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Captured responses, keyed by normalized cache key
CREATE TABLE IF NOT EXISTS entries (
    generation TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, cache_key),
    FOREIGN KEY (generation) REFERENCES generations(name) ON DELETE CASCADE
);

-- Small key/value table for the active generation pointer
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const ACTIVE_KEY: &str = "active_generation";

const INSERT_ENTRY: &str =
  "INSERT OR REPLACE INTO entries (generation, cache_key, status, status_text, headers, body, cached_at)
   VALUES (?, ?, ?, ?, ?, ?, datetime('now'))";

fn encode_headers(headers: &[(String, String)]) -> Result<String> {
  serde_json::to_string(headers).map_err(|e| eyre!("Failed to serialize headers: {}", e))
}

impl CacheStore for SqliteStore {
  fn open_generation(&self, name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO generations (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open generation {}: {}", name, e))?;

    Ok(())
  }

  fn generations(&self) -> Result<Vec<GenerationInfo>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT g.name, g.created_at, COUNT(e.cache_key) FROM generations g
         LEFT JOIN entries e ON e.generation = g.name
         GROUP BY g.name
         ORDER BY g.name",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, String, i64)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read generation row: {}", e))?;

    rows
      .into_iter()
      .map(|(name, created_at, entries)| {
        Ok(GenerationInfo {
          name,
          entries: usize::try_from(entries).unwrap_or_default(),
          created_at: parse_datetime(&created_at)?,
        })
      })
      .collect()
  }

  fn has_generation(&self, name: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM generations WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up generation {}: {}", name, e))?;

    Ok(found.is_some())
  }

  fn delete_generation(&self, name: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let deleted = conn
      .execute("DELETE FROM generations WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete generation {}: {}", name, e))?;

    conn
      .execute(
        "DELETE FROM meta WHERE key = ? AND value = ?",
        params![ACTIVE_KEY, name],
      )
      .map_err(|e| eyre!("Failed to clear active pointer: {}", e))?;

    Ok(deleted > 0)
  }

  fn get(&self, generation: &str, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(u16, String, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, status_text, headers, body, cached_at FROM entries
         WHERE generation = ? AND cache_key = ?",
        params![generation, key],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))?;

    match row {
      Some((status, status_text, headers, body, cached_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;
        Ok(Some(CachedEntry {
          response: ResponseSnapshot {
            status,
            status_text,
            headers,
            body,
          },
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, generation: &str, key: &str, response: &ResponseSnapshot) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let headers = encode_headers(&response.headers)?;

    conn
      .execute(
        INSERT_ENTRY,
        params![
          generation,
          key,
          response.status,
          response.status_text,
          headers,
          response.body
        ],
      )
      .map_err(|e| eyre!("Failed to store {} in {}: {}", key, generation, e))?;

    Ok(())
  }

  fn put_all(&self, generation: &str, entries: &[(String, ResponseSnapshot)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (key, response) in entries {
      let headers = encode_headers(&response.headers)?;
      tx.execute(
        INSERT_ENTRY,
        params![
          generation,
          key,
          response.status,
          response.status_text,
          headers,
          response.body
        ],
      )
      .map_err(|e| eyre!("Failed to store {} in {}: {}", key, generation, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn active_generation(&self) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT value FROM meta WHERE key = ?",
        params![ACTIVE_KEY],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read active generation: {}", e))
  }

  fn set_active_generation(&self, name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
        params![ACTIVE_KEY, name],
      )
      .map_err(|e| eyre!("Failed to record active generation: {}", e))?;

    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

/// Store that keeps everything in process memory.
/// Used for `--ephemeral` runs and in tests.
#[derive(Default)]
pub struct MemoryStore {
  state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
  generations: BTreeMap<String, MemoryGeneration>,
  active: Option<String>,
}

struct MemoryGeneration {
  created_at: DateTime<Utc>,
  entries: HashMap<String, CachedEntry>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStore for MemoryStore {
  fn open_generation(&self, name: &str) -> Result<()> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    state
      .generations
      .entry(name.to_string())
      .or_insert_with(|| MemoryGeneration {
        created_at: Utc::now(),
        entries: HashMap::new(),
      });

    Ok(())
  }

  fn generations(&self) -> Result<Vec<GenerationInfo>> {
    let state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(
      state
        .generations
        .iter()
        .map(|(name, generation)| GenerationInfo {
          name: name.clone(),
          entries: generation.entries.len(),
          created_at: generation.created_at,
        })
        .collect(),
    )
  }

  fn has_generation(&self, name: &str) -> Result<bool> {
    let state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(state.generations.contains_key(name))
  }

  fn delete_generation(&self, name: &str) -> Result<bool> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if state.active.as_deref() == Some(name) {
      state.active = None;
    }

    Ok(state.generations.remove(name).is_some())
  }

  fn get(&self, generation: &str, key: &str) -> Result<Option<CachedEntry>> {
    let state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(
      state
        .generations
        .get(generation)
        .and_then(|g| g.entries.get(key))
        .cloned(),
    )
  }

  fn put(&self, generation: &str, key: &str, response: &ResponseSnapshot) -> Result<()> {
    self.put_all(generation, &[(key.to_string(), response.clone())])
  }

  fn put_all(&self, generation: &str, entries: &[(String, ResponseSnapshot)]) -> Result<()> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let target = state
      .generations
      .get_mut(generation)
      .ok_or_else(|| eyre!("Generation {} does not exist", generation))?;

    let cached_at = Utc::now();
    for (key, response) in entries {
      target.entries.insert(
        key.clone(),
        CachedEntry {
          response: response.clone(),
          cached_at,
        },
      );
    }

    Ok(())
  }

  fn active_generation(&self) -> Result<Option<String>> {
    let state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(state.active.clone())
  }

  fn set_active_generation(&self, name: &str) -> Result<()> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    state.active = Some(name.to_string());
    Ok(())
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  fn stores() -> Vec<(&'static str, Box<dyn CacheStore>)> {
    vec![
      ("sqlite", Box::new(SqliteStore::open_in_memory().unwrap())),
      ("memory", Box::new(MemoryStore::new())),
    ]
  }

  fn snapshot(body: &str) -> ResponseSnapshot {
    ResponseSnapshot {
      status: 200,
      status_text: "OK".to_string(),
      headers: vec![("content-type".to_string(), "text/html".to_string())],
      body: body.as_bytes().to_vec(),
    }
  }

  #[test]
  fn test_put_then_get() {
    for (kind, store) in stores() {
      store.open_generation("g1").unwrap();
      store.put("g1", "/", &snapshot("shell")).unwrap();

      let entry = store.get("g1", "/").unwrap().expect(kind);
      assert_eq!(entry.response, snapshot("shell"), "{}", kind);
      assert!(store.get("g1", "/missing").unwrap().is_none(), "{}", kind);
    }
  }

  #[test]
  fn test_put_replaces_existing_value() {
    for (kind, store) in stores() {
      store.open_generation("g1").unwrap();
      store.put("g1", "k", &snapshot("old")).unwrap();
      store.put("g1", "k", &snapshot("new")).unwrap();

      let entry = store.get("g1", "k").unwrap().unwrap();
      assert_eq!(entry.response.body, b"new", "{}", kind);
      assert_eq!(store.generations().unwrap()[0].entries, 1, "{}", kind);
    }
  }

  #[test]
  fn test_put_into_missing_generation_fails() {
    for (kind, store) in stores() {
      assert!(store.put("nope", "k", &snapshot("x")).is_err(), "{}", kind);
    }
  }

  #[test]
  fn test_generations_are_isolated() {
    for (kind, store) in stores() {
      store.open_generation("g1").unwrap();
      store.open_generation("g2").unwrap();
      store.put("g1", "k", &snapshot("one")).unwrap();

      assert!(store.get("g2", "k").unwrap().is_none(), "{}", kind);
    }
  }

  #[test]
  fn test_delete_generation_drops_entries() {
    for (kind, store) in stores() {
      store.open_generation("g1").unwrap();
      store.put("g1", "k", &snapshot("one")).unwrap();

      assert!(store.delete_generation("g1").unwrap(), "{}", kind);
      assert!(!store.delete_generation("g1").unwrap(), "{}", kind);
      assert!(!store.has_generation("g1").unwrap(), "{}", kind);
      assert!(store.get("g1", "k").unwrap().is_none(), "{}", kind);

      // Reopening starts empty
      store.open_generation("g1").unwrap();
      assert!(store.get("g1", "k").unwrap().is_none(), "{}", kind);
    }
  }

  #[test]
  fn test_open_generation_is_idempotent() {
    for (kind, store) in stores() {
      store.open_generation("g1").unwrap();
      store.put("g1", "k", &snapshot("one")).unwrap();
      store.open_generation("g1").unwrap();

      assert!(store.get("g1", "k").unwrap().is_some(), "{}", kind);
      assert_eq!(store.generations().unwrap().len(), 1, "{}", kind);
    }
  }

  #[test]
  fn test_put_all_is_atomic() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.open_generation("g1").unwrap();
    store.put("g1", "existing", &snapshot("x")).unwrap();

    // A failing batch leaves the store untouched
    let batch = vec![
      ("a".to_string(), snapshot("a")),
      ("b".to_string(), snapshot("b")),
    ];
    assert!(store.put_all("missing", &batch).is_err());
    assert_eq!(store.generations().unwrap()[0].entries, 1);

    store.put_all("g1", &batch).unwrap();
    assert_eq!(store.generations().unwrap()[0].entries, 3);
  }

  #[test]
  fn test_active_pointer_round_trip() {
    for (kind, store) in stores() {
      assert!(store.active_generation().unwrap().is_none(), "{}", kind);
      store.open_generation("g1").unwrap();
      store.set_active_generation("g1").unwrap();
      assert_eq!(store.active_generation().unwrap().as_deref(), Some("g1"));

      store.delete_generation("g1").unwrap();
      assert!(store.active_generation().unwrap().is_none(), "{}", kind);
    }
  }

  #[test]
  fn test_sqlite_store_persists_across_reopen() {
    let dir = std::env::temp_dir().join(format!("offline-cache-test-{}", std::process::id()));
    let path = dir.join("cache.db");

    {
      let store = SqliteStore::open(&path).unwrap();
      store.open_generation("g1").unwrap();
      store.put("g1", "/", &snapshot("shell")).unwrap();
      store.set_active_generation("g1").unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.active_generation().unwrap().as_deref(), Some("g1"));
    assert!(store.get("g1", "/").unwrap().is_some());

    drop(store);
    let _ = std::fs::remove_dir_all(dir);
  }
}

//! Versioned response cache.
//!
//! Responses live in named generations, one per deployed build. Only the active
//! generation is read or written by request handling; stale generations are
//! deleted wholesale when a newer one activates.

mod key;
mod storage;
mod traits;

pub use key::cache_key;
#[cfg(test)]
pub use key::ROOT_KEY;
pub use storage::{CacheStore, MemoryStore, SqliteStore};
#[cfg(test)]
pub use storage::testing::FaultyStore;
pub use traits::{CacheSource, RequestContext, ResponseSnapshot, Served};

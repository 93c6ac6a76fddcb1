//! State substrate: coordination store, document store, typed repository,
//! and the watch-fed fleet cache.
//!
//! Two stores with complementary roles. The coordination store is a
//! linearizable key-value store with native watch streams and lease-based
//! ephemeral keys; it holds instance states, worker states, port
//! allocations, and leader keys. The document store is a schemaless sled
//! database for large, query-rich records: definitions, worker templates,
//! and the append-only event audit log.

pub mod cache;
pub mod coord;
pub mod docs;
pub mod repo;

pub use cache::FleetCache;
pub use coord::{
    CoordStore, LeaseId, MemCoordStore, Revision, VersionedValue, WatchEvent, WatchEventKind,
    WatchStream,
};
pub use docs::DocStore;
pub use repo::Repo;

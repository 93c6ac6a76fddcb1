//! Coordination store: linearizable keyed state with watches and leases.
//!
//! The [`CoordStore`] trait is the seam between the control plane and its
//! coordination backend. The in-process [`MemCoordStore`] implements the
//! full contract (global revision ordering, prefix watches with resume,
//! lease-scoped ephemeral keys) behind a single mutex, which is
//! sufficient for one control-plane process per region. A networked backend
//! slots in behind the same trait.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{ControlError, ControlResult};

/// Monotonically increasing store revision
pub type Revision = u64;

/// Identifier of a granted lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub u64);

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lease-{}", self.0)
    }
}

/// A value together with the revision that last wrote it
#[derive(Debug, Clone)]
pub struct VersionedValue {
    pub value: Vec<u8>,
    pub revision: Revision,
}

/// Kind of a watch notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// One ordered notification on a watch stream
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
    /// Present on PUT, absent on DELETE
    pub value: Option<Vec<u8>>,
    pub revision: Revision,
}

/// Ordered stream of watch events for one prefix.
///
/// The stream ends when the store drops the watcher (slow consumer or
/// shutdown); consumers resume by re-watching from their last-seen revision.
pub struct WatchStream {
    rx: mpsc::Receiver<WatchEvent>,
}

impl WatchStream {
    /// Receive the next event; `None` means the watch was cancelled and the
    /// caller should re-list and re-watch from its last-seen revision.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

/// Contract the coordination store exposes to the rest of the crate.
#[async_trait]
pub trait CoordStore: Send + Sync + 'static {
    /// Read one key.
    async fn get(&self, key: &str) -> ControlResult<Option<VersionedValue>>;

    /// Compare-and-swap. `expected = None` requires the key to be absent
    /// (create-only); `Some(rev)` requires the current revision to match.
    /// Returns the new revision.
    async fn cas(
        &self,
        key: &str,
        expected: Option<Revision>,
        value: Vec<u8>,
    ) -> ControlResult<Revision>;

    /// Delete a key. `expected = None` deletes unconditionally.
    async fn delete(&self, key: &str, expected: Option<Revision>) -> ControlResult<()>;

    /// Snapshot every key under `prefix` together with the store revision
    /// the snapshot is consistent at.
    async fn list(&self, prefix: &str) -> ControlResult<(Vec<(String, VersionedValue)>, Revision)>;

    /// Watch a prefix. `from_revision = 0` starts at the current head;
    /// otherwise events with a revision greater than `from_revision` are
    /// replayed first. A resume point older than the retained history fails
    /// transiently, telling the caller to re-list.
    async fn watch(&self, prefix: &str, from_revision: Revision) -> ControlResult<WatchStream>;

    /// Grant a lease with the given TTL.
    async fn grant_lease(&self, ttl: Duration) -> ControlResult<LeaseId>;

    /// Heartbeat a lease, extending it by its TTL. Fails once expired.
    async fn keep_alive(&self, lease: LeaseId) -> ControlResult<()>;

    /// Revoke a lease immediately, deleting its keys.
    async fn revoke_lease(&self, lease: LeaseId) -> ControlResult<()>;

    /// Create-only put bound to a lease; the key disappears on lease loss.
    async fn put_with_lease(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: LeaseId,
    ) -> ControlResult<Revision>;
}

const WATCH_CHANNEL_DEPTH: usize = 1024;
const HISTORY_DEPTH: usize = 8192;
const JANITOR_PERIOD: Duration = Duration::from_millis(250);

struct Entry {
    value: Vec<u8>,
    revision: Revision,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl: Duration,
    expires_at: Instant,
    keys: HashSet<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::Sender<WatchEvent>,
}

#[derive(Default)]
struct Inner {
    map: BTreeMap<String, Entry>,
    revision: Revision,
    history: VecDeque<WatchEvent>,
    watchers: Vec<Watcher>,
    leases: HashMap<u64, Lease>,
    next_lease: u64,
}

impl Inner {
    fn bump(&mut self) -> Revision {
        self.revision += 1;
        self.revision
    }

    /// Record an event and push it to matching watchers. A watcher whose
    /// channel is full is cancelled; its consumer re-syncs by revision.
    fn notify(&mut self, event: WatchEvent) {
        if self.history.len() == HISTORY_DEPTH {
            self.history.pop_front();
        }
        self.history.push_back(event.clone());
        self.watchers.retain(|w| {
            if !event.key.starts_with(&w.prefix) {
                return true;
            }
            w.tx.try_send(event.clone()).is_ok()
        });
    }

    fn delete_key(&mut self, key: &str) -> Option<Revision> {
        let entry = self.map.remove(key)?;
        if let Some(lease) = entry.lease {
            if let Some(l) = self.leases.get_mut(&lease.0) {
                l.keys.remove(key);
            }
        }
        let revision = self.bump();
        self.notify(WatchEvent {
            kind: WatchEventKind::Delete,
            key: key.to_string(),
            value: None,
            revision,
        });
        Some(revision)
    }

    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(lease) = self.leases.remove(&id) {
                for key in lease.keys {
                    self.delete_key(&key);
                }
            }
        }
    }
}

/// In-process implementation of [`CoordStore`].
#[derive(Clone)]
pub struct MemCoordStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemCoordStore {
    /// Create a store and spawn its lease janitor. Must be called within a
    /// tokio runtime.
    pub fn new() -> Self {
        let inner = Arc::new(Mutex::new(Inner::default()));
        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(JANITOR_PERIOD);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.lock().expire_leases(Instant::now());
            }
        });
        Self { inner }
    }

    /// Current head revision.
    pub fn head_revision(&self) -> Revision {
        self.inner.lock().revision
    }
}

impl Default for MemCoordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordStore for MemCoordStore {
    async fn get(&self, key: &str) -> ControlResult<Option<VersionedValue>> {
        let inner = self.inner.lock();
        Ok(inner.map.get(key).map(|e| VersionedValue {
            value: e.value.clone(),
            revision: e.revision,
        }))
    }

    async fn cas(
        &self,
        key: &str,
        expected: Option<Revision>,
        value: Vec<u8>,
    ) -> ControlResult<Revision> {
        let mut inner = self.inner.lock();
        let current = inner.map.get(key).map(|e| e.revision);
        if current != expected {
            return Err(ControlError::Conflict {
                key: key.to_string(),
            });
        }
        let revision = inner.bump();
        inner.map.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                revision,
                lease: None,
            },
        );
        inner.notify(WatchEvent {
            kind: WatchEventKind::Put,
            key: key.to_string(),
            value: Some(value),
            revision,
        });
        Ok(revision)
    }

    async fn delete(&self, key: &str, expected: Option<Revision>) -> ControlResult<()> {
        let mut inner = self.inner.lock();
        match inner.map.get(key) {
            None => Err(ControlError::NotFound {
                kind: "key",
                id: key.to_string(),
            }),
            Some(entry) => {
                if let Some(rev) = expected {
                    if entry.revision != rev {
                        return Err(ControlError::Conflict {
                            key: key.to_string(),
                        });
                    }
                }
                inner.delete_key(key);
                Ok(())
            }
        }
    }

    async fn list(&self, prefix: &str) -> ControlResult<(Vec<(String, VersionedValue)>, Revision)> {
        let inner = self.inner.lock();
        let items = inner
            .map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| {
                (
                    k.clone(),
                    VersionedValue {
                        value: e.value.clone(),
                        revision: e.revision,
                    },
                )
            })
            .collect();
        Ok((items, inner.revision))
    }

    async fn watch(&self, prefix: &str, from_revision: Revision) -> ControlResult<WatchStream> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_DEPTH);
        let mut inner = self.inner.lock();
        if from_revision > 0 {
            let oldest_retained = inner.history.front().map(|e| e.revision);
            if let Some(oldest) = oldest_retained {
                // A resume point before retained history cannot be replayed
                // faithfully unless nothing was compacted away.
                if from_revision + 1 < oldest {
                    return Err(ControlError::Transient(format!(
                        "watch history compacted before revision {}",
                        from_revision
                    )));
                }
            }
            for event in inner.history.iter() {
                if event.revision > from_revision && event.key.starts_with(prefix) {
                    tx.try_send(event.clone()).map_err(|_| {
                        ControlError::Transient("watch replay overflow".to_string())
                    })?;
                }
            }
        }
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(WatchStream { rx })
    }

    async fn grant_lease(&self, ttl: Duration) -> ControlResult<LeaseId> {
        let mut inner = self.inner.lock();
        inner.next_lease += 1;
        let id = inner.next_lease;
        inner.leases.insert(
            id,
            Lease {
                ttl,
                expires_at: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(LeaseId(id))
    }

    async fn keep_alive(&self, lease: LeaseId) -> ControlResult<()> {
        let mut inner = self.inner.lock();
        match inner.leases.get_mut(&lease.0) {
            Some(l) => {
                l.expires_at = Instant::now() + l.ttl;
                Ok(())
            }
            None => Err(ControlError::LeaseLost(lease.to_string())),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> ControlResult<()> {
        let mut inner = self.inner.lock();
        match inner.leases.remove(&lease.0) {
            Some(l) => {
                for key in l.keys {
                    inner.delete_key(&key);
                }
                Ok(())
            }
            None => Err(ControlError::LeaseLost(lease.to_string())),
        }
    }

    async fn put_with_lease(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: LeaseId,
    ) -> ControlResult<Revision> {
        let mut inner = self.inner.lock();
        if !inner.leases.contains_key(&lease.0) {
            return Err(ControlError::LeaseLost(lease.to_string()));
        }
        if inner.map.contains_key(key) {
            return Err(ControlError::Conflict {
                key: key.to_string(),
            });
        }
        let revision = inner.bump();
        inner.map.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                revision,
                lease: Some(lease),
            },
        );
        if let Some(l) = inner.leases.get_mut(&lease.0) {
            l.keys.insert(key.to_string());
        }
        inner.notify(WatchEvent {
            kind: WatchEventKind::Put,
            key: key.to_string(),
            value: Some(value),
            revision,
        });
        Ok(revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cas_create_then_update_then_conflict() {
        let store = MemCoordStore::new();
        let r1 = store.cas("/k", None, b"a".to_vec()).await.unwrap();
        let r2 = store.cas("/k", Some(r1), b"b".to_vec()).await.unwrap();
        assert!(r2 > r1);
        let err = store.cas("/k", Some(r1), b"c".to_vec()).await.unwrap_err();
        assert!(err.is_conflict());
        // create-only on an existing key also conflicts
        let err = store.cas("/k", None, b"d".to_vec()).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn watch_delivers_ordered_events_and_replays() {
        let store = MemCoordStore::new();
        let r1 = store.cas("/w/a", None, b"1".to_vec()).await.unwrap();
        let mut stream = store.watch("/w/", 0).await.unwrap();
        let r2 = store.cas("/w/b", None, b"2".to_vec()).await.unwrap();
        store.delete("/w/a", None).await.unwrap();

        let e1 = stream.recv().await.unwrap();
        assert_eq!(e1.kind, WatchEventKind::Put);
        assert_eq!(e1.revision, r2);
        let e2 = stream.recv().await.unwrap();
        assert_eq!(e2.kind, WatchEventKind::Delete);
        assert!(e2.revision > r2);

        // Resuming from r1 replays everything after it
        let mut resumed = store.watch("/w/", r1).await.unwrap();
        let e = resumed.recv().await.unwrap();
        assert_eq!(e.key, "/w/b");
    }

    #[tokio::test(start_paused = true)]
    async fn leased_key_disappears_on_expiry() {
        let store = MemCoordStore::new();
        let lease = store.grant_lease(Duration::from_secs(2)).await.unwrap();
        store
            .put_with_lease("/leader/x", b"me".to_vec(), lease)
            .await
            .unwrap();
        assert!(store.get("/leader/x").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(3)).await;
        // Let the janitor run
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(500)).await;
        tokio::task::yield_now().await;
        assert!(store.get("/leader/x").await.unwrap().is_none());
        assert!(store.keep_alive(lease).await.is_err());
    }

    #[tokio::test]
    async fn keep_alive_extends_lease() {
        let store = MemCoordStore::new();
        let lease = store.grant_lease(Duration::from_secs(5)).await.unwrap();
        store.keep_alive(lease).await.unwrap();
        store.revoke_lease(lease).await.unwrap();
        assert!(store.keep_alive(lease).await.is_err());
    }

    #[tokio::test]
    async fn put_with_lease_is_create_only() {
        let store = MemCoordStore::new();
        let lease = store.grant_lease(Duration::from_secs(5)).await.unwrap();
        store
            .put_with_lease("/leader/s", b"a".to_vec(), lease)
            .await
            .unwrap();
        let err = store
            .put_with_lease("/leader/s", b"b".to_vec(), lease)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }
}

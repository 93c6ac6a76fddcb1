//! Watch-fed fleet cache.
//!
//! Each replica keeps an in-memory projection of instances and workers,
//! kept current by coordination-store watches. The cache is read-only state
//! for its owner: mutations always go through CAS against revisions read
//! from the store itself. When the store is briefly unavailable, reads are
//! served from here; any mutation attempted under staleness fails with a
//! conflict and is retried.

use dashmap::DashMap;
use tokio::sync::watch;

use crate::domain::instance::{InstanceId, LabletInstance};
use crate::domain::worker::{Worker, WorkerId};
use crate::error::ControlResult;
use crate::store::coord::{Revision, WatchEventKind};
use crate::store::repo::{Repo, INSTANCE_PREFIX, WORKER_PREFIX};

/// In-memory projection of the fleet, invalidated by watch events.
pub struct FleetCache {
    repo: Repo,
    instances: DashMap<InstanceId, (LabletInstance, Revision)>,
    workers: DashMap<WorkerId, (Worker, Revision)>,
    dirty_tx: watch::Sender<Revision>,
    dirty_rx: watch::Receiver<Revision>,
}

impl FleetCache {
    pub fn new(repo: Repo) -> Self {
        let (dirty_tx, dirty_rx) = watch::channel(0);
        Self {
            repo,
            instances: DashMap::new(),
            workers: DashMap::new(),
            dirty_tx,
            dirty_rx,
        }
    }

    /// Receiver that changes whenever the projection advances; used by the
    /// scheduler to trigger a placement pass between ticks.
    pub fn dirty(&self) -> watch::Receiver<Revision> {
        self.dirty_rx.clone()
    }

    pub fn instance(&self, id: InstanceId) -> Option<(LabletInstance, Revision)> {
        self.instances.get(&id).map(|e| e.value().clone())
    }

    pub fn worker(&self, id: WorkerId) -> Option<(Worker, Revision)> {
        self.workers.get(&id).map(|e| e.value().clone())
    }

    pub fn instances(&self) -> Vec<(LabletInstance, Revision)> {
        self.instances.iter().map(|e| e.value().clone()).collect()
    }

    pub fn workers(&self) -> Vec<(Worker, Revision)> {
        self.workers.iter().map(|e| e.value().clone()).collect()
    }

    /// Run the projection until the task is cancelled. Re-lists and
    /// re-watches whenever a watch is cancelled or the resume point has
    /// been compacted away.
    pub async fn run(&self) {
        loop {
            match self.sync_once().await {
                Ok(()) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "fleet cache sync failed; retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// One full list + watch cycle. Returns when the watch ends.
    async fn sync_once(&self) -> ControlResult<()> {
        let (instances, inst_rev) = self.repo.list_instances().await?;
        self.instances.clear();
        for (instance, revision) in instances {
            self.instances.insert(instance.id, (instance, revision));
        }
        let (workers, worker_rev) = self.repo.list_workers().await?;
        self.workers.clear();
        for (worker, revision) in workers {
            self.workers.insert(worker.id, (worker, revision));
        }
        let from = inst_rev.max(worker_rev);
        let _ = self.dirty_tx.send(from);

        let mut inst_watch = self.repo.store().watch(INSTANCE_PREFIX, from).await?;
        let mut worker_watch = self.repo.store().watch(WORKER_PREFIX, from).await?;
        loop {
            tokio::select! {
                event = inst_watch.recv() => {
                    let Some(event) = event else { return Ok(()) };
                    self.apply_instance_event(&event.key, event.kind, event.value.as_deref(), event.revision);
                    let _ = self.dirty_tx.send(event.revision);
                }
                event = worker_watch.recv() => {
                    let Some(event) = event else { return Ok(()) };
                    self.apply_worker_event(&event.key, event.kind, event.value.as_deref(), event.revision);
                    let _ = self.dirty_tx.send(event.revision);
                }
            }
        }
    }

    fn apply_instance_event(
        &self,
        key: &str,
        kind: WatchEventKind,
        value: Option<&[u8]>,
        revision: Revision,
    ) {
        let Some(id) = key
            .strip_prefix(INSTANCE_PREFIX)
            .and_then(|s| InstanceId::parse_str(s).ok())
        else {
            return;
        };
        match kind {
            WatchEventKind::Put => {
                if let Some(bytes) = value {
                    match serde_json::from_slice::<LabletInstance>(bytes) {
                        Ok(instance) => {
                            self.instances.insert(id, (instance, revision));
                        }
                        Err(err) => {
                            tracing::warn!(instance_id = %id, error = %err, "ignoring corrupt instance event");
                        }
                    }
                }
            }
            WatchEventKind::Delete => {
                self.instances.remove(&id);
            }
        }
    }

    fn apply_worker_event(
        &self,
        key: &str,
        kind: WatchEventKind,
        value: Option<&[u8]>,
        revision: Revision,
    ) {
        let Some(id) = key
            .strip_prefix(WORKER_PREFIX)
            .and_then(|s| WorkerId::parse_str(s).ok())
        else {
            return;
        };
        match kind {
            WatchEventKind::Put => {
                if let Some(bytes) = value {
                    match serde_json::from_slice::<Worker>(bytes) {
                        Ok(worker) => {
                            self.workers.insert(id, (worker, revision));
                        }
                        Err(err) => {
                            tracing::warn!(worker_id = %id, error = %err, "ignoring corrupt worker event");
                        }
                    }
                }
            }
            WatchEventKind::Delete => {
                self.workers.remove(&id);
            }
        }
    }
}

//! Per-worker port leasing.
//!
//! Each worker exposes a declared range `[lo, hi]`. A request for k ports
//! takes the k lowest free ports (deterministic, monotonically increasing),
//! records them as one allocation on the worker, and commits with CAS; a
//! small retry bound absorbs races with other writers before the request
//! fails with `PortAllocationConflict`. Release is the symmetric CAS on
//! instance termination. Ports are never reused within an instance's
//! lifetime: the allocation holds until release.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;

use crate::domain::definition::PortSpec;
use crate::domain::instance::InstanceId;
use crate::domain::worker::{PortAllocation, WorkerId};
use crate::error::{ControlError, ControlResult};
use crate::store::repo::Repo;

const CAS_RETRY_BOUND: usize = 4;

/// Leasing service over the workers' declared port ranges.
#[derive(Clone)]
pub struct PortAllocator {
    repo: Repo,
}

impl PortAllocator {
    pub fn new(repo: Repo) -> Self {
        Self { repo }
    }

    /// Reserve one port per template entry on `worker_id` for `instance_id`.
    ///
    /// Returns the placeholder-name to port map on success. Fails with
    /// `CapacityExhausted` when the range cannot satisfy the request and
    /// `PortAllocationConflict` when the CAS race is lost repeatedly.
    pub async fn allocate(
        &self,
        worker_id: WorkerId,
        instance_id: InstanceId,
        template: &[PortSpec],
    ) -> ControlResult<BTreeMap<String, u16>> {
        if template.is_empty() {
            return Ok(BTreeMap::new());
        }
        for _ in 0..CAS_RETRY_BOUND {
            let (mut worker, revision) =
                self.repo
                    .get_worker(worker_id)
                    .await?
                    .ok_or(ControlError::NotFound {
                        kind: "worker",
                        id: worker_id.to_string(),
                    })?;

            let used: HashSet<u16> = worker.used_ports().into_iter().collect();
            let mut free = (worker.port_range.lo..=worker.port_range.hi)
                .filter(|p| !used.contains(p));

            let mut ports = BTreeMap::new();
            for spec in template {
                match free.next() {
                    Some(port) => {
                        ports.insert(spec.name.clone(), port);
                    }
                    None => {
                        return Err(ControlError::CapacityExhausted(format!(
                            "port range exhausted on worker {}",
                            worker_id
                        )))
                    }
                }
            }

            worker.port_allocations.push(PortAllocation {
                instance_id,
                ports: ports.clone(),
                allocated_at: Utc::now(),
            });

            match self.repo.cas_worker(&worker, revision).await {
                Ok(_) => {
                    let assigned: Vec<u16> = ports.values().copied().collect();
                    if let Err(err) = self
                        .repo
                        .put_port_markers(worker_id, instance_id, &assigned)
                        .await
                    {
                        tracing::warn!(worker_id = %worker_id, error = %err, "port marker write failed");
                    }
                    return Ok(ports);
                }
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(ControlError::PortAllocationConflict {
            worker_id: worker_id.to_string(),
        })
    }

    /// Release exactly one allocation, identified by its port map. Used to
    /// unwind a placement whose later CAS failed without touching any
    /// allocation the same instance may have committed elsewhere.
    pub async fn release_exact(
        &self,
        worker_id: WorkerId,
        instance_id: InstanceId,
        ports: &BTreeMap<String, u16>,
    ) -> ControlResult<()> {
        for _ in 0..CAS_RETRY_BOUND {
            let Some((mut worker, revision)) = self.repo.get_worker(worker_id).await? else {
                return Ok(());
            };
            let before = worker.port_allocations.len();
            worker
                .port_allocations
                .retain(|a| !(a.instance_id == instance_id && a.ports == *ports));
            if worker.port_allocations.len() == before {
                return Ok(());
            }
            match self.repo.cas_worker(&worker, revision).await {
                Ok(_) => {
                    let released: Vec<u16> = ports.values().copied().collect();
                    if let Err(err) = self.repo.delete_port_markers(worker_id, &released).await {
                        tracing::warn!(worker_id = %worker_id, error = %err, "port marker delete failed");
                    }
                    return Ok(());
                }
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(ControlError::PortAllocationConflict {
            worker_id: worker_id.to_string(),
        })
    }

    /// Release every port held by `instance_id` on `worker_id`.
    pub async fn release(&self, worker_id: WorkerId, instance_id: InstanceId) -> ControlResult<()> {
        for _ in 0..CAS_RETRY_BOUND {
            let Some((mut worker, revision)) = self.repo.get_worker(worker_id).await? else {
                // The worker record is already gone; nothing holds the lease.
                return Ok(());
            };
            let released: Vec<u16> = worker
                .port_allocations
                .iter()
                .filter(|a| a.instance_id == instance_id)
                .flat_map(|a| a.ports.values().copied())
                .collect();
            if released.is_empty() {
                return Ok(());
            }
            worker
                .port_allocations
                .retain(|a| a.instance_id != instance_id);

            match self.repo.cas_worker(&worker, revision).await {
                Ok(_) => {
                    if let Err(err) = self.repo.delete_port_markers(worker_id, &released).await {
                        tracing::warn!(worker_id = %worker_id, error = %err, "port marker delete failed");
                    }
                    return Ok(());
                }
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(ControlError::PortAllocationConflict {
            worker_id: worker_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::definition::{LicenseKind, TransportKind};
    use crate::domain::worker::{Capacity, PortRange, Worker, WorkerTemplate};
    use crate::store::coord::MemCoordStore;
    use std::sync::Arc;

    fn template() -> WorkerTemplate {
        WorkerTemplate {
            name: "small".to_string(),
            instance_type: "t3".to_string(),
            image_id: "ami".to_string(),
            capacity: Capacity {
                cpu_cores: 8,
                memory_gib: 16,
                storage_gib: 100,
                max_nodes: 10,
            },
            license: LicenseKind::Enterprise,
            image_family: None,
            region: "eu-west-1".to_string(),
            port_range: PortRange { lo: 5000, hi: 5003 },
            drain_timeout_secs: None,
        }
    }

    fn specs(names: &[&str]) -> Vec<PortSpec> {
        names
            .iter()
            .map(|n| PortSpec {
                name: n.to_string(),
                transport: TransportKind::Tcp,
            })
            .collect()
    }

    async fn seeded_worker(repo: &Repo) -> WorkerId {
        let worker = Worker::from_template(&template(), "w1".to_string());
        let id = worker.id;
        repo.create_worker(&worker).await.unwrap();
        id
    }

    #[tokio::test]
    async fn allocates_lowest_free_ports_in_order() {
        let repo = Repo::new(Arc::new(MemCoordStore::new()));
        let allocator = PortAllocator::new(repo.clone());
        let worker_id = seeded_worker(&repo).await;

        let ports = allocator
            .allocate(worker_id, InstanceId::new(), &specs(&["serial_1", "vnc_1"]))
            .await
            .unwrap();
        assert_eq!(ports["serial_1"], 5000);
        assert_eq!(ports["vnc_1"], 5001);

        let ports2 = allocator
            .allocate(worker_id, InstanceId::new(), &specs(&["serial_1"]))
            .await
            .unwrap();
        assert_eq!(ports2["serial_1"], 5002);
    }

    #[tokio::test]
    async fn exhausted_range_is_capacity_error() {
        let repo = Repo::new(Arc::new(MemCoordStore::new()));
        let allocator = PortAllocator::new(repo.clone());
        let worker_id = seeded_worker(&repo).await;

        allocator
            .allocate(worker_id, InstanceId::new(), &specs(&["a", "b", "c", "d"]))
            .await
            .unwrap();
        let err = allocator
            .allocate(worker_id, InstanceId::new(), &specs(&["e"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::CapacityExhausted(_)));
    }

    #[tokio::test]
    async fn release_exact_leaves_other_allocations_alone() {
        let repo = Repo::new(Arc::new(MemCoordStore::new()));
        let allocator = PortAllocator::new(repo.clone());
        let worker_id = seeded_worker(&repo).await;
        let instance = InstanceId::new();

        let kept = allocator
            .allocate(worker_id, instance, &specs(&["a"]))
            .await
            .unwrap();
        let unwound = allocator
            .allocate(worker_id, instance, &specs(&["b"]))
            .await
            .unwrap();
        allocator
            .release_exact(worker_id, instance, &unwound)
            .await
            .unwrap();

        let (worker, _) = repo.get_worker(worker_id).await.unwrap().unwrap();
        assert_eq!(worker.port_allocations.len(), 1);
        assert_eq!(worker.port_allocations[0].ports, kept);
    }

    #[tokio::test]
    async fn release_returns_ports_to_the_pool() {
        let repo = Repo::new(Arc::new(MemCoordStore::new()));
        let allocator = PortAllocator::new(repo.clone());
        let worker_id = seeded_worker(&repo).await;
        let instance = InstanceId::new();

        allocator
            .allocate(worker_id, instance, &specs(&["a", "b"]))
            .await
            .unwrap();
        allocator.release(worker_id, instance).await.unwrap();

        let (worker, _) = repo.get_worker(worker_id).await.unwrap().unwrap();
        assert!(worker.port_allocations.is_empty());
        // Freed ports are available to a different instance again
        let ports = allocator
            .allocate(worker_id, InstanceId::new(), &specs(&["x"]))
            .await
            .unwrap();
        assert_eq!(ports["x"], 5000);
    }
}

//! Property tests over the fleet invariants: capacity books, port
//! uniqueness, state-machine paths, placement determinism, and rewrite
//! idempotence.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use proptest::prelude::*;

use labfleet::domain::definition::{
    ArtifactRef, DefinitionId, DefinitionRef, LabletDefinition, LicenseKind, PortSpec,
    ResourceRequirements, TransportKind,
};
use labfleet::domain::instance::{InstanceId, InstanceState, LabletInstance, Timeslot};
use labfleet::domain::worker::{Capacity, PortRange, Worker, WorkerId, WorkerState, WorkerTemplate};
use labfleet::ports::PortAllocator;
use labfleet::rewrite::rewrite;
use labfleet::scheduler::placement;
use labfleet::store::coord::MemCoordStore;
use labfleet::store::repo::Repo;

fn big_template() -> WorkerTemplate {
    WorkerTemplate {
        name: "prop".to_string(),
        instance_type: "metal".to_string(),
        image_id: "ami-prop".to_string(),
        capacity: Capacity {
            cpu_cores: 256,
            memory_gib: 1024,
            storage_gib: 4096,
            max_nodes: 400,
        },
        license: LicenseKind::Enterprise,
        image_family: None,
        region: "eu-west-1".to_string(),
        port_range: PortRange { lo: 5000, hi: 5063 },
        drain_timeout_secs: None,
    }
}

fn running_worker() -> Worker {
    let mut worker = Worker::from_template(&big_template(), "prop-w".to_string());
    worker.transition(WorkerState::Provisioning).unwrap();
    worker.transition(WorkerState::Running).unwrap();
    worker
}

fn test_definition(cpu: u32, mem: u32, ports: usize) -> LabletDefinition {
    LabletDefinition {
        id: DefinitionId::new(),
        name: "prop-def".to_string(),
        version: "1.0.0".to_string(),
        artifact: ArtifactRef {
            uri: "s3://labs/prop.json".to_string(),
            content_hash: "h".to_string(),
        },
        artifact_content: None,
        resources: ResourceRequirements {
            cpu_cores: cpu,
            memory_gib: mem,
            storage_gib: 1,
            nested_virt: false,
            image_family: None,
        },
        license_affinity: BTreeSet::from([LicenseKind::Enterprise]),
        node_count: 1,
        port_template: (0..ports)
            .map(|i| PortSpec {
                name: format!("p{}", i),
                transport: TransportKind::Tcp,
            })
            .collect(),
        grading_ruleset: None,
        max_session_secs: 3600,
        warm_pool_depth: 0,
        owner: "prop".to_string(),
        created_at: Utc::now(),
        deprecated: false,
    }
}

fn arb_capacity() -> impl Strategy<Value = Capacity> {
    (1u32..16, 1u32..32, 1u32..64, 1u32..8).prop_map(|(cpu, mem, storage, nodes)| Capacity {
        cpu_cores: cpu,
        memory_gib: mem,
        storage_gib: storage,
        max_nodes: nodes,
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Allocated capacity always equals the sum over
    /// assigned instances, and the instance list matches the model exactly.
    #[test]
    fn capacity_books_match_assignments(
        ops in prop::collection::vec((any::<bool>(), arb_capacity(), any::<prop::sample::Index>()), 1..48)
    ) {
        let mut worker = running_worker();
        let mut model: Vec<(InstanceId, Capacity)> = Vec::new();

        for (is_assign, capacity, index) in ops {
            if is_assign {
                let id = InstanceId::new();
                if worker.assign(id, capacity).is_ok() {
                    model.push((id, capacity));
                }
            } else if !model.is_empty() {
                let (id, capacity) = model.remove(index.index(model.len()));
                worker.unassign(id, capacity);
            }

            let expected = model
                .iter()
                .fold(Capacity::default(), |acc, (_, c)| acc.plus(c));
            prop_assert_eq!(worker.allocated, expected);
            prop_assert!(worker.declared.contains(&worker.allocated));
            let worker_ids: BTreeSet<_> = worker.instance_ids.iter().copied().collect();
            let model_ids: BTreeSet<_> = model.iter().map(|(id, _)| *id).collect();
            prop_assert_eq!(worker_ids, model_ids);
        }
    }

    /// A draining worker never takes an assignment.
    #[test]
    fn draining_worker_rejects_all_assignments(capacity in arb_capacity()) {
        let mut worker = running_worker();
        worker.transition(WorkerState::Draining).unwrap();
        prop_assert!(worker.assign(InstanceId::new(), capacity).is_err());
        prop_assert!(worker.instance_ids.is_empty());
    }

    /// No two allocations on a worker ever share a port, across
    /// arbitrary allocate/release interleavings.
    #[test]
    fn port_allocations_never_collide(
        ops in prop::collection::vec((any::<bool>(), 1usize..5, any::<prop::sample::Index>()), 1..24)
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        rt.block_on(async move {
            let repo = Repo::new(Arc::new(MemCoordStore::new()));
            let allocator = PortAllocator::new(repo.clone());
            let worker = running_worker();
            let worker_id = worker.id;
            repo.create_worker(&worker).await.unwrap();
            let mut live: Vec<InstanceId> = Vec::new();

            for (is_allocate, count, index) in ops {
                if is_allocate {
                    let id = InstanceId::new();
                    let specs: Vec<PortSpec> = (0..count)
                        .map(|i| PortSpec {
                            name: format!("p{}", i),
                            transport: TransportKind::Tcp,
                        })
                        .collect();
                    match allocator.allocate(worker_id, id, &specs).await {
                        Ok(_) => live.push(id),
                        Err(err) => {
                            // Only admissible failure here is range exhaustion
                            prop_assert!(matches!(
                                err,
                                labfleet::error::ControlError::CapacityExhausted(_)
                            ));
                        }
                    }
                } else if !live.is_empty() {
                    let id = live.remove(index.index(live.len()));
                    allocator.release(worker_id, id).await.unwrap();
                }

                let (current, _) = repo.get_worker(worker_id).await.unwrap().unwrap();
                let mut seen = BTreeSet::new();
                for allocation in &current.port_allocations {
                    for port in allocation.ports.values() {
                        prop_assert!(current.port_range.contains(*port));
                        prop_assert!(seen.insert(*port), "port {} allocated twice", port);
                    }
                }
            }
            Ok(())
        })?;
    }

    /// Arbitrary transition attempts never alter the pinned
    /// definition, and the recorded history is always a connected path in
    /// the lifecycle DAG.
    #[test]
    fn transition_history_is_a_dag_path(
        targets in prop::collection::vec(
            prop::sample::select(vec![
                InstanceState::Pending,
                InstanceState::Scheduled,
                InstanceState::Instantiating,
                InstanceState::Running,
                InstanceState::Collecting,
                InstanceState::Grading,
                InstanceState::Stopping,
                InstanceState::Stopped,
                InstanceState::Archived,
                InstanceState::Terminated,
            ]),
            1..32,
        )
    ) {
        let now = Utc::now();
        let mut instance = LabletInstance::new(
            DefinitionRef { name: "prop-def".to_string(), version: "3.1.4".to_string() },
            Timeslot { start: now, end: now + chrono::Duration::hours(1) },
            "prop".to_string(),
            "res-prop".to_string(),
        );
        let pinned = instance.definition.clone();

        for target in targets {
            let before = instance.state;
            match instance.transition(target, "prop") {
                Ok(()) => prop_assert!(before.successors().contains(&target)),
                Err(_) => prop_assert_eq!(instance.state, before),
            }
            prop_assert_eq!(&instance.definition, &pinned);
        }

        for window in instance.history.windows(2) {
            prop_assert_eq!(window[0].to, window[1].from);
        }
        for record in &instance.history {
            prop_assert!(record.from.successors().contains(&record.to));
        }
    }

    /// Placement is deterministic over a frozen fleet snapshot.
    #[test]
    fn placement_is_deterministic(
        frees in prop::collection::vec((1u32..200, 1u32..800), 1..12),
        cpu in 1u32..32,
        mem in 1u32..64,
    ) {
        let workers: Vec<Worker> = frees
            .iter()
            .enumerate()
            .map(|(i, (cpu_used, mem_used))| {
                let mut worker = running_worker();
                worker.id = WorkerId(uuid::Uuid::from_u128(i as u128 + 1));
                worker.allocated = Capacity {
                    cpu_cores: (*cpu_used).min(worker.declared.cpu_cores),
                    memory_gib: (*mem_used).min(worker.declared.memory_gib),
                    storage_gib: 0,
                    max_nodes: 0,
                };
                worker
            })
            .collect();
        let definition = test_definition(cpu, mem, 1);

        let first = placement::select(&workers, &definition).map(|w| w.id);
        let second = placement::select(&workers, &definition).map(|w| w.id);
        prop_assert_eq!(first, second);
    }

    /// Rewriting is idempotent for any port map.
    #[test]
    fn rewrite_is_idempotent(
        ports in prop::collection::btree_map("[a-z]{1,8}_[0-9]", 1024u16..9999, 0..6),
        extra_tag in "[ -~]{0,24}",
    ) {
        let tags: Vec<String> = ports
            .keys()
            .map(|name| format!("{}:${{PORT_{}}}", name, name.to_uppercase()))
            .chain(std::iter::once(extra_tag))
            .collect();
        let artifact = serde_json::json!({
            "title": "prop-lab",
            "nodes": [{"id": "n0", "tags": tags}],
            "annotations": [{"type": "text", "tags": ["${PORT_UNMAPPED}"], "labels": []}],
        });
        let ports: BTreeMap<String, u16> = ports;

        let once = rewrite(&artifact, &ports);
        let twice = rewrite(&once, &ports);
        prop_assert_eq!(&once, &twice);

        // Untouched fields survive unchanged
        prop_assert_eq!(&once["title"], &artifact["title"]);
        prop_assert_eq!(&once["annotations"][0]["tags"][0], "${PORT_UNMAPPED}");
    }
}

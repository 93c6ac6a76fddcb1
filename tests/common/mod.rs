//! Shared test harness: an assembled control plane over the in-memory
//! coordination store, a temp-dir document store, and the mock cloud.
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use labfleet::cloud::{CloudProvider, MockCloud};
use labfleet::config::ControlConfig;
use labfleet::controller::Reconciler;
use labfleet::domain::definition::{
    ArtifactRef, DefinitionId, DefinitionRef, LabletDefinition, LicenseKind, PortSpec,
    ResourceRequirements, TransportKind,
};
use labfleet::domain::event::{EventEnvelope, EventKind};
use labfleet::domain::instance::{LabletInstance, Timeslot};
use labfleet::domain::worker::{Capacity, PortRange, Worker, WorkerState, WorkerTemplate};
use labfleet::fanout::{EventFanout, Subscription};
use labfleet::scheduler::{LeaderElection, Scheduler};
use labfleet::service::{CreateInstanceParams, StateService};
use labfleet::store::cache::FleetCache;
use labfleet::store::coord::{CoordStore, MemCoordStore};
use labfleet::store::docs::DocStore;
use labfleet::store::repo::Repo;
use labfleet::telemetry::Metrics;

pub struct Harness {
    pub config: ControlConfig,
    pub repo: Repo,
    pub docs: Arc<DocStore>,
    pub fanout: Arc<EventFanout>,
    pub service: Arc<StateService>,
    pub cloud: Arc<MockCloud>,
    pub scheduler: Scheduler,
    pub reconciler: Reconciler,
    _dir: TempDir,
}

pub fn template() -> WorkerTemplate {
    WorkerTemplate {
        name: "vlab-large".to_string(),
        instance_type: "m5zn.metal".to_string(),
        image_id: "ami-0123".to_string(),
        capacity: Capacity {
            cpu_cores: 48,
            memory_gib: 192,
            storage_gib: 900,
            max_nodes: 60,
        },
        license: LicenseKind::Enterprise,
        image_family: None,
        region: "eu-west-1".to_string(),
        port_range: PortRange { lo: 5000, hi: 5999 },
        drain_timeout_secs: Some(3600),
    }
}

pub fn test_config() -> ControlConfig {
    let mut config = ControlConfig::default();
    config.templates = vec![template()];
    config
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: ControlConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let metrics = Metrics::new().expect("metrics");
        let coord: Arc<dyn CoordStore> = Arc::new(MemCoordStore::new());
        let docs = Arc::new(
            DocStore::open(dir.path().join("docs"), config.storage.definition_cache_ttl())
                .expect("doc store"),
        );
        for template in &config.templates {
            docs.put_template(template).expect("seed template");
        }
        let repo = Repo::new(Arc::clone(&coord));
        let fanout = Arc::new(EventFanout::new(
            config.fanout.clone(),
            Arc::clone(&docs),
            metrics.clone(),
        ));
        let service = Arc::new(StateService::new(
            repo.clone(),
            Arc::clone(&docs),
            Arc::clone(&fanout),
            metrics.clone(),
        ));
        let cache = Arc::new(FleetCache::new(repo.clone()));
        let cloud = Arc::new(MockCloud::new());
        let scheduler_leader = Arc::new(LeaderElection::new(
            Arc::clone(&coord),
            "scheduler",
            "test-node",
            config.scheduler.lease_ttl(),
        ));
        let controller_leader = Arc::new(LeaderElection::new(
            Arc::clone(&coord),
            "controller",
            "test-node",
            config.scheduler.lease_ttl(),
        ));
        let scheduler = Scheduler::new(
            Arc::clone(&service),
            cache,
            scheduler_leader,
            config.clone(),
        );
        let cloud_dyn: Arc<dyn CloudProvider> = cloud.clone();
        let reconciler = Reconciler::new(
            Arc::clone(&service),
            cloud_dyn,
            controller_leader,
            config.clone(),
        );
        Self {
            config,
            repo,
            docs,
            fanout,
            service,
            cloud,
            scheduler,
            reconciler,
            _dir: dir,
        }
    }

    /// Create a running worker backed by a booted mock machine.
    pub async fn seed_running_worker(&self, name: &str) -> Worker {
        let template = template();
        let cloud_id = self
            .cloud
            .create_instance(&template)
            .await
            .expect("create machine");
        self.cloud.boot_all();
        let mut worker = Worker::from_template(&template, name.to_string());
        worker.cloud_instance_id = Some(cloud_id);
        worker.transition(WorkerState::Provisioning).expect("provisioning");
        worker.transition(WorkerState::Running).expect("running");
        self.repo.create_worker(&worker).await.expect("persist worker");
        worker
    }

    /// Create a draining worker (no machine behind it needed for filters).
    pub async fn seed_draining_worker(&self, name: &str) -> Worker {
        let mut worker = Worker::from_template(&template(), name.to_string());
        worker.transition(WorkerState::Provisioning).expect("provisioning");
        worker.transition(WorkerState::Running).expect("running");
        worker.transition(WorkerState::Draining).expect("draining");
        worker.drain_deadline = Some(Utc::now() + Duration::hours(1));
        self.repo.create_worker(&worker).await.expect("persist worker");
        worker
    }

    pub async fn create_instance(
        &self,
        definition: &LabletDefinition,
        start_in: Duration,
    ) -> LabletInstance {
        let now = Utc::now();
        self.service
            .create_instance(CreateInstanceParams {
                definition: DefinitionRef {
                    name: definition.name.clone(),
                    version: definition.version.clone(),
                },
                timeslot: Timeslot {
                    start: now + start_in,
                    end: now + start_in + Duration::hours(2),
                },
                owner: "alice".to_string(),
                reservation_ref: "res-1".to_string(),
            })
            .await
            .expect("create instance")
    }
}

/// A definition builder with an artifact the rewriter can work on.
pub fn definition(name: &str, cpu: u32, mem: u32, port_names: &[&str]) -> LabletDefinition {
    LabletDefinition {
        id: DefinitionId::new(),
        name: name.to_string(),
        version: "1.0.0".to_string(),
        artifact: ArtifactRef {
            uri: format!("s3://labs/{}-1.0.0.json", name),
            content_hash: "sha256:feed".to_string(),
        },
        artifact_content: Some(serde_json::json!({
            "title": name,
            "nodes": [
                {"id": "n0", "label": "r1", "tags": port_names
                    .iter()
                    .map(|p| format!("{}:${{PORT_{}}}", p, p.to_uppercase()))
                    .collect::<Vec<_>>()},
            ],
            "annotations": [],
        })),
        resources: ResourceRequirements {
            cpu_cores: cpu,
            memory_gib: mem,
            storage_gib: 10,
            nested_virt: false,
            image_family: None,
        },
        license_affinity: BTreeSet::from([LicenseKind::Enterprise]),
        node_count: 2,
        port_template: port_names
            .iter()
            .map(|p| PortSpec {
                name: p.to_string(),
                transport: TransportKind::Tcp,
            })
            .collect(),
        grading_ruleset: None,
        max_session_secs: 7200,
        warm_pool_depth: 0,
        owner: "alice".to_string(),
        created_at: Utc::now(),
        deprecated: false,
    }
}

/// Drain everything currently buffered on a subscription.
pub fn drain_events(subscription: &mut Subscription) -> Vec<EventEnvelope> {
    let mut events = Vec::new();
    while let Ok(event) = subscription.rx.try_recv() {
        events.push(event);
    }
    events
}

/// Kinds of the buffered events, in order.
pub fn drained_kinds(subscription: &mut Subscription) -> Vec<EventKind> {
    drain_events(subscription).into_iter().map(|e| e.kind).collect()
}

//! Request and response shapes for the REST surface

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::definition::{
    ArtifactRef, DefinitionId, DefinitionRef, LabletDefinition, LicenseKind, PortSpec,
    ResourceRequirements,
};
use crate::domain::instance::{InstanceId, InstanceState, Timeslot};
use crate::domain::worker::{Capacity, Worker, WorkerId, WorkerState};

/// Body for `POST /v1/definitions`
#[derive(Debug, Clone, Deserialize)]
pub struct CreateDefinitionRequest {
    pub name: String,
    pub version: String,
    pub artifact: ArtifactRef,
    #[serde(default)]
    pub artifact_content: Option<Value>,
    pub resources: ResourceRequirements,
    pub license_affinity: BTreeSet<LicenseKind>,
    pub node_count: u32,
    #[serde(default)]
    pub port_template: Vec<PortSpec>,
    #[serde(default)]
    pub grading_ruleset: Option<String>,
    pub max_session_secs: u64,
    #[serde(default)]
    pub warm_pool_depth: u32,
    pub owner: String,
}

impl CreateDefinitionRequest {
    pub fn into_definition(self) -> LabletDefinition {
        LabletDefinition {
            id: DefinitionId::new(),
            name: self.name,
            version: self.version,
            artifact: self.artifact,
            artifact_content: self.artifact_content,
            resources: self.resources,
            license_affinity: self.license_affinity,
            node_count: self.node_count,
            port_template: self.port_template,
            grading_ruleset: self.grading_ruleset,
            max_session_secs: self.max_session_secs,
            warm_pool_depth: self.warm_pool_depth,
            owner: self.owner,
            created_at: Utc::now(),
            deprecated: false,
        }
    }
}

/// Query for `GET /v1/definitions`
#[derive(Debug, Default, Deserialize)]
pub struct ListDefinitionsQuery {
    pub name: Option<String>,
    pub owner: Option<String>,
    #[serde(default)]
    pub include_deprecated: bool,
}

/// Body for `POST /v1/definitions/{name}/{version}/sync`
#[derive(Debug, Deserialize)]
pub struct SyncDefinitionRequest {
    pub artifact_content: Value,
}

/// Body for `POST /v1/instances`
#[derive(Debug, Clone, Deserialize)]
pub struct CreateInstanceRequest {
    pub definition: DefinitionRef,
    pub timeslot: Timeslot,
    pub owner: String,
    pub reservation_ref: String,
}

/// Body for `POST /internal/instances/{id}/schedule`
#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub worker_id: WorkerId,
}

/// Body for `POST /internal/instances/{id}/transition`
#[derive(Debug, Deserialize)]
pub struct InstanceTransitionRequest {
    pub target: InstanceState,
}

/// Body for `POST /internal/workers/{id}/transition`
#[derive(Debug, Deserialize)]
pub struct WorkerTransitionRequest {
    pub target: WorkerState,
    #[serde(default)]
    pub drain_deadline: Option<DateTime<Utc>>,
}

/// Body for `POST /internal/workers/{id}/ports/allocate`
#[derive(Debug, Deserialize)]
pub struct AllocatePortsRequest {
    pub instance_id: InstanceId,
}

/// Body for `POST /internal/workers/scale-up`
#[derive(Debug, Deserialize)]
pub struct ScaleUpRequest {
    pub template: String,
    pub instance_id: InstanceId,
    #[serde(default = "default_scale_reason")]
    pub reason: String,
}

fn default_scale_reason() -> String {
    "operator".to_string()
}

/// Body for `POST /internal/workers/import`
#[derive(Debug, Deserialize)]
pub struct ImportWorkerRequest {
    pub template: String,
    pub name: String,
    pub cloud_instance_id: String,
}

/// Per-worker entry in `GET /v1/capacity`
#[derive(Debug, Serialize)]
pub struct WorkerCapacity {
    pub worker_id: WorkerId,
    pub name: String,
    pub status: WorkerState,
    pub declared: Capacity,
    pub allocated: Capacity,
    pub available: Capacity,
    pub free_ports: usize,
}

impl From<&Worker> for WorkerCapacity {
    fn from(worker: &Worker) -> Self {
        Self {
            worker_id: worker.id,
            name: worker.name.clone(),
            status: worker.status,
            declared: worker.declared,
            allocated: worker.allocated,
            available: worker.available(),
            free_ports: worker.free_port_count(),
        }
    }
}

/// Response for `GET /v1/capacity`
#[derive(Debug, Serialize)]
pub struct CapacityResponse {
    pub workers: Vec<WorkerCapacity>,
    pub total_declared: Capacity,
    pub total_allocated: Capacity,
}

/// Accepted-but-pending body (capacity exhaustion maps to 202)
#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub status: &'static str,
    pub detail: String,
}

/// Error body with an audit id for the operational log
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub audit_id: Uuid,
}

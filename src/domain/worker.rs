//! Workers: heavy compute hosts that run lablets, and their templates

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::definition::{LabletDefinition, LicenseKind};
use crate::domain::instance::InstanceId;
use crate::error::{ControlError, ControlResult};

/// Unique identifier for a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    /// Generate a new worker ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from string
    pub fn parse_str(s: &str) -> ControlResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ControlError::ContractViolation(format!("invalid worker id: {}", e)))
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Worker lifecycle state.
///
/// `draining` is entered only from `running`; a draining worker accepts no
/// new assignments and proceeds to `stopping` once empty or once its drain
/// deadline elapses. `terminated` is absorbing. The direct
/// `pending`/`provisioning` to `terminated` edges quarantine workers that
/// never reached `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Pending,
    Provisioning,
    Running,
    Draining,
    Stopping,
    Stopped,
    Terminated,
}

impl WorkerState {
    /// States the lifecycle may legally move to from `self`.
    pub fn successors(self) -> &'static [WorkerState] {
        use WorkerState::*;
        match self {
            Pending => &[Provisioning, Terminated],
            Provisioning => &[Running, Terminated],
            Running => &[Draining, Stopping],
            Draining => &[Stopping],
            Stopping => &[Stopped],
            Stopped => &[Terminated],
            Terminated => &[],
        }
    }

    /// Whether this state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Terminated)
    }

    pub fn as_str(self) -> &'static str {
        use WorkerState::*;
        match self {
            Pending => "pending",
            Provisioning => "provisioning",
            Running => "running",
            Draining => "draining",
            Stopping => "stopping",
            Stopped => "stopped",
            Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Declared or allocated capacity along the four scheduling dimensions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub cpu_cores: u32,
    pub memory_gib: u32,
    pub storage_gib: u32,
    pub max_nodes: u32,
}

impl Capacity {
    /// Whether every dimension of `other` fits within `self`.
    pub fn contains(&self, other: &Capacity) -> bool {
        self.cpu_cores >= other.cpu_cores
            && self.memory_gib >= other.memory_gib
            && self.storage_gib >= other.storage_gib
            && self.max_nodes >= other.max_nodes
    }

    /// Saturating per-dimension addition.
    pub fn plus(&self, other: &Capacity) -> Capacity {
        Capacity {
            cpu_cores: self.cpu_cores.saturating_add(other.cpu_cores),
            memory_gib: self.memory_gib.saturating_add(other.memory_gib),
            storage_gib: self.storage_gib.saturating_add(other.storage_gib),
            max_nodes: self.max_nodes.saturating_add(other.max_nodes),
        }
    }

    /// Saturating per-dimension subtraction.
    pub fn minus(&self, other: &Capacity) -> Capacity {
        Capacity {
            cpu_cores: self.cpu_cores.saturating_sub(other.cpu_cores),
            memory_gib: self.memory_gib.saturating_sub(other.memory_gib),
            storage_gib: self.storage_gib.saturating_sub(other.storage_gib),
            max_nodes: self.max_nodes.saturating_sub(other.max_nodes),
        }
    }

    /// Capacity a single instance of `definition` consumes.
    pub fn required_for(definition: &LabletDefinition) -> Capacity {
        Capacity {
            cpu_cores: definition.resources.cpu_cores,
            memory_gib: definition.resources.memory_gib,
            storage_gib: definition.resources.storage_gib,
            max_nodes: definition.node_count,
        }
    }
}

/// Inclusive port range a worker exposes for lablet endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.lo && port <= self.hi
    }

    pub fn len(&self) -> usize {
        if self.hi < self.lo {
            0
        } else {
            (self.hi - self.lo) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ports leased to one instance on one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocation {
    pub instance_id: InstanceId,
    /// Placeholder name to concrete port
    pub ports: BTreeMap<String, u16>,
    pub allocated_at: DateTime<Utc>,
}

/// Telemetry snapshot observed from the cloud adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTelemetry {
    pub cpu_pct: f32,
    pub memory_pct: f32,
    pub storage_pct: f32,
    pub active_labs: u32,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
}

/// Template a worker is stamped from, seeded from configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTemplate {
    pub name: String,
    pub instance_type: String,
    pub image_id: String,
    pub capacity: Capacity,
    pub license: LicenseKind,
    #[serde(default)]
    pub image_family: Option<String>,
    pub region: String,
    pub port_range: PortRange,
    /// Per-template drain timeout in seconds; falls back to
    /// `controller.drain_timeout_default` when absent
    #[serde(default)]
    pub drain_timeout_secs: Option<u64>,
}

impl WorkerTemplate {
    /// Validate the template at startup; errors refuse process start.
    pub fn validate(&self) -> ControlResult<()> {
        if self.name.is_empty() {
            return Err(ControlError::Config("worker template with empty name".to_string()));
        }
        if self.port_range.hi < self.port_range.lo {
            return Err(ControlError::Config(format!(
                "template {}: invalid port range [{}, {}]",
                self.name, self.port_range.lo, self.port_range.hi
            )));
        }
        if self.capacity.cpu_cores == 0 || self.capacity.memory_gib == 0 {
            return Err(ControlError::Config(format!(
                "template {}: declared capacity must be non-zero",
                self.name
            )));
        }
        Ok(())
    }

    /// Whether a worker from this template could host `definition` at all.
    pub fn satisfies(&self, definition: &LabletDefinition) -> bool {
        definition.license_affinity.contains(&self.license)
            && self.capacity.contains(&Capacity::required_for(definition))
            && self.port_range.len() >= definition.port_template.len()
    }
}

/// A heavy compute host capable of running multiple lablets concurrently.
///
/// Created by auto-scale or explicit import; mutated by the controller;
/// destroyed on terminal state after archival.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    pub region: String,
    pub cloud_instance_id: Option<String>,
    pub instance_type: String,
    pub image_id: String,
    pub status: WorkerState,
    #[serde(default)]
    pub telemetry: Option<WorkerTelemetry>,
    pub declared: Capacity,
    pub allocated: Capacity,
    pub license: LicenseKind,
    pub port_range: PortRange,
    pub port_allocations: Vec<PortAllocation>,
    pub instance_ids: Vec<InstanceId>,
    pub template: String,
    #[serde(default)]
    pub image_family: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub provisioned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    /// Set when the worker enters `draining`
    #[serde(default)]
    pub drain_deadline: Option<DateTime<Utc>>,
    /// Next telemetry refresh; the stored value is authoritative
    #[serde(default)]
    pub next_refresh_at: Option<DateTime<Utc>>,
    /// Operator toggle: exclude this worker from scale-down candidacy
    #[serde(default)]
    pub scale_down_exempt: bool,
}

impl Worker {
    /// Stamp a new worker from a template, in `pending`.
    pub fn from_template(template: &WorkerTemplate, name: String) -> Self {
        Self {
            id: WorkerId::new(),
            name,
            region: template.region.clone(),
            cloud_instance_id: None,
            instance_type: template.instance_type.clone(),
            image_id: template.image_id.clone(),
            status: WorkerState::Pending,
            telemetry: None,
            declared: template.capacity,
            allocated: Capacity::default(),
            license: template.license,
            port_range: template.port_range,
            port_allocations: Vec::new(),
            instance_ids: Vec::new(),
            template: template.name.clone(),
            image_family: template.image_family.clone(),
            created_at: Utc::now(),
            provisioned_at: None,
            stopped_at: None,
            drain_deadline: None,
            next_refresh_at: None,
            scale_down_exempt: false,
        }
    }

    /// Capacity still unallocated on this worker.
    pub fn available(&self) -> Capacity {
        self.declared.minus(&self.allocated)
    }

    /// Number of ports not currently leased.
    pub fn free_port_count(&self) -> usize {
        let used: usize = self.port_allocations.iter().map(|a| a.ports.len()).sum();
        self.port_range.len().saturating_sub(used)
    }

    /// All ports currently leased, across allocations.
    pub fn used_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .port_allocations
            .iter()
            .flat_map(|a| a.ports.values().copied())
            .collect();
        ports.sort_unstable();
        ports
    }

    /// Apply a guarded lifecycle transition.
    pub fn transition(&mut self, to: WorkerState) -> ControlResult<()> {
        if !self.status.successors().contains(&to) {
            return Err(ControlError::InvalidTransition {
                entity: format!("worker {}", self.id),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        match to {
            WorkerState::Running => self.provisioned_at = Some(Utc::now()),
            WorkerState::Stopped => self.stopped_at = Some(Utc::now()),
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    /// Record an assignment, growing allocated capacity and the instance
    /// list together so the two never disagree.
    pub fn assign(&mut self, instance_id: InstanceId, required: Capacity) -> ControlResult<()> {
        if self.status == WorkerState::Draining {
            return Err(ControlError::CapacityExhausted(format!(
                "worker {} is draining",
                self.id
            )));
        }
        let next = self.allocated.plus(&required);
        if !self.declared.contains(&next) {
            return Err(ControlError::CapacityExhausted(format!(
                "worker {} cannot fit instance {}",
                self.id, instance_id
            )));
        }
        if !self.instance_ids.contains(&instance_id) {
            self.instance_ids.push(instance_id);
        }
        self.allocated = next;
        Ok(())
    }

    /// Release an assignment and its capacity.
    pub fn unassign(&mut self, instance_id: InstanceId, required: Capacity) {
        self.instance_ids.retain(|id| *id != instance_id);
        self.allocated = self.allocated.minus(&required);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::definition::{ArtifactRef, DefinitionId, ResourceRequirements};

    fn template() -> WorkerTemplate {
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

    fn definition() -> LabletDefinition {
        LabletDefinition {
            id: DefinitionId::new(),
            name: "routing-basics".to_string(),
            version: "1.0.0".to_string(),
            artifact: ArtifactRef {
                uri: "s3://labs/x.json".to_string(),
                content_hash: "h".to_string(),
            },
            artifact_content: None,
            resources: ResourceRequirements {
                cpu_cores: 4,
                memory_gib: 8,
                storage_gib: 20,
                nested_virt: false,
                image_family: None,
            },
            license_affinity: [LicenseKind::Enterprise].into_iter().collect(),
            node_count: 3,
            port_template: Vec::new(),
            grading_ruleset: None,
            max_session_secs: 3600,
            warm_pool_depth: 0,
            owner: "alice".to_string(),
            created_at: Utc::now(),
            deprecated: false,
        }
    }

    #[test]
    fn assign_rejects_over_allocation() {
        let mut worker = Worker::from_template(&template(), "w1".to_string());
        worker.transition(WorkerState::Provisioning).unwrap();
        worker.transition(WorkerState::Running).unwrap();
        let huge = Capacity {
            cpu_cores: 64,
            memory_gib: 8,
            storage_gib: 10,
            max_nodes: 1,
        };
        assert!(worker.assign(InstanceId::new(), huge).is_err());
        assert!(worker.instance_ids.is_empty());
    }

    #[test]
    fn assign_rejects_draining_worker() {
        let mut worker = Worker::from_template(&template(), "w1".to_string());
        worker.transition(WorkerState::Provisioning).unwrap();
        worker.transition(WorkerState::Running).unwrap();
        worker.transition(WorkerState::Draining).unwrap();
        let req = Capacity {
            cpu_cores: 1,
            memory_gib: 1,
            storage_gib: 1,
            max_nodes: 1,
        };
        assert!(worker.assign(InstanceId::new(), req).is_err());
    }

    #[test]
    fn assign_and_unassign_are_symmetric() {
        let mut worker = Worker::from_template(&template(), "w1".to_string());
        worker.transition(WorkerState::Provisioning).unwrap();
        worker.transition(WorkerState::Running).unwrap();
        let req = Capacity::required_for(&definition());
        let id = InstanceId::new();
        worker.assign(id, req).unwrap();
        assert_eq!(worker.allocated.cpu_cores, 4);
        assert!(worker.instance_ids.contains(&id));
        worker.unassign(id, req);
        assert_eq!(worker.allocated, Capacity::default());
        assert!(worker.instance_ids.is_empty());
    }

    #[test]
    fn draining_only_from_running() {
        let mut worker = Worker::from_template(&template(), "w1".to_string());
        let err = worker.transition(WorkerState::Draining).unwrap_err();
        assert!(matches!(err, ControlError::InvalidTransition { .. }));
    }

    #[test]
    fn template_satisfies_checks_license_and_fit() {
        let tpl = template();
        let def = definition();
        assert!(tpl.satisfies(&def));
        let mut edu = def.clone();
        edu.license_affinity = [LicenseKind::Education].into_iter().collect();
        assert!(!tpl.satisfies(&edu));
    }
}

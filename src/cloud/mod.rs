//! Cloud provider abstraction.
//!
//! One capability set, implemented per provider. Adapters declare a
//! per-call timeout and classify failures into the control plane's error
//! kinds (transient vs. contract violation); they never cache across
//! calls, since caching is the controller's concern.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::worker::WorkerTemplate;
use crate::error::ControlResult;

pub mod mock;

pub use mock::MockCloud;

/// Machine state as the provider reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudInstanceState {
    Pending,
    Booting,
    Running,
    Stopping,
    Stopped,
    Terminated,
}

/// Status snapshot for one machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudInstanceStatus {
    pub state: CloudInstanceState,
    /// Whether the provider's readiness checks pass
    pub checks_passed: bool,
}

/// Utilization metrics over a sampling window
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InstanceMetrics {
    pub cpu_pct: f32,
    pub memory_pct: f32,
    pub storage_pct: f32,
}

/// One machine in a listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudInstanceSummary {
    pub id: String,
    pub state: CloudInstanceState,
    pub instance_type: String,
    pub region: String,
}

/// Listing filter
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub region: Option<String>,
    pub instance_type: Option<String>,
}

/// The capability set the controller drives machines and labs through.
#[async_trait]
pub trait CloudProvider: Send + Sync + 'static {
    /// Deadline applied to every outbound call on this adapter.
    fn call_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Launch a machine from a worker template; returns the provider's id.
    async fn create_instance(&self, template: &WorkerTemplate) -> ControlResult<String>;

    async fn start_instance(&self, id: &str) -> ControlResult<()>;

    async fn stop_instance(&self, id: &str) -> ControlResult<()>;

    async fn terminate_instance(&self, id: &str) -> ControlResult<()>;

    async fn instance_status(&self, id: &str) -> ControlResult<CloudInstanceStatus>;

    async fn instance_metrics(&self, id: &str, window: Duration) -> ControlResult<InstanceMetrics>;

    async fn list_instances(&self, filter: &ListFilter) -> ControlResult<Vec<CloudInstanceSummary>>;

    /// Upload a (rewritten) lab artifact to a machine; returns the backend
    /// lab id.
    async fn import_lab(&self, instance_id: &str, artifact: &Value) -> ControlResult<String>;

    async fn start_lab(&self, instance_id: &str, lab_id: &str) -> ControlResult<()>;

    async fn stop_lab(&self, instance_id: &str, lab_id: &str) -> ControlResult<()>;

    async fn wipe_lab(&self, instance_id: &str, lab_id: &str) -> ControlResult<()>;

    /// Labs the machine currently reports as running.
    async fn list_labs(&self, instance_id: &str) -> ControlResult<Vec<String>>;
}

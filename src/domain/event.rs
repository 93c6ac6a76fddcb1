//! Domain event catalogue and envelope

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::domain::instance::{InstanceState, LabletInstance};
use crate::domain::worker::{Worker, WorkerState};

/// Schema version stamped on every envelope
pub const SCHEMA_VERSION: u16 = 1;

/// Component that committed the change an event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Api,
    Scheduler,
    Controller,
    System,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Component::Api => "api",
            Component::Scheduler => "scheduler",
            Component::Controller => "controller",
            Component::System => "system",
        };
        write!(f, "{}", s)
    }
}

/// Every event type the push channel can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    DefinitionCreated,
    DefinitionVersionCreated,
    DefinitionDeprecated,
    InstancePending,
    InstanceScheduled,
    InstanceProvisioningStarted,
    InstanceRunning,
    InstanceCollectingStarted,
    InstanceGradingStarted,
    InstanceGradingCompleted,
    InstanceStopping,
    InstanceStopped,
    InstanceArchived,
    InstanceTerminated,
    WorkerPending,
    WorkerProvisioningStarted,
    WorkerRunning,
    WorkerDraining,
    WorkerStopping,
    WorkerStopped,
    WorkerTerminated,
    ScalingUpRequested,
    ScalingUpCompleted,
    ScalingDownRequested,
    ScalingDownCompleted,
    Heartbeat,
    Connected,
    Shutdown,
}

impl EventKind {
    /// Dotted wire name used in the SSE `event:` field.
    pub fn as_str(self) -> &'static str {
        use EventKind::*;
        match self {
            DefinitionCreated => "definition.created",
            DefinitionVersionCreated => "definition.version.created",
            DefinitionDeprecated => "definition.deprecated",
            InstancePending => "instance.pending",
            InstanceScheduled => "instance.scheduled",
            InstanceProvisioningStarted => "instance.provisioning.started",
            InstanceRunning => "instance.running",
            InstanceCollectingStarted => "instance.collecting.started",
            InstanceGradingStarted => "instance.grading.started",
            InstanceGradingCompleted => "instance.grading.completed",
            InstanceStopping => "instance.stopping",
            InstanceStopped => "instance.stopped",
            InstanceArchived => "instance.archived",
            InstanceTerminated => "instance.terminated",
            WorkerPending => "worker.pending",
            WorkerProvisioningStarted => "worker.provisioning.started",
            WorkerRunning => "worker.running",
            WorkerDraining => "worker.draining",
            WorkerStopping => "worker.stopping",
            WorkerStopped => "worker.stopped",
            WorkerTerminated => "worker.terminated",
            ScalingUpRequested => "scaling.up.requested",
            ScalingUpCompleted => "scaling.up.completed",
            ScalingDownRequested => "scaling.down.requested",
            ScalingDownCompleted => "scaling.down.completed",
            Heartbeat => "heartbeat",
            Connected => "connected",
            Shutdown => "shutdown",
        }
    }

    /// The event announcing that an instance entered `state`.
    pub fn for_instance_state(state: InstanceState) -> EventKind {
        use InstanceState::*;
        match state {
            Pending => EventKind::InstancePending,
            Scheduled => EventKind::InstanceScheduled,
            Instantiating => EventKind::InstanceProvisioningStarted,
            Running => EventKind::InstanceRunning,
            Collecting => EventKind::InstanceCollectingStarted,
            Grading => EventKind::InstanceGradingStarted,
            Stopping => EventKind::InstanceStopping,
            Stopped => EventKind::InstanceStopped,
            Archived => EventKind::InstanceArchived,
            Terminated => EventKind::InstanceTerminated,
        }
    }

    /// The event announcing that a worker entered `state`.
    pub fn for_worker_state(state: WorkerState) -> EventKind {
        use WorkerState::*;
        match state {
            Pending => EventKind::WorkerPending,
            Provisioning => EventKind::WorkerProvisioningStarted,
            Running => EventKind::WorkerRunning,
            Draining => EventKind::WorkerDraining,
            Stopping => EventKind::WorkerStopping,
            Stopped => EventKind::WorkerStopped,
            Terminated => EventKind::WorkerTerminated,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Grading outcome delivered by the assessment collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingScore {
    pub total: f64,
    pub max: f64,
    pub passed: bool,
}

/// Envelope every published event is wrapped in.
///
/// `data` is a typed object per kind; the constructors below produce the
/// required fields for each.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    pub source: Component,
    pub schema_version: u16,
    pub data: Value,
}

impl EventEnvelope {
    pub fn new(kind: EventKind, source: Component, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            occurred_at: Utc::now(),
            source,
            schema_version: SCHEMA_VERSION,
            data,
        }
    }

    /// Lifecycle event for an instance entering its current state.
    pub fn for_instance(instance: &LabletInstance, source: Component) -> Self {
        let kind = EventKind::for_instance_state(instance.state);
        let mut data = json!({
            "instance_id": instance.id,
            "definition": instance.definition,
            "state": instance.state,
            "owner": instance.owner,
            "reservation_ref": instance.reservation_ref,
        });
        if let Some(worker_id) = instance.worker_id {
            data["worker_id"] = json!(worker_id);
        }
        if kind == EventKind::InstanceScheduled {
            data["allocated_ports"] = json!(instance.allocated_ports);
        }
        if kind == EventKind::InstanceGradingCompleted {
            data["score"] = json!(instance.grading_score);
        }
        if let Some(reason) = &instance.last_failure {
            data["reason"] = json!(reason);
        }
        Self::new(kind, source, data)
    }

    /// Explicit grading-completed event carrying the score object.
    pub fn grading_completed(instance: &LabletInstance, source: Component) -> Self {
        Self::new(
            EventKind::InstanceGradingCompleted,
            source,
            json!({
                "instance_id": instance.id,
                "definition": instance.definition,
                "score": instance.grading_score,
            }),
        )
    }

    /// Lifecycle event for a worker entering its current state.
    pub fn for_worker(worker: &Worker, source: Component) -> Self {
        let kind = EventKind::for_worker_state(worker.status);
        let mut data = json!({
            "worker_id": worker.id,
            "name": worker.name,
            "template": worker.template,
            "status": worker.status,
            "region": worker.region,
        });
        if let Some(deadline) = worker.drain_deadline {
            data["drain_deadline"] = json!(deadline);
            // A stop that happens past the deadline was forced by it
            if worker.status == WorkerState::Stopping && Utc::now() >= deadline {
                data["drain_timed_out"] = json!(true);
            }
        }
        Self::new(kind, source, data)
    }

    /// Scale-up request naming the chosen template and triggering instance.
    pub fn scale_up_requested(
        template: &str,
        instance_id: crate::domain::instance::InstanceId,
        reason: &str,
        source: Component,
    ) -> Self {
        Self::new(
            EventKind::ScalingUpRequested,
            source,
            json!({
                "template": template,
                "instance_id": instance_id,
                "reason": reason,
            }),
        )
    }

    /// Entity id the event is about, when it is about one.
    ///
    /// Used by the fan-out to preserve per-entity ordering and by the audit
    /// sink for aggregate indexing.
    pub fn aggregate_id(&self) -> Option<String> {
        self.data
            .get("instance_id")
            .or_else(|| self.data.get("worker_id"))
            .or_else(|| self.data.get("definition_id"))
            .and_then(|v| v.as_str().map(str::to_string))
    }
}

/// Events consumed from the assessment collaborator
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    /// `collection.completed`: lab artifacts were gathered
    #[serde(rename = "collection.completed")]
    CollectionCompleted {
        instance_id: crate::domain::instance::InstanceId,
        artifacts_uri: String,
    },
    /// `grading.completed`: the grader produced a score
    #[serde(rename = "grading.completed")]
    GradingCompleted {
        instance_id: crate::domain::instance::InstanceId,
        score: GradingScore,
    },
}

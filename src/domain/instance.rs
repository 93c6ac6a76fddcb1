//! Lablet instances and their lifecycle state machine

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::definition::DefinitionRef;
use crate::domain::event::GradingScore;
use crate::domain::worker::WorkerId;
use crate::error::{ControlError, ControlResult};

/// Unique identifier for a lablet instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    /// Generate a new instance ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from string
    pub fn parse_str(s: &str) -> ControlResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ControlError::ContractViolation(format!("invalid instance id: {}", e)))
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Instance lifecycle state.
///
/// States form a DAG; see [`InstanceState::successors`] for the legal edges.
/// `pending` is re-entered only through drift correction when an assignment
/// is lost before the instance reaches `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Pending,
    Scheduled,
    Instantiating,
    Running,
    Collecting,
    Grading,
    Stopping,
    Stopped,
    Archived,
    Terminated,
}

impl InstanceState {
    /// States the lifecycle may legally move to from `self`.
    pub fn successors(self) -> &'static [InstanceState] {
        use InstanceState::*;
        match self {
            Pending => &[Scheduled],
            Scheduled => &[Instantiating, Pending],
            Instantiating => &[Running, Stopping, Pending],
            Running => &[Collecting, Stopping],
            Collecting => &[Grading, Stopping],
            Grading => &[Stopping],
            Stopping => &[Stopped],
            Stopped => &[Archived],
            Archived => &[Terminated],
            Terminated => &[],
        }
    }

    /// Whether an instance in this state still occupies worker capacity.
    pub fn is_active(self) -> bool {
        use InstanceState::*;
        matches!(self, Scheduled | Instantiating | Running | Collecting | Grading)
    }

    /// Whether this state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Terminated)
    }

    pub fn as_str(self) -> &'static str {
        use InstanceState::*;
        match self {
            Pending => "pending",
            Scheduled => "scheduled",
            Instantiating => "instantiating",
            Running => "running",
            Collecting => "collecting",
            Grading => "grading",
            Stopping => "stopping",
            Stopped => "stopped",
            Archived => "archived",
            Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One recorded state transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: InstanceState,
    pub to: InstanceState,
    pub at: DateTime<Utc>,
    pub actor: String,
}

/// The interval during which a user is expected to interact with an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeslot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A runtime lablet instance.
///
/// Created by the API in `pending`; mutated only by the scheduler
/// (assignment) and the controller (lifecycle transitions); destroyed after
/// archival. The definition reference is pinned at creation and never
/// changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabletInstance {
    pub id: InstanceId,
    pub definition: DefinitionRef,
    pub worker_id: Option<WorkerId>,
    /// Placeholder name to concrete port, set when placement commits
    pub allocated_ports: Option<BTreeMap<String, u16>>,
    /// Opaque lab id returned by the worker backend
    pub backend_lab_id: Option<String>,
    pub state: InstanceState,
    pub history: Vec<TransitionRecord>,
    pub timeslot: Timeslot,
    pub owner: String,
    pub reservation_ref: String,
    #[serde(default)]
    pub collected_artifacts_uri: Option<String>,
    #[serde(default)]
    pub grading_score: Option<GradingScore>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub running_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub terminated_at: Option<DateTime<Utc>>,
    /// Instantiation attempts consumed against the retry budget
    #[serde(default)]
    pub instantiation_attempts: u32,
    /// Human-readable reason for the most recent failure, if any
    #[serde(default)]
    pub last_failure: Option<String>,
}

impl LabletInstance {
    /// Create a new instance in `pending`.
    pub fn new(
        definition: DefinitionRef,
        timeslot: Timeslot,
        owner: String,
        reservation_ref: String,
    ) -> Self {
        Self {
            id: InstanceId::new(),
            definition,
            worker_id: None,
            allocated_ports: None,
            backend_lab_id: None,
            state: InstanceState::Pending,
            history: Vec::new(),
            timeslot,
            owner,
            reservation_ref,
            collected_artifacts_uri: None,
            grading_score: None,
            created_at: Utc::now(),
            scheduled_at: None,
            running_at: None,
            terminated_at: None,
            instantiation_attempts: 0,
            last_failure: None,
        }
    }

    /// Apply a guarded transition, recording it with wall-clock time and actor.
    pub fn transition(&mut self, to: InstanceState, actor: &str) -> ControlResult<()> {
        if !self.state.successors().contains(&to) {
            return Err(ControlError::InvalidTransition {
                entity: format!("instance {}", self.id),
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        let now = Utc::now();
        self.history.push(TransitionRecord {
            from: self.state,
            to,
            at: now,
            actor: actor.to_string(),
        });
        match to {
            InstanceState::Scheduled => self.scheduled_at = Some(now),
            InstanceState::Running => self.running_at = Some(now),
            InstanceState::Terminated => self.terminated_at = Some(now),
            InstanceState::Pending => {
                // Drift reset: the assignment is gone
                self.worker_id = None;
                self.allocated_ports = None;
                self.scheduled_at = None;
            }
            _ => {}
        }
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn instance() -> LabletInstance {
        let now = Utc::now();
        LabletInstance::new(
            DefinitionRef {
                name: "routing-basics".to_string(),
                version: "1.0.0".to_string(),
            },
            Timeslot {
                start: now + Duration::minutes(30),
                end: now + Duration::minutes(90),
            },
            "alice".to_string(),
            "res-42".to_string(),
        )
    }

    #[test]
    fn happy_path_is_a_dag_walk() {
        let mut inst = instance();
        for to in [
            InstanceState::Scheduled,
            InstanceState::Instantiating,
            InstanceState::Running,
            InstanceState::Collecting,
            InstanceState::Grading,
            InstanceState::Stopping,
            InstanceState::Stopped,
            InstanceState::Archived,
            InstanceState::Terminated,
        ] {
            inst.transition(to, "test").unwrap();
        }
        assert_eq!(inst.history.len(), 9);
        assert!(inst.terminated_at.is_some());
    }

    #[test]
    fn illegal_edge_carries_both_states() {
        let mut inst = instance();
        let err = inst.transition(InstanceState::Running, "test").unwrap_err();
        match err {
            ControlError::InvalidTransition { from, to, .. } => {
                assert_eq!(from, "pending");
                assert_eq!(to, "running");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn drift_reset_clears_assignment() {
        let mut inst = instance();
        inst.transition(InstanceState::Scheduled, "scheduler").unwrap();
        inst.worker_id = Some(WorkerId::new());
        inst.allocated_ports = Some(BTreeMap::from([("serial_1".to_string(), 5041)]));
        inst.transition(InstanceState::Pending, "controller").unwrap();
        assert!(inst.worker_id.is_none());
        assert!(inst.allocated_ports.is_none());
    }

    #[test]
    fn terminated_is_absorbing() {
        assert!(InstanceState::Terminated.successors().is_empty());
    }
}

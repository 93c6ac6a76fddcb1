//! Domain model: entities, state machines, and the event catalogue.
//!
//! Each entity is a value record plus a tagged state enum; transitions are
//! guarded methods that return a typed error on an illegal edge and append
//! to the entity's transition history. The coordination store is the source
//! of truth; everything here is plain data that serializes to JSON.

pub mod definition;
pub mod event;
pub mod instance;
pub mod worker;

pub use definition::{
    ArtifactRef, DefinitionId, DefinitionRef, LabletDefinition, LicenseKind, PortSpec,
    ResourceRequirements, TransportKind,
};
pub use event::{
    Component, EventEnvelope, EventKind, GradingScore, InboundEvent, SCHEMA_VERSION,
};
pub use instance::{InstanceId, InstanceState, LabletInstance, Timeslot, TransitionRecord};
pub use worker::{
    Capacity, PortAllocation, PortRange, Worker, WorkerId, WorkerState, WorkerTelemetry,
    WorkerTemplate,
};

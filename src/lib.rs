//! Control plane for fleets of heavy virtual-lab workers.
//!
//! labfleet accepts declarative reservations for short-lived lab instances
//! ("lablets"), places them onto workers with sufficient capacity, drives
//! workers through their lifecycle, and scales the fleet around approaching
//! timeslots.
//!
//! The crate is organized around three subsystems:
//!
//! - the state substrate ([`store`]): a watch-capable coordination store plus
//!   a sled-backed document store;
//! - the placement scheduler ([`scheduler`]): filter/score/assign under
//!   capacity, port, licensing, and affinity constraints, coordinated across
//!   replicas by lease-based leader election;
//! - the reconciliation controller ([`controller`]): periodic desired vs.
//!   observed diffing, worker lifecycle and draining, scale-up/scale-down.
//!
//! State changes fan out to subscribers through [`fanout`] and the SSE
//! endpoint in [`api`].

pub mod api;
pub mod cloud;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod fanout;
pub mod ports;
pub mod rewrite;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod store;
pub mod telemetry;

pub use config::ControlConfig;
pub use error::{ControlError, ControlResult};
pub use service::StateService;

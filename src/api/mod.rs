//! HTTP adapter: a thin axum surface over the [`StateService`] facade plus
//! the SSE push channel.
//!
//! The adapter is the single writer to the state substrate; the scheduler
//! and controller request their mutations through the same service methods
//! the internal endpoints expose.

pub mod models;
pub mod rest;
pub mod sse;

pub use rest::{router, ApiContext};

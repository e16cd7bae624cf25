//! Barrier Kernel - rendezvous engine for tree-shaped workflow executions.
//!
//! Branches of a plan (plan → stage → step-group → step) progress
//! independently and meet at named barriers. This crate registers barrier
//! membership from a plan definition, binds it to runtime execution ids as
//! the plan runs, and resolves each barrier exactly once through a
//! hierarchical readiness tree, either on demand or from a background poller.

#![warn(clippy::pedantic)]

/// Barrier domain: types, forcer tree, state machine, registration service.
pub mod barrier;
/// Infrastructure components (config, audit, telemetry).
pub mod infrastructure;
/// Background resolution of standing barriers.
pub mod poller;
/// Process wiring.
pub mod runtime;
/// SQL store, named locks and adapters.
pub mod store;

pub use runtime::BarrierKernel;

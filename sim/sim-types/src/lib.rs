//! Core types for the quickstep constraint solver.
//!
//! This crate provides the data shared between a simulation world and the
//! solver that advances it:
//!
//! - [`RigidBody`] - Pose, velocity, mass, inertia and force accumulators
//! - [`MassProperties`] - Mass and body-frame inertia presets
//! - [`Gravity`] - World gravity field
//! - [`WorldConfig`] / [`QuickStepConfig`] - Per-step solver parameters
//! - [`SimError`] - Errors surfaced by validation and stepping
//!
//! # Design Philosophy
//!
//! These types are **pure data**. Solver policy is expressed as runtime
//! values ([`ReorderPolicy`], [`ForceMerge`], [`ConvergenceNorm`],
//! [`RhsPreconditioner`]) so a single build can switch strategies per step.
//!
//! # Coordinate System
//!
//! - X: right
//! - Y: forward
//! - Z: up
//! - Right-handed
//!
//! # Example
//!
//! ```
//! use sim_types::{BodyId, MassProperties, QuickStepConfig, RigidBody, WorldConfig};
//! use nalgebra::Vector3;
//!
//! let body = RigidBody::new(BodyId::new(0), MassProperties::unit())
//!     .with_linear_velocity(Vector3::new(0.0, 0.0, 1.0));
//!
//! let world = WorldConfig::default().with_quickstep(QuickStepConfig::realtime());
//! assert!(world.validate().is_ok());
//! assert_eq!(body.inv_mass, 1.0);
//! ```

#![doc(html_root_url = "https://docs.rs/sim-types/0.1.0")]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(missing_docs)]
#![allow(
    clippy::missing_const_for_fn,     // Many methods can't be const due to nalgebra
    clippy::suboptimal_flops,          // mul_add style changes aren't always clearer
    clippy::missing_errors_doc,        // Error docs added where non-obvious
)]

mod body;
mod config;
mod dynamics;
mod error;

pub use body::{BodyFlags, BodyId, MassProperties, Pose, RigidBody, Twist};
pub use config::{
    ConvergenceNorm, ForceMerge, QuickStepConfig, ReorderPolicy, RhsPreconditioner, WorldConfig,
};
pub use dynamics::Gravity;
pub use error::SimError;

/// Result type for simulation operations.
pub type Result<T> = std::result::Result<T, SimError>;

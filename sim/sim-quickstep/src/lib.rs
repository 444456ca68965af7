//! Iterative SOR-LCP constraint solver for rigid-body worlds.
//!
//! One call to [`run_step`] advances body velocities by a fixed step `h`
//! under a set of joints and contacts. The constraint impulses are found by
//! projected successive over-relaxation over the rows of the joints, which
//! trades exactness for a cost linear in the number of rows.
//!
//! # Pipeline
//!
//! ```text
//! joints ──▶ rows (J, c, cfm, lo, hi, findex)
//!        ──▶ rhs = c/h − J·(M⁻¹·f + v/h)
//!        ──▶ SOR over row chunks (warm start, reorder, friction coupling,
//!            viscous joint damping)
//!        ──▶ v += h·(M⁻¹·Jᵀ·λ + M⁻¹·f)
//! ```
//!
//! # Joint Types
//!
//! - [`BallJoint`]: 3 bilateral rows pinning two anchors together
//! - [`HingeJoint`]: ball rows plus 2 angular rows, with optional viscous
//!   damping about the axis
//! - [`ContactJoint`]: one non-penetration row and two friction rows bounded
//!   by `μ·λ_normal`
//!
//! Any type implementing [`Joint`] can be stepped alongside these.
//!
//! # Parallelism
//!
//! Rows are split into chunks that relax concurrently on a [`TaskPool`].
//! Without a pool the chunks run in order on the calling thread. Chunks
//! accumulate into a shared force buffer through relaxed atomics, or into
//! private copies merged after the loop ([`ForceMerge`]).
//!
//! # Memory
//!
//! All per-step scratch is charged to a [`StepArena`] sized up front by
//! [`estimate_step_memory`]. The estimate never falls below what the step
//! uses.
//!
//! # Example
//!
//! ```
//! use sim_quickstep::{run_step, BallJoint, StepContext};
//! use sim_types::{BodyId, MassProperties, RigidBody, WorldConfig};
//! use nalgebra::{Point3, Vector3};
//!
//! let mut bodies = vec![
//!     RigidBody::new(BodyId::new(0), MassProperties::unit())
//!         .with_position(Point3::new(-0.5, 0.0, 0.0))
//!         .with_linear_velocity(Vector3::new(-1.0, 0.0, 0.0)),
//!     RigidBody::new(BodyId::new(1), MassProperties::unit())
//!         .with_position(Point3::new(0.5, 0.0, 0.0))
//!         .with_linear_velocity(Vector3::new(1.0, 0.0, 0.0)),
//! ];
//! let mut joints = vec![BallJoint::at_world_anchor(
//!     &bodies[0],
//!     Some(&bodies[1]),
//!     Point3::origin(),
//! )];
//!
//! let mut ctx = StepContext::new();
//! let report = run_step(&mut ctx, &WorldConfig::zero_gravity(), &mut bodies, &mut joints, 0.01)
//!     .unwrap();
//!
//! assert_eq!(report.rows, 3);
//! assert!(bodies[0].twist.linear.x.abs() < 1e-2);
//! ```

#![doc(html_root_url = "https://docs.rs/sim-quickstep/0.1.0")]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(missing_docs)]
#![allow(
    clippy::missing_const_for_fn,     // Many methods can't be const due to nalgebra
    clippy::suboptimal_flops,          // mul_add style changes aren't always clearer
    clippy::missing_errors_doc,        // Error docs added where non-obvious
    clippy::many_single_char_names,    // h, m, b, i follow the math
)]

pub mod arena;
pub mod assembly;
pub mod damping;
pub mod integrate;
mod joint;
mod memory;
pub mod rhs;
pub mod rows;
pub mod schedule;
pub mod shared;
pub mod sor;
mod step;

pub use arena::StepArena;
pub use joint::{
    BallJoint, ContactGeometry, ContactJoint, HingeJoint, Joint, JointFeedback, JointFrame,
    RowInfo, SolverMemory, MAX_ROWS_PER_JOINT,
};
pub use memory::estimate_step_memory;
pub use rows::{JacobianRowMut, RowWriter};
pub use schedule::{GlobalPool, TaskPool};
pub use sor::ChunkReport;
pub use step::{run_step, StepContext, StepReport};

pub use sim_types::{
    ConvergenceNorm, ForceMerge, QuickStepConfig, ReorderPolicy, RhsPreconditioner, Result,
    SimError, WorldConfig,
};

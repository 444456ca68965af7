//! One quick step: assemble, solve, integrate velocities.
//!
//! # Pipeline
//!
//! 1. validate the step size and configuration, size the arena
//! 2. tag bodies, rotate inertia into world frame, resolve joint bodies
//! 3. add gyroscopic torque and gravity to the accumulators
//! 4. with rows: assemble constraint and damping rows, compute the
//!    right-hand side (preconditioned on request), scale CFM, warm start,
//!    run the SOR iteration, write impulses and feedback back to the joints,
//!    apply damping and constraint velocity changes
//! 5. integrate external forces into velocities and clear the accumulators
//!
//! Every failure that depends only on the inputs (step size, configuration,
//! dangling body references) is reported before any body is touched.
//! Positions are not integrated here.

use std::sync::Arc;

use nalgebra::Matrix3;
use sim_types::{RhsPreconditioner, RigidBody, SimError, WorldConfig};
use tracing::debug;

use crate::arena::StepArena;
use crate::assembly::{assemble_constraints, collect_active_joints, BodyTags, ConstraintRows};
use crate::damping::{assemble_damping, DampingRows};
use crate::integrate::{
    apply_constraint_velocity, apply_damping_force, integrate_external_forces, load_impulses,
    store_impulses, write_feedback,
};
use crate::joint::Joint;
use crate::memory::estimate_step_memory;
use crate::rhs::{compute_rhs, precondition_rhs, scale_cfm};
use crate::rows::BODY_STRIDE;
use crate::schedule::{partition_rows, GlobalPool, TaskPool};
use crate::shared::SharedReals;
use crate::sor::{solve_lcp, ChunkReport, LcpBodies, WARM_START_FACTOR};
use crate::Result;

/// State carried from one step to the next: the scratch arena, the worker
/// pool, and the step counter that varies the shuffle seeds.
#[derive(Default)]
pub struct StepContext {
    arena: StepArena,
    pool: Option<Arc<dyn TaskPool>>,
    step_index: u64,
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("arena", &self.arena)
            .field("pool_size", &self.pool.as_ref().map(|p| p.size()))
            .field("step_index", &self.step_index)
            .finish()
    }
}

impl StepContext {
    /// Context running every chunk on the calling thread.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run chunks on `pool`.
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<dyn TaskPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Run chunks on rayon's global pool.
    #[must_use]
    pub fn with_global_pool(self) -> Self {
        self.with_pool(Arc::new(GlobalPool))
    }

    /// Steps completed so far.
    #[must_use]
    pub fn step_index(&self) -> u64 {
        self.step_index
    }
}

/// Summary of one step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepReport {
    /// Bodies stepped.
    pub bodies: usize,
    /// Joints that contributed rows.
    pub active_joints: usize,
    /// Constraint rows `m`.
    pub rows: usize,
    /// Damping rows.
    pub damping_rows: usize,
    /// One entry per row chunk, in chunk order.
    pub chunks: Vec<ChunkReport>,
    /// Arena budget computed for the step.
    pub memory_estimate: usize,
    /// Arena high-water mark reached by the step.
    pub memory_peak: usize,
}

impl StepReport {
    /// Whether every chunk met the tolerance.
    #[must_use]
    pub fn converged(&self) -> bool {
        self.chunks.iter().all(|c| c.converged)
    }

    /// Largest final residual over all chunks.
    #[must_use]
    pub fn max_residual(&self) -> f64 {
        self.chunks.iter().map(|c| c.residual).fold(0.0, f64::max)
    }
}

fn apply_body_forces(world: &WorldConfig, bodies: &mut [RigidBody], inertia: &[Matrix3<f64>]) {
    let gravity = (!world.gravity.is_zero()).then_some(world.gravity);
    for (body, inertia) in bodies.iter_mut().zip(inertia) {
        if body.flags.gyroscopic {
            let omega = body.twist.angular;
            body.torque -= omega.cross(&(inertia * omega));
        }
        if let Some(gravity) = gravity.filter(|_| !body.flags.gravity_exempt) {
            body.force += gravity.force_on_mass(body.mass);
        }
    }
}

/// Advance the velocities of `bodies` by `step` seconds under `joints`.
///
/// Joint impulses are written back for warm starting and, where requested,
/// as force/torque feedback. Body force and torque accumulators are zeroed.
///
/// # Errors
///
/// - [`SimError::InvalidTimestep`] when `step` is not positive and finite
/// - [`SimError::InvalidConfig`] when `world` fails validation
/// - [`SimError::UnknownBody`] when a joint references a body not in `bodies`
/// - [`SimError::ArenaExhausted`] if the step outgrows its estimate
#[allow(clippy::too_many_lines)]
pub fn run_step<J: Joint>(
    ctx: &mut StepContext,
    world: &WorldConfig,
    bodies: &mut [RigidBody],
    joints: &mut [J],
    step: f64,
) -> Result<StepReport> {
    if !(step.is_finite() && step > 0.0) {
        return Err(SimError::InvalidTimestep(step));
    }
    world.validate()?;

    let config = &world.quickstep;
    let StepContext {
        arena,
        pool,
        step_index,
    } = ctx;

    let estimate = estimate_step_memory(bodies, joints, config);
    arena.begin_step(estimate);

    let nb = bodies.len();
    let tags = BodyTags::build(arena, bodies)?;
    let mut inv_inertia = arena.alloc(nb, Matrix3::zeros())?;
    let mut inertia = arena.alloc(nb, Matrix3::zeros())?;
    for (b, body) in bodies.iter().enumerate() {
        inv_inertia[b] = body.world_inv_inertia();
        inertia[b] = body.world_inertia();
    }
    let (active, counts) = collect_active_joints(arena, joints, &tags, config.joint_damping)?;

    apply_body_forces(world, bodies, &inertia);

    let mut report = StepReport {
        bodies: nb,
        active_joints: active.len(),
        rows: counts.rows,
        memory_estimate: estimate,
        ..StepReport::default()
    };

    let m = counts.rows;
    if m > 0 {
        let fps = 1.0 / step;
        let mut rows = ConstraintRows::allocate(arena, &counts, world.global_cfm)?;

        let damping = if config.joint_damping && counts.damping_rows > 0 {
            let mut damping = DampingRows::allocate(arena, counts.damping_rows, nb)?;
            assemble_damping(joints, &active, bodies, fps, world.global_erp, &mut damping);
            Some(damping)
        } else {
            None
        };
        report.damping_rows = damping.as_ref().map_or(0, DampingRows::len);

        arena.scoped(|arena| -> Result<()> {
            let mut bias = arena.alloc(m, 0.0)?;
            assemble_constraints(joints, &active, bodies, fps, world.global_erp, &mut rows, &mut bias);
            compute_rhs(arena, bodies, &inv_inertia, &mut rows, &bias, step)?;
            if config.preconditioning == RhsPreconditioner::GaussSeidel {
                precondition_rhs(arena, bodies, &inertia, &mut rows)?;
            }
            Ok(())
        })?;
        scale_cfm(&mut rows.cfm, step);

        let lambda = SharedReals::zeroed(arena, m)?;
        if config.warm_start {
            load_impulses(joints, &active, &lambda, WARM_START_FACTOR);
        }
        let fc = SharedReals::zeroed(arena, nb * BODY_STRIDE)?;
        let chunk_count = partition_rows(m, config.effective_chunks(), config.num_overlap).count();
        let mut chunks = arena.alloc(chunk_count, ChunkReport::default())?;

        let input = LcpBodies {
            bodies: &*bodies,
            inv_inertia: &inv_inertia,
            damping: damping.as_ref(),
            step,
            step_index: *step_index,
        };
        solve_lcp(
            arena,
            pool.as_deref(),
            config,
            &input,
            &mut rows,
            &lambda,
            &fc,
            &mut chunks,
        )?;

        store_impulses(joints, &active, &lambda);
        if let Some(damping) = &damping {
            apply_damping_force(bodies, &inv_inertia, damping, step);
        }
        apply_constraint_velocity(bodies, &fc, step);
        write_feedback(joints, &active, &rows.feedback_jacobian, &lambda);

        report.chunks = chunks;
    }

    integrate_external_forces(bodies, &inv_inertia, step);

    *step_index += 1;
    report.memory_peak = arena.peak();
    debug!(
        bodies = report.bodies,
        joints = report.active_joints,
        rows = report.rows,
        damping_rows = report.damping_rows,
        max_residual = report.max_residual(),
        memory_peak = report.memory_peak,
        memory_estimate = report.memory_estimate,
        "quick step"
    );
    Ok(report)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::joint::BallJoint;
    use approx::assert_relative_eq;
    use nalgebra::{Point3, Vector3};
    use sim_types::{BodyId, Gravity, MassProperties, QuickStepConfig};

    fn pair() -> Vec<RigidBody> {
        vec![
            RigidBody::new(BodyId::new(0), MassProperties::unit())
                .with_position(Point3::new(-0.5, 0.0, 0.0)),
            RigidBody::new(BodyId::new(1), MassProperties::unit())
                .with_position(Point3::new(0.5, 0.0, 0.0)),
        ]
    }

    #[test]
    fn test_invalid_timestep_rejected_untouched() {
        let mut ctx = StepContext::new();
        let mut bodies = pair();
        let mut joints: Vec<BallJoint> = Vec::new();
        for step in [0.0, -0.01, f64::NAN, f64::INFINITY] {
            let err = run_step(&mut ctx, &WorldConfig::default(), &mut bodies, &mut joints, step)
                .unwrap_err();
            assert!(err.is_config_error());
        }
        assert_eq!(bodies, pair());
        assert_eq!(ctx.step_index(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut ctx = StepContext::new();
        let mut bodies = pair();
        let mut joints: Vec<BallJoint> = Vec::new();
        let world = WorldConfig::default().with_quickstep(QuickStepConfig::default().with_sor_w(2.5));
        let err = run_step(&mut ctx, &world, &mut bodies, &mut joints, 0.01).unwrap_err();
        assert!(matches!(err, SimError::InvalidConfig { .. }));
    }

    #[test]
    fn test_gravity_only_step() {
        let mut ctx = StepContext::new();
        let mut bodies = pair();
        bodies[1] = bodies[1].clone().without_gravity();
        let mut joints: Vec<BallJoint> = Vec::new();
        let world = WorldConfig::default().with_gravity(Gravity::custom(Vector3::new(0.0, 0.0, -10.0)));

        let report = run_step(&mut ctx, &world, &mut bodies, &mut joints, 0.1).unwrap();

        assert_eq!(report.rows, 0);
        assert!(report.chunks.is_empty());
        assert_relative_eq!(bodies[0].twist.linear.z, -1.0, epsilon = 1e-12);
        assert_eq!(bodies[1].twist.linear, Vector3::zeros());
        assert_eq!(bodies[0].force, Vector3::zeros());
        assert!(report.memory_peak <= report.memory_estimate);
    }

    #[test]
    fn test_gyroscopic_torque_on_asymmetric_body() {
        let mut ctx = StepContext::new();
        let inertia = Matrix3::from_diagonal(&Vector3::new(1.0, 2.0, 3.0));
        let omega = Vector3::new(1.0, 1.0, 0.0);
        let mut bodies = vec![RigidBody::new(BodyId::new(0), MassProperties::new(1.0, inertia))
            .with_angular_velocity(omega)
            .with_gyroscopic()];
        let mut joints: Vec<BallJoint> = Vec::new();

        run_step(&mut ctx, &WorldConfig::zero_gravity(), &mut bodies, &mut joints, 0.01).unwrap();

        // torque = -ω × (I·ω) = -(1,1,0) × (1,2,0) = (0, 0, -1)
        let expected = omega + inertia.try_inverse().unwrap() * Vector3::new(0.0, 0.0, -0.01);
        assert_relative_eq!(bodies[0].twist.angular, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_step_index_advances() {
        let mut ctx = StepContext::new().with_global_pool();
        let mut bodies = pair();
        let mut joints = vec![BallJoint::at_world_anchor(&bodies[0], Some(&bodies[1]), Point3::origin())];
        for _ in 0..3 {
            run_step(&mut ctx, &WorldConfig::zero_gravity(), &mut bodies, &mut joints, 0.01).unwrap();
        }
        assert_eq!(ctx.step_index(), 3);
        assert!(format!("{ctx:?}").contains("step_index: 3"));
    }

    #[test]
    fn test_report_helpers() {
        let report = StepReport {
            chunks: vec![
                ChunkReport {
                    residual: 0.5,
                    converged: true,
                    ..ChunkReport::default()
                },
                ChunkReport {
                    residual: 2.0,
                    converged: false,
                    ..ChunkReport::default()
                },
            ],
            ..StepReport::default()
        };
        assert!(!report.converged());
        assert_eq!(report.max_residual(), 2.0);
    }
}

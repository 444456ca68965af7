//! Implicit joint damping.
//!
//! A damped joint contributes one extra Jacobian row `Jd` and a coefficient.
//! Damping is not solved as a constraint; instead, at the start of every SOR
//! iteration each chunk runs three sub-steps:
//!
//! 1. predict body velocities `v_damp` from the constraint force so far plus
//!    the external and previous damping forces,
//! 2. recompute the damping force `f_damp = -Σ Jdᵀ·(α·coeff·Jd·v_damp)`,
//! 3. project it onto the constraint rows as `b_damp`, which enters every row
//!    update as an extra right-hand side term.
//!
//! The ramp `α` is zero for the first [`DAMPING_SKIP_ITERATIONS`] iterations
//! and then grows linearly to one at the last iteration, so the constraint
//! forces settle before damping couples in.
//!
//! The damping buffers are shared by all chunks and updated without ordering,
//! like `fc` under [`ForceMerge::Shared`](sim_types::ForceMerge::Shared).

use nalgebra::{Matrix3, Vector3};
use sim_types::RigidBody;

use crate::arena::StepArena;
use crate::assembly::{joint_frame, ActiveJoint};
use crate::joint::Joint;
use crate::rows::{body_range, dot6, BodyPair, JacobianMatrix, BODY_STRIDE};
use crate::shared::{Accumulator, SharedReals};
use crate::Result;

/// Iterations run before damping starts to ramp in.
pub const DAMPING_SKIP_ITERATIONS: usize = 10;

/// Damping ramp `α` for `iteration` out of `iterations`.
#[must_use]
pub fn ramp(iteration: usize, iterations: usize) -> f64 {
    if iteration < DAMPING_SKIP_ITERATIONS || iterations <= DAMPING_SKIP_ITERATIONS {
        return 0.0;
    }
    (iteration - DAMPING_SKIP_ITERATIONS + 1) as f64
        / (iterations - DAMPING_SKIP_ITERATIONS) as f64
}

fn read3(buf: &SharedReals, at: usize) -> Vector3<f64> {
    Vector3::new(buf.get(at), buf.get(at + 1), buf.get(at + 2))
}

fn write3(buf: &SharedReals, at: usize, v: &Vector3<f64>) {
    buf.set(at, v.x);
    buf.set(at + 1, v.y);
    buf.set(at + 2, v.z);
}

fn read3_from<F: Accumulator + ?Sized>(buf: &F, at: usize) -> Vector3<f64> {
    Vector3::new(buf.get(at), buf.get(at + 1), buf.get(at + 2))
}

/// Damping rows and the buffers the sub-steps exchange.
#[derive(Debug)]
pub struct DampingRows {
    /// Damping Jacobian `Jd`, one row per damped joint.
    pub jacobian: JacobianMatrix,
    /// Bodies acted on by each row.
    pub pairs: Vec<BodyPair>,
    /// Damping coefficient per row.
    pub coefficients: Vec<f64>,
    /// Last damped joint velocity `α·coeff·Jd·v_damp` per row.
    pub joint_velocity: SharedReals,
    /// Damping force per body, six-wide.
    pub force: SharedReals,
    /// Predicted body velocity per body, six-wide.
    pub velocity: SharedReals,
}

impl DampingRows {
    /// Allocate `rows` damping rows for `bodies` bodies.
    pub fn allocate(arena: &mut StepArena, rows: usize, bodies: usize) -> Result<Self> {
        Ok(Self {
            jacobian: JacobianMatrix::zeroed(arena, rows)?,
            pairs: arena.alloc(rows, BodyPair::default())?,
            coefficients: arena.alloc(rows, 0.0)?,
            joint_velocity: SharedReals::zeroed(arena, rows)?,
            force: SharedReals::zeroed(arena, bodies * BODY_STRIDE)?,
            velocity: SharedReals::zeroed(arena, bodies * BODY_STRIDE)?,
        })
    }

    /// Number of damping rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.coefficients.len()
    }

    /// Whether there are no damping rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.coefficients.is_empty()
    }

    /// Damping force on `body` as `(force, torque)`.
    #[must_use]
    pub fn body_force(&self, body: usize) -> (Vector3<f64>, Vector3<f64>) {
        let at = body * BODY_STRIDE;
        (read3(&self.force, at), read3(&self.force, at + 3))
    }
}

/// Let every damped joint fill its damping row.
pub fn assemble_damping<J: Joint>(
    joints: &[J],
    active: &[ActiveJoint],
    bodies: &[RigidBody],
    fps: f64,
    erp: f64,
    damping: &mut DampingRows,
) {
    for joint in active {
        let Some(row) = joint.damping_row else {
            continue;
        };
        let source = &joints[joint.index];
        let frame = joint_frame(bodies, joint.pair, fps, erp);
        source.fill_damping_row(&frame, &mut damping.jacobian.row_mut(row));
        damping.pairs[row] = joint.pair;
        damping.coefficients[row] = source.damping().unwrap_or(0.0);
    }
}

/// Everything the per-iteration damping sub-steps read.
#[derive(Debug, Clone, Copy)]
pub struct DampingCoupling<'a> {
    /// Damping rows and exchange buffers.
    pub rows: &'a DampingRows,
    /// Bodies of the step.
    pub bodies: &'a [RigidBody],
    /// World-frame inverse inertia per body.
    pub inv_inertia: &'a [Matrix3<f64>],
    /// Projection of the damping force onto the constraint rows.
    pub bias: &'a SharedReals,
    /// Step size `h`.
    pub step: f64,
}

impl DampingCoupling<'_> {
    /// Run the three damping sub-steps for `iteration`.
    pub fn sub_step<F: Accumulator + ?Sized>(
        &self,
        iteration: usize,
        iterations: usize,
        fc: &F,
        inv_mass_jt: &JacobianMatrix,
        ad: &[f64],
        pairs: &[BodyPair],
    ) {
        self.predict_velocities(fc);
        self.update_forces(ramp(iteration, iterations));
        self.update_bias(inv_mass_jt, ad, pairs);
    }

    /// `v_damp = v + h·fc + h·M⁻¹·(f_ext + f_damp)`.
    fn predict_velocities<F: Accumulator + ?Sized>(&self, fc: &F) {
        let h = self.step;
        let force = &self.rows.force;
        for (b, body) in self.bodies.iter().enumerate() {
            let at = b * BODY_STRIDE;
            let linear = body.twist.linear
                + read3_from(fc, at) * h
                + (body.force + read3(force, at)) * (h * body.inv_mass);
            let angular = body.twist.angular
                + read3_from(fc, at + 3) * h
                + self.inv_inertia[b] * ((body.torque + read3(force, at + 3)) * h);
            write3(&self.rows.velocity, at, &linear);
            write3(&self.rows.velocity, at + 3, &angular);
        }
    }

    /// `f_damp = -Σ Jdᵀ·(α·coeff·Jd·v_damp)`.
    fn update_forces(&self, alpha: f64) {
        let rows = self.rows;
        rows.force.fill(0.0);

        let mut v = [0.0; 2 * BODY_STRIDE];
        for i in 0..rows.len() {
            let pair = rows.pairs[i];
            let jd = rows.jacobian.row(i);
            for (k, value) in v[..BODY_STRIDE].iter_mut().enumerate() {
                *value = rows.velocity.get(pair.first * BODY_STRIDE + k);
            }
            let mut jv = dot6(jd.body1(), &v[..BODY_STRIDE]);
            if let Some(b2) = pair.second {
                for (k, value) in v[BODY_STRIDE..].iter_mut().enumerate() {
                    *value = rows.velocity.get(b2 * BODY_STRIDE + k);
                }
                jv += dot6(jd.body2(), &v[BODY_STRIDE..]);
            }

            let damped = alpha * rows.coefficients[i] * jv;
            rows.joint_velocity.set(i, damped);

            for (k, j) in body_range(pair.first).zip(jd.body1()) {
                rows.force.add(k, -j * damped);
            }
            if let Some(b2) = pair.second {
                for (k, j) in body_range(b2).zip(jd.body2()) {
                    rows.force.add(k, -j * damped);
                }
            }
        }
    }

    /// `b_damp[i] = Ad[i]·(M⁻¹Jᵢᵀ · f_damp)` over every constraint row.
    fn update_bias(&self, inv_mass_jt: &JacobianMatrix, ad: &[f64], pairs: &[BodyPair]) {
        let force = &self.rows.force;
        for (i, pair) in pairs.iter().enumerate() {
            let row = inv_mass_jt.row(i);
            let mut sum: f64 = body_range(pair.first)
                .zip(row.body1())
                .map(|(k, j)| j * force.get(k))
                .sum();
            if let Some(b2) = pair.second {
                sum += body_range(b2)
                    .zip(row.body2())
                    .map(|(k, j)| j * force.get(k))
                    .sum::<f64>();
            }
            self.bias.set(i, ad[i] * sum);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::assembly::{collect_active_joints, BodyTags};
    use crate::joint::HingeJoint;
    use approx::assert_relative_eq;
    use nalgebra::Point3;
    use sim_types::{BodyId, MassProperties};

    #[test]
    fn test_ramp() {
        assert_eq!(ramp(0, 20), 0.0);
        assert_eq!(ramp(9, 20), 0.0);
        assert_relative_eq!(ramp(10, 20), 0.1);
        assert_relative_eq!(ramp(19, 20), 1.0);
        assert_eq!(ramp(5, 8), 0.0);
    }

    fn spinning_pair() -> Vec<RigidBody> {
        vec![
            RigidBody::new(BodyId::new(0), MassProperties::unit())
                .with_position(Point3::new(-0.5, 0.0, 0.0))
                .with_angular_velocity(Vector3::new(0.0, 0.0, 2.0)),
            RigidBody::new(BodyId::new(1), MassProperties::unit())
                .with_position(Point3::new(0.5, 0.0, 0.0)),
        ]
    }

    #[test]
    fn test_assemble_damping_rows() {
        let mut arena = StepArena::with_capacity(1 << 14);
        let bodies = spinning_pair();
        let tags = BodyTags::build(&mut arena, &bodies).unwrap();
        let hinge =
            HingeJoint::at_world_anchor(&bodies[0], Some(&bodies[1]), Point3::origin(), Vector3::z());
        let joints = vec![hinge.with_damping(3.0)];
        let (active, counts) = collect_active_joints(&mut arena, &joints, &tags, true).unwrap();

        let mut damping = DampingRows::allocate(&mut arena, counts.damping_rows, 2).unwrap();
        assemble_damping(&joints, &active, &bodies, 100.0, 0.2, &mut damping);

        assert_eq!(damping.len(), 1);
        assert_eq!(damping.coefficients[0], 3.0);
        assert_eq!(damping.pairs[0], BodyPair::new(0, Some(1)));
        assert_eq!(damping.jacobian.row(0).angular1(), Vector3::z());
    }

    #[test]
    fn test_sub_step_opposes_relative_spin() {
        let mut arena = StepArena::with_capacity(1 << 14);
        let bodies = spinning_pair();
        let mut damping = DampingRows::allocate(&mut arena, 1, 2).unwrap();
        {
            let mut row = damping.jacobian.row_mut(0);
            row.set_angular1(&Vector3::z());
            row.set_angular2(&-Vector3::z());
        }
        damping.pairs[0] = BodyPair::new(0, Some(1));
        damping.coefficients[0] = 0.5;

        let inv_inertia = vec![Matrix3::identity(); 2];
        let bias = SharedReals::zeroed(&mut arena, 1).unwrap();
        let coupling = DampingCoupling {
            rows: &damping,
            bodies: &bodies,
            inv_inertia: &inv_inertia,
            bias: &bias,
            step: 0.01,
        };

        // One constraint row measuring body 1 spin about Z.
        let mut i_mj = JacobianMatrix::zeroed(&mut arena, 1).unwrap();
        i_mj.row_mut(0).set_angular1(&Vector3::z());
        let fc = vec![0.0; 12];

        coupling.sub_step(19, 20, &fc[..], &i_mj, &[1.0], &[BodyPair::new(0, None)]);

        assert_relative_eq!(damping.velocity.get(5), 2.0, epsilon = 1e-12);
        assert_relative_eq!(damping.joint_velocity.get(0), 1.0, epsilon = 1e-12);
        let (_, torque1) = damping.body_force(0);
        let (_, torque2) = damping.body_force(1);
        assert_relative_eq!(torque1.z, -1.0, epsilon = 1e-12);
        assert_relative_eq!(torque2.z, 1.0, epsilon = 1e-12);
        assert_relative_eq!(bias.get(0), -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_sub_step_inactive_before_ramp() {
        let mut arena = StepArena::with_capacity(1 << 14);
        let bodies = spinning_pair();
        let mut damping = DampingRows::allocate(&mut arena, 1, 2).unwrap();
        damping.jacobian.row_mut(0).set_angular1(&Vector3::z());
        damping.pairs[0] = BodyPair::new(0, None);
        damping.coefficients[0] = 10.0;

        let inv_inertia = vec![Matrix3::identity(); 2];
        let bias = SharedReals::zeroed(&mut arena, 0).unwrap();
        let coupling = DampingCoupling {
            rows: &damping,
            bodies: &bodies,
            inv_inertia: &inv_inertia,
            bias: &bias,
            step: 0.01,
        };
        let i_mj = JacobianMatrix::zeroed(&mut arena, 0).unwrap();
        coupling.sub_step(3, 20, &vec![0.0; 12][..], &i_mj, &[], &[]);

        assert_eq!(damping.joint_velocity.get(0), 0.0);
        assert_eq!(damping.body_force(0).1, Vector3::zeros());
    }
}

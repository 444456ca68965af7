//! Velocity integration and joint write-back after the solve.

use nalgebra::{Matrix3, Vector3};
use sim_types::RigidBody;

use crate::assembly::ActiveJoint;
use crate::damping::DampingRows;
use crate::joint::{Joint, JointFeedback, MAX_ROWS_PER_JOINT};
use crate::rows::{JacobianMatrix, BODY_STRIDE};
use crate::shared::SharedReals;

/// `v += h·M⁻¹·f_damp`.
pub fn apply_damping_force(
    bodies: &mut [RigidBody],
    inv_inertia: &[Matrix3<f64>],
    damping: &DampingRows,
    step: f64,
) {
    for (b, body) in bodies.iter_mut().enumerate() {
        let (force, torque) = damping.body_force(b);
        body.twist.linear += force * (step * body.inv_mass);
        body.twist.angular += inv_inertia[b] * (torque * step);
    }
}

/// `v += h·fc`.
pub fn apply_constraint_velocity(bodies: &mut [RigidBody], fc: &SharedReals, step: f64) {
    for (b, body) in bodies.iter_mut().enumerate() {
        let at = b * BODY_STRIDE;
        let linear = Vector3::new(fc.get(at), fc.get(at + 1), fc.get(at + 2));
        let angular = Vector3::new(fc.get(at + 3), fc.get(at + 4), fc.get(at + 5));
        body.twist.linear += linear * step;
        body.twist.angular += angular * step;
    }
}

/// Store every active joint's impulses for the next warm start.
pub fn store_impulses<J: Joint>(joints: &mut [J], active: &[ActiveJoint], lambda: &SharedReals) {
    let mut values = [0.0; MAX_ROWS_PER_JOINT];
    for joint in active {
        let rows = joint.info.rows;
        for (k, value) in values[..rows].iter_mut().enumerate() {
            *value = lambda.get(joint.offset + k);
        }
        joints[joint.index].solver_memory_mut().store(&values[..rows]);
    }
}

/// Seed `lambda` from the stored impulses, scaled by `factor`.
pub fn load_impulses<J: Joint>(
    joints: &[J],
    active: &[ActiveJoint],
    lambda: &SharedReals,
    factor: f64,
) {
    let mut values = [0.0; MAX_ROWS_PER_JOINT];
    for joint in active {
        let rows = joint.info.rows;
        joints[joint.index]
            .solver_memory()
            .load_scaled(&mut values[..rows], factor);
        for (k, &value) in values[..rows].iter().enumerate() {
            lambda.set(joint.offset + k, value);
        }
    }
}

/// Fill the feedback of every joint that requested it with `Jᵀ·λ`, using
/// the unscaled Jacobian copy.
pub fn write_feedback<J: Joint>(
    joints: &mut [J],
    active: &[ActiveJoint],
    feedback_jacobian: &JacobianMatrix,
    lambda: &SharedReals,
) {
    for joint in active {
        let Some(first) = joint.feedback_offset else {
            continue;
        };
        let mut feedback = JointFeedback::default();
        for k in 0..joint.info.rows {
            let row = feedback_jacobian.row(first + k);
            let l = lambda.get(joint.offset + k);
            feedback.force1 += row.linear1() * l;
            feedback.torque1 += row.angular1() * l;
            if joint.pair.second.is_some() {
                feedback.force2 += row.linear2() * l;
                feedback.torque2 += row.angular2() * l;
            }
        }
        if let Some(sink) = joints[joint.index].feedback_mut() {
            *sink = feedback;
        }
    }
}

/// `v += h·M⁻¹·(f, τ)` from the accumulators, which are then zeroed.
pub fn integrate_external_forces(bodies: &mut [RigidBody], inv_inertia: &[Matrix3<f64>], step: f64) {
    for (b, body) in bodies.iter_mut().enumerate() {
        body.twist.linear += body.force * (step * body.inv_mass);
        body.twist.angular += inv_inertia[b] * (body.torque * step);
        body.clear_accumulators();
    }
}

//! Right-hand side of the LCP.
//!
//! ```text
//! rhs = c/h - J·(M⁻¹·f_ext + v/h)
//! ```
//!
//! With [`RhsPreconditioner::GaussSeidel`](sim_types::RhsPreconditioner)
//! the right-hand side is then replaced by `J·M·x`, where `x` is a body-space
//! vector obtained from a fixed number of Gauss-Seidel sweeps that each
//! correct a single pivot component per row.

use nalgebra::{Matrix3, Vector3};
use sim_types::RigidBody;

use crate::arena::StepArena;
use crate::assembly::ConstraintRows;
use crate::rows::{body_range, BodyPair, JacobianRow, BODY_STRIDE};
use crate::Result;

/// Sweeps of the preconditioning pass.
pub const PRECONDITION_SWEEPS: usize = 30;

fn write_body(out: &mut [f64], body: usize, linear: &Vector3<f64>, angular: &Vector3<f64>) {
    let slot = &mut out[body_range(body)];
    slot[..3].copy_from_slice(linear.as_slice());
    slot[3..].copy_from_slice(angular.as_slice());
}

/// Fill `rows.rhs` from the biases `c`.
pub fn compute_rhs(
    arena: &mut StepArena,
    bodies: &[RigidBody],
    inv_inertia: &[Matrix3<f64>],
    rows: &mut ConstraintRows,
    bias: &[f64],
    step: f64,
) -> Result<()> {
    let fps = 1.0 / step;
    arena.scoped(|arena| {
        // tmp1 = M⁻¹·f_ext + v/h
        let mut tmp1 = arena.alloc(bodies.len() * BODY_STRIDE, 0.0)?;
        for (b, body) in bodies.iter().enumerate() {
            let linear = body.force * body.inv_mass + body.twist.linear * fps;
            let angular = inv_inertia[b] * body.torque + body.twist.angular * fps;
            write_body(&mut tmp1, b, &linear, &angular);
        }

        for (i, rhs) in rows.rhs.iter_mut().enumerate() {
            let jv = rows.jacobian.row(i).apply(rows.pairs[i], &tmp1);
            *rhs = bias[i] * fps - jv;
        }
        Ok(())
    })
}

/// Body-velocity component with the largest Jacobian magnitude.
fn pivot(row: &JacobianRow<'_>, pair: BodyPair) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    let mut best_abs = 0.0;
    let mut scan = |values: &[f64], body: usize| {
        for (k, &j) in values.iter().enumerate() {
            if j.abs() > best_abs {
                best_abs = j.abs();
                best = Some((body * BODY_STRIDE + k, j));
            }
        }
    };
    scan(row.body1(), pair.first);
    if let Some(b2) = pair.second {
        scan(row.body2(), b2);
    }
    best
}

/// Replace `rows.rhs` by `J·M·x`, with `x` from [`PRECONDITION_SWEEPS`]
/// single-pivot Gauss-Seidel sweeps over `J·x = rhs`.
///
/// Rows with an all-zero Jacobian have no pivot and are left out of the
/// sweeps.
pub fn precondition_rhs(
    arena: &mut StepArena,
    bodies: &[RigidBody],
    inertia: &[Matrix3<f64>],
    rows: &mut ConstraintRows,
) -> Result<()> {
    arena.scoped(|arena| {
        let mut x = arena.alloc(bodies.len() * BODY_STRIDE, 0.0)?;

        for _ in 0..PRECONDITION_SWEEPS {
            for (i, &rhs) in rows.rhs.iter().enumerate() {
                let row = rows.jacobian.row(i);
                let pair = rows.pairs[i];
                if let Some((k, j)) = pivot(&row, pair) {
                    let delta = rhs - row.apply(pair, &x);
                    x[k] += delta / j;
                }
            }
        }

        // Map back through the mass matrix: rhs = J·(M·x).
        for b in 0..bodies.len() {
            let slot = &x[body_range(b)];
            let linear = Vector3::new(slot[0], slot[1], slot[2]) * bodies[b].mass;
            let angular = inertia[b] * Vector3::new(slot[3], slot[4], slot[5]);
            write_body(&mut x, b, &linear, &angular);
        }
        for (i, rhs) in rows.rhs.iter_mut().enumerate() {
            *rhs = rows.jacobian.row(i).apply(rows.pairs[i], &x);
        }
        Ok(())
    })
}

/// Turn CFM into its per-step form, `cfm / h`.
pub fn scale_cfm(cfm: &mut [f64], step: f64) {
    let fps = 1.0 / step;
    for value in cfm {
        *value *= fps;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::assembly::RowCounts;
    use approx::assert_relative_eq;
    use sim_types::{BodyId, MassProperties};

    fn single_row(arena: &mut StepArena) -> ConstraintRows {
        let counts = RowCounts {
            rows: 1,
            ..Default::default()
        };
        let mut rows = ConstraintRows::allocate(arena, &counts, 1e-5).unwrap();
        rows.jacobian.row_mut(0).set_linear1(&Vector3::x());
        rows.pairs[0] = BodyPair::new(0, None);
        rows
    }

    #[test]
    fn test_rhs_velocity_and_force() {
        let mut arena = StepArena::with_capacity(4096);
        let mut body = RigidBody::new(BodyId::new(0), MassProperties::new(2.0, Matrix3::identity()));
        body.twist.linear = Vector3::new(3.0, 0.0, 0.0);
        body.add_force(Vector3::new(4.0, 0.0, 0.0));
        let bodies = vec![body];
        let inv_inertia = vec![Matrix3::identity()];

        let mut rows = single_row(&mut arena);
        compute_rhs(&mut arena, &bodies, &inv_inertia, &mut rows, &[0.5], 0.1).unwrap();

        // c/h - J·(f/m + v/h) = 5 - (2 + 30)
        assert_relative_eq!(rows.rhs[0], -27.0, epsilon = 1e-12);
        assert!(arena.peak() > arena.used());
    }

    #[test]
    fn test_precondition_solves_diagonal_row() {
        let mut arena = StepArena::with_capacity(4096);
        let bodies = vec![RigidBody::new(
            BodyId::new(0),
            MassProperties::new(2.0, Matrix3::identity()),
        )];
        let inertia = vec![Matrix3::identity()];

        let mut rows = single_row(&mut arena);
        rows.jacobian.row_mut(0).set_linear1(&Vector3::new(0.5, 0.0, 0.0));
        rows.rhs[0] = 3.0;
        precondition_rhs(&mut arena, &bodies, &inertia, &mut rows).unwrap();

        // x = 6 solves J·x = 3; rhs becomes J·(m·x) = 0.5·12.
        assert_relative_eq!(rows.rhs[0], 6.0, epsilon = 1e-12);
    }

    #[test]
    fn test_precondition_skips_empty_row() {
        let mut arena = StepArena::with_capacity(4096);
        let bodies = vec![RigidBody::new(BodyId::new(0), MassProperties::unit())];
        let inertia = vec![Matrix3::identity()];
        let counts = RowCounts {
            rows: 2,
            ..Default::default()
        };
        let mut rows = ConstraintRows::allocate(&mut arena, &counts, 0.0).unwrap();
        rows.jacobian.row_mut(1).set_angular1(&Vector3::y());
        rows.rhs.copy_from_slice(&[7.0, -2.0]);

        precondition_rhs(&mut arena, &bodies, &inertia, &mut rows).unwrap();
        assert_eq!(rows.rhs[0], 0.0);
        assert_relative_eq!(rows.rhs[1], -2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_pivot_prefers_first_maximum() {
        let mut data = [0.0; 12];
        data[1] = -2.0;
        data[7] = 2.0;
        let row = JacobianRow::new(&data);
        assert_eq!(pivot(&row, BodyPair::new(3, Some(5))), Some((19, -2.0)));
        assert_eq!(pivot(&JacobianRow::new(&[0.0; 12]), BodyPair::new(0, None)), None);
    }

    #[test]
    fn test_scale_cfm() {
        let mut cfm = [1e-5, 2e-5];
        scale_cfm(&mut cfm, 0.01);
        assert_relative_eq!(cfm[0], 1e-3, epsilon = 1e-15);
        assert_relative_eq!(cfm[1], 2e-3, epsilon = 1e-15);
    }
}

//! Upper bound on the scratch memory of one step.
//!
//! The estimate replays the step's allocation sequence with worst-case
//! counts: every joint at its [`Joint::max_rows`], every damped joint with a
//! damping row, every chunk at its widest. Buffers released at the end of a
//! scoped region contribute through `max` instead of `+`, mirroring the
//! arena's mark/release discipline.
//!
//! ```text
//! step-level   tags, world inertia (inverse and forward)
//! joints       max(all joints, active joints + rows)
//! rows         J, cfm, lo, hi, findex, pairs, rhs, feedback J
//!              + damping rows
//!              + max(assembly scratch, solve)
//! solve        lambda, fc, reports + SOR scratch (iMJ, Ad, Ad·cfm, order,
//!              b_damp, per-chunk scratch)
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize};

use nalgebra::Matrix3;
use sim_types::{BodyId, ForceMerge, QuickStepConfig, ReorderPolicy, RigidBody};

use crate::arena::array_size;
use crate::assembly::ActiveJoint;
use crate::joint::Joint;
use crate::rows::{BodyPair, BODY_STRIDE, ROW_STRIDE};
use crate::schedule::chunk_len;
use crate::sor::ChunkReport;

/// Worst-case row counts over a joint set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct RowBound {
    joints: usize,
    rows: usize,
    feedback_rows: usize,
    damping_rows: usize,
}

impl RowBound {
    fn scan<J: Joint>(joints: &[J], with_damping: bool) -> Self {
        let mut bound = Self::default();
        for joint in joints {
            let rows = joint.max_rows();
            if rows == 0 {
                continue;
            }
            bound.joints += 1;
            bound.rows += rows;
            if joint.feedback().is_some() {
                bound.feedback_rows += rows;
            }
            if with_damping && joint.damping().is_some() {
                bound.damping_rows += 1;
            }
        }
        bound
    }
}

fn row_arrays(bound: &RowBound) -> usize {
    let m = bound.rows;
    array_size::<f64>(m * ROW_STRIDE)
        + 4 * array_size::<f64>(m)
        + array_size::<Option<usize>>(m)
        + array_size::<BodyPair>(m)
        + array_size::<f64>(bound.feedback_rows * ROW_STRIDE)
}

fn damping_arrays(bound: &RowBound, bodies: usize) -> usize {
    let md = bound.damping_rows;
    if md == 0 {
        return 0;
    }
    array_size::<f64>(md * ROW_STRIDE)
        + array_size::<BodyPair>(md)
        + array_size::<f64>(md)
        + array_size::<AtomicU64>(md)
        + 2 * array_size::<AtomicU64>(bodies * BODY_STRIDE)
}

fn assembly_scratch(m: usize, bodies: usize) -> usize {
    // Bias, then the right-hand side and preconditioner vectors, one at a
    // time.
    array_size::<f64>(m) + array_size::<f64>(bodies * BODY_STRIDE)
}

fn solve_arrays(m: usize, bodies: usize, config: &QuickStepConfig, damping: bool) -> usize {
    let chunks = config.effective_chunks().min(m);
    let width = (chunk_len(m, config.effective_chunks()) + 2 * config.num_overlap).min(m);
    let reduce = config.merge == ForceMerge::Reduce;

    let mut per_chunk = 0;
    if reduce || config.reorder != ReorderPolicy::Partitioned {
        per_chunk += array_size::<usize>(width);
    }
    if config.reorder == ReorderPolicy::ByError {
        per_chunk += 2 * array_size::<f64>(width);
    }
    if reduce {
        per_chunk += array_size::<f64>(bodies * BODY_STRIDE) + array_size::<f64>(m);
    }

    let sor = array_size::<f64>(m * ROW_STRIDE)
        + 2 * array_size::<f64>(m)
        + array_size::<AtomicUsize>(m)
        + if damping { array_size::<AtomicU64>(m) } else { 0 }
        + chunks * per_chunk;

    array_size::<AtomicU64>(m)
        + array_size::<AtomicU64>(bodies * BODY_STRIDE)
        + array_size::<ChunkReport>(chunks)
        + sor
}

/// Bytes of scratch one [`run_step`](crate::run_step) over `bodies` and
/// `joints` may use.
///
/// Never less than the arena's peak for the same inputs: it is safe to size
/// the step arena with exactly this value.
#[must_use]
pub fn estimate_step_memory<J: Joint>(
    bodies: &[RigidBody],
    joints: &[J],
    config: &QuickStepConfig,
) -> usize {
    let nb = bodies.len();
    let bound = RowBound::scan(joints, config.joint_damping);

    let step_level = array_size::<(BodyId, usize)>(nb) + 2 * array_size::<Matrix3<f64>>(nb);

    let mut active = array_size::<ActiveJoint>(bound.joints);
    if bound.rows > 0 {
        let damping = damping_arrays(&bound, nb);
        active += row_arrays(&bound)
            + damping
            + assembly_scratch(bound.rows, nb)
                .max(solve_arrays(bound.rows, nb, config, damping > 0));
    }

    step_level + active.max(array_size::<ActiveJoint>(joints.len()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::joint::{BallJoint, HingeJoint};
    use nalgebra::{Point3, Vector3};
    use sim_types::MassProperties;

    fn bodies(n: u64) -> Vec<RigidBody> {
        (0..n)
            .map(|i| {
                RigidBody::new(BodyId::new(i), MassProperties::unit())
                    .with_position(Point3::new(i as f64, 0.0, 0.0))
            })
            .collect()
    }

    #[test]
    fn test_no_joints_is_step_level_only() {
        let bodies = bodies(3);
        let joints: Vec<BallJoint> = Vec::new();
        let estimate = estimate_step_memory(&bodies, &joints, &QuickStepConfig::default());
        let expected = array_size::<(BodyId, usize)>(3) + 2 * array_size::<Matrix3<f64>>(3);
        assert_eq!(estimate, expected);
    }

    #[test]
    fn test_estimate_grows_with_rows() {
        let bodies = bodies(3);
        let config = QuickStepConfig::default();
        let one = vec![BallJoint::new(BodyId::new(0), Some(BodyId::new(1)))];
        let two = vec![
            BallJoint::new(BodyId::new(0), Some(BodyId::new(1))),
            BallJoint::new(BodyId::new(1), Some(BodyId::new(2))),
        ];
        assert!(
            estimate_step_memory(&bodies, &two, &config)
                > estimate_step_memory(&bodies, &one, &config)
        );
    }

    #[test]
    fn test_damping_counted_only_when_enabled() {
        let bodies = bodies(2);
        let joints = vec![HingeJoint::at_world_anchor(
            &bodies[0],
            Some(&bodies[1]),
            Point3::new(0.5, 0.0, 0.0),
            Vector3::z(),
        )
        .with_damping(1.0)];

        let on = QuickStepConfig::default();
        let off = on.with_joint_damping(false);
        let with_damping = estimate_step_memory(&bodies, &joints, &on);
        assert!(with_damping > estimate_step_memory(&bodies, &joints, &off));
    }

    #[test]
    fn test_reduce_and_by_error_need_more() {
        let bodies = bodies(4);
        let joints: Vec<_> = (0..3)
            .map(|i| BallJoint::new(BodyId::new(i), Some(BodyId::new(i + 1))))
            .collect();
        let base = QuickStepConfig::deterministic().with_chunks(2, 1);
        let shared = estimate_step_memory(&bodies, &joints, &base);
        let reduce = estimate_step_memory(&bodies, &joints, &base.with_merge(ForceMerge::Reduce));
        let by_error =
            estimate_step_memory(&bodies, &joints, &base.with_reorder(ReorderPolicy::ByError));
        assert!(reduce > shared);
        assert!(by_error > shared);
    }
}

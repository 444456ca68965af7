//! Constraint row assembly.
//!
//! Joints are first scanned for their row counts, which fixes the global row
//! offset of every active joint. The row arrays are then allocated once and
//! each joint fills its own slice through a [`RowWriter`]. Friction indices
//! come back joint-local and are translated to global rows here.

use sim_types::{BodyId, RigidBody, SimError};

use crate::arena::StepArena;
use crate::joint::{Joint, JointFrame, RowInfo};
use crate::rows::{BodyPair, JacobianMatrix, RowWriter, ROW_STRIDE};
use crate::Result;

/// `(id, dense index)` pairs sorted by id.
#[derive(Debug, Clone)]
pub struct BodyTags {
    tags: Vec<(BodyId, usize)>,
}

impl BodyTags {
    /// Tag `bodies` with their position in the slice.
    pub fn build(arena: &mut StepArena, bodies: &[RigidBody]) -> Result<Self> {
        let mut tags = arena.alloc(bodies.len(), (BodyId::new(0), 0))?;
        for (index, (tag, body)) in tags.iter_mut().zip(bodies).enumerate() {
            *tag = (body.id, index);
        }
        tags.sort_unstable_by_key(|&(id, _)| id);
        Ok(Self { tags })
    }

    /// Dense index of `id`.
    pub fn lookup(&self, id: BodyId) -> Result<usize> {
        self.tags
            .binary_search_by_key(&id, |&(tag, _)| tag)
            .map(|slot| self.tags[slot].1)
            .map_err(|_| SimError::UnknownBody { body: id })
    }

    /// Number of tagged bodies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Whether no body is tagged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

/// A joint contributing rows this step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActiveJoint {
    /// Position in the caller's joint slice.
    pub index: usize,
    /// Row counts reported for this step.
    pub info: RowInfo,
    /// Attached bodies as dense indices.
    pub pair: BodyPair,
    /// First global row.
    pub offset: usize,
    /// First row in the feedback Jacobian copy, when feedback is requested.
    pub feedback_offset: Option<usize>,
    /// Damping row, when the joint is damped and damping is enabled.
    pub damping_row: Option<usize>,
}

impl ActiveJoint {
    /// Global rows owned by the joint.
    #[must_use]
    pub fn rows(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.info.rows
    }
}

/// Row totals over all active joints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowCounts {
    /// Constraint rows `m`.
    pub rows: usize,
    /// Rows of joints requesting feedback.
    pub feedback_rows: usize,
    /// Damping rows.
    pub damping_rows: usize,
}

/// Resolve body indices and row offsets of every joint with at least one row.
///
/// Every joint's bodies are looked up, including joints that report zero
/// rows, so a dangling reference fails the step before anything is mutated.
pub fn collect_active_joints<J: Joint>(
    arena: &mut StepArena,
    joints: &[J],
    tags: &BodyTags,
    with_damping: bool,
) -> Result<(Vec<ActiveJoint>, RowCounts)> {
    let mut active = arena.alloc(joints.len(), ActiveJoint::default())?;
    let mut counts = RowCounts::default();
    let mut len = 0;

    for (index, joint) in joints.iter().enumerate() {
        let (body1, body2) = joint.bodies();
        let pair = BodyPair::new(tags.lookup(body1)?, body2.map(|b| tags.lookup(b)).transpose()?);

        let info = joint.row_info();
        debug_assert!(info.is_valid(), "joint {index} reported invalid rows {info:?}");
        debug_assert!(info.rows <= joint.max_rows(), "joint {index} exceeds max_rows");
        if info.rows == 0 {
            continue;
        }

        let feedback_offset = joint.feedback().map(|_| counts.feedback_rows);
        let damping_row = (with_damping && joint.damping().is_some()).then_some(counts.damping_rows);

        active[len] = ActiveJoint {
            index,
            info,
            pair,
            offset: counts.rows,
            feedback_offset,
            damping_row,
        };
        len += 1;

        counts.rows += info.rows;
        if feedback_offset.is_some() {
            counts.feedback_rows += info.rows;
        }
        if damping_row.is_some() {
            counts.damping_rows += 1;
        }
    }

    arena.shrink(&mut active, len);
    Ok((active, counts))
}

/// Frame handed to a joint while it fills rows.
pub(crate) fn joint_frame<'a>(
    bodies: &'a [RigidBody],
    pair: BodyPair,
    fps: f64,
    erp: f64,
) -> JointFrame<'a> {
    JointFrame {
        fps,
        erp,
        body1: &bodies[pair.first],
        body2: pair.second.map(|b| &bodies[b]),
    }
}

/// Global constraint row arrays.
#[derive(Debug, Clone)]
pub struct ConstraintRows {
    /// Jacobian `J`, `m × 12`.
    pub jacobian: JacobianMatrix,
    /// Constraint force mixing per row.
    pub cfm: Vec<f64>,
    /// Lower impulse bound per row.
    pub lo: Vec<f64>,
    /// Upper impulse bound per row.
    pub hi: Vec<f64>,
    /// Global row each friction row is coupled to.
    pub findex: Vec<Option<usize>>,
    /// Bodies acted on by each row.
    pub pairs: Vec<BodyPair>,
    /// Right-hand side.
    pub rhs: Vec<f64>,
    /// Untouched copy of the rows of feedback joints, packed.
    pub feedback_jacobian: JacobianMatrix,
}

impl ConstraintRows {
    /// Allocate arrays for `counts` rows with the world's defaults:
    /// unbounded, uncoupled, CFM `global_cfm`.
    pub fn allocate(arena: &mut StepArena, counts: &RowCounts, global_cfm: f64) -> Result<Self> {
        let m = counts.rows;
        Ok(Self {
            jacobian: JacobianMatrix::zeroed(arena, m)?,
            cfm: arena.alloc(m, global_cfm)?,
            lo: arena.alloc(m, f64::NEG_INFINITY)?,
            hi: arena.alloc(m, f64::INFINITY)?,
            findex: arena.alloc(m, None)?,
            pairs: arena.alloc(m, BodyPair::default())?,
            rhs: arena.alloc(m, 0.0)?,
            feedback_jacobian: JacobianMatrix::zeroed(arena, counts.feedback_rows)?,
        })
    }

    /// Number of rows `m`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rhs.len()
    }

    /// Whether there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rhs.is_empty()
    }
}

/// Let every active joint fill its rows, writing velocity biases into `bias`.
pub fn assemble_constraints<J: Joint>(
    joints: &[J],
    active: &[ActiveJoint],
    bodies: &[RigidBody],
    fps: f64,
    erp: f64,
    rows: &mut ConstraintRows,
    bias: &mut [f64],
) {
    for joint in active {
        let range = joint.rows();
        let frame = joint_frame(bodies, joint.pair, fps, erp);

        let mut writer = RowWriter::new(
            rows.jacobian.rows_mut(range.clone()),
            &mut bias[range.clone()],
            &mut rows.cfm[range.clone()],
            &mut rows.lo[range.clone()],
            &mut rows.hi[range.clone()],
            &mut rows.findex[range.clone()],
        );
        joints[joint.index].fill_rows(&frame, &mut writer);

        for coupled in &mut rows.findex[range.clone()] {
            if let Some(local) = coupled {
                debug_assert!(*local < joint.info.rows, "friction index outside joint");
                *local += joint.offset;
            }
        }
        rows.pairs[range.clone()].fill(joint.pair);

        if let Some(dst) = joint.feedback_offset {
            rows.feedback_jacobian
                .copy_rows(dst, &rows.jacobian, joint.offset, joint.info.rows);
        }
    }

    debug_assert_eq!(rows.jacobian.as_slice().len(), rows.len() * ROW_STRIDE);
}

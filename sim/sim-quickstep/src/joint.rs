//! Joint capability trait and reference joints.
//!
//! A joint contributes up to [`MAX_ROWS_PER_JOINT`] constraint rows per step.
//! The solver only talks to joints through [`Joint`]: it asks for row
//! counts, hands the joint a [`RowWriter`] over its slice of the global row
//! arrays, and afterwards writes the solved impulses back into the joint's
//! [`SolverMemory`] (and, on request, a [`JointFeedback`]).
//!
//! Three joints are provided:
//!
//! - [`BallJoint`]: ball-and-socket, 3 bilateral rows
//! - [`HingeJoint`]: single rotation axis, 5 bilateral rows, optional axis damping
//! - [`ContactJoint`]: one unilateral normal row plus two friction rows coupled
//!   to it through the friction index

use nalgebra::{Point3, Vector3};
use sim_types::{BodyId, RigidBody};

use crate::rows::{JacobianRowMut, RowWriter};

/// Upper bound on the rows a single joint may report.
pub const MAX_ROWS_PER_JOINT: usize = 6;

/// Row counts reported by a joint for the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowInfo {
    /// Rows this step, `0..=6`.
    pub rows: usize,
    /// How many of those rows are unbounded (bilateral), `0..=rows`.
    pub unbounded: usize,
}

impl RowInfo {
    /// Rows that are all bilateral.
    #[must_use]
    pub const fn bilateral(rows: usize) -> Self {
        Self {
            rows,
            unbounded: rows,
        }
    }

    /// Check the row-count invariants.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.rows <= MAX_ROWS_PER_JOINT && self.unbounded <= self.rows
    }
}

/// Impulses kept on a joint between steps for warm starting.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SolverMemory {
    lambda: [f64; MAX_ROWS_PER_JOINT],
}

impl SolverMemory {
    /// Stored impulse per row.
    #[must_use]
    pub fn lambda(&self) -> &[f64; MAX_ROWS_PER_JOINT] {
        &self.lambda
    }

    /// Write `factor · lambda` for the first `out.len()` rows into `out`.
    pub fn load_scaled(&self, out: &mut [f64], factor: f64) {
        for (dst, &src) in out.iter_mut().zip(&self.lambda) {
            *dst = src * factor;
        }
    }

    /// Store impulses for the first `values.len()` rows.
    pub fn store(&mut self, values: &[f64]) {
        for (dst, &src) in self.lambda.iter_mut().zip(values) {
            *dst = src;
        }
    }

    /// Forget all stored impulses.
    pub fn clear(&mut self) {
        self.lambda = [0.0; MAX_ROWS_PER_JOINT];
    }
}

/// Force and torque a joint applied to each attached body during the last
/// step. Body 2 values stay zero when the joint is attached to the world.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct JointFeedback {
    /// Force on the first body.
    pub force1: Vector3<f64>,
    /// Torque on the first body.
    pub torque1: Vector3<f64>,
    /// Force on the second body.
    pub force2: Vector3<f64>,
    /// Torque on the second body.
    pub torque2: Vector3<f64>,
}

/// Body state and step parameters visible to a joint while filling rows.
#[derive(Debug, Clone, Copy)]
pub struct JointFrame<'a> {
    /// Inverse step size, `1/h`.
    pub fps: f64,
    /// Error reduction parameter.
    pub erp: f64,
    /// First body.
    pub body1: &'a RigidBody,
    /// Second body, if any.
    pub body2: Option<&'a RigidBody>,
}

impl JointFrame<'_> {
    /// Bias scale applied to positional errors: `erp / h`.
    #[must_use]
    pub fn error_gain(&self) -> f64 {
        self.erp * self.fps
    }
}

/// A constraint between one or two bodies.
pub trait Joint {
    /// Attached bodies. `None` attaches the joint to the static world.
    fn bodies(&self) -> (BodyId, Option<BodyId>);

    /// Row counts for this step.
    fn row_info(&self) -> RowInfo;

    /// Cheap upper bound on [`row_info`](Self::row_info)`.rows`, used to
    /// size the step before any row is evaluated.
    fn max_rows(&self) -> usize {
        MAX_ROWS_PER_JOINT
    }

    /// Fill the Jacobian, bias, bounds, CFM and friction indices of this
    /// joint's rows.
    fn fill_rows(&self, frame: &JointFrame<'_>, rows: &mut RowWriter<'_>);

    /// Viscous damping coefficient, when implicit damping is requested.
    fn damping(&self) -> Option<f64> {
        None
    }

    /// Fill the single damping row. Only called when
    /// [`damping`](Self::damping) returns `Some`.
    fn fill_damping_row(&self, _frame: &JointFrame<'_>, _row: &mut JacobianRowMut<'_>) {}

    /// Warm-start storage.
    fn solver_memory(&self) -> &SolverMemory;

    /// Mutable warm-start storage.
    fn solver_memory_mut(&mut self) -> &mut SolverMemory;

    /// Feedback sink, present when feedback was requested.
    fn feedback(&self) -> Option<&JointFeedback> {
        None
    }

    /// Mutable feedback sink.
    fn feedback_mut(&mut self) -> Option<&mut JointFeedback> {
        None
    }
}

impl<J: Joint + ?Sized> Joint for Box<J> {
    fn bodies(&self) -> (BodyId, Option<BodyId>) {
        (**self).bodies()
    }

    fn row_info(&self) -> RowInfo {
        (**self).row_info()
    }

    fn max_rows(&self) -> usize {
        (**self).max_rows()
    }

    fn fill_rows(&self, frame: &JointFrame<'_>, rows: &mut RowWriter<'_>) {
        (**self).fill_rows(frame, rows);
    }

    fn damping(&self) -> Option<f64> {
        (**self).damping()
    }

    fn fill_damping_row(&self, frame: &JointFrame<'_>, row: &mut JacobianRowMut<'_>) {
        (**self).fill_damping_row(frame, row);
    }

    fn solver_memory(&self) -> &SolverMemory {
        (**self).solver_memory()
    }

    fn solver_memory_mut(&mut self) -> &mut SolverMemory {
        (**self).solver_memory_mut()
    }

    fn feedback(&self) -> Option<&JointFeedback> {
        (**self).feedback()
    }

    fn feedback_mut(&mut self) -> Option<&mut JointFeedback> {
        (**self).feedback_mut()
    }
}

/// World-frame anchor positions and lever arms of a two-point attachment.
struct AnchorPair {
    p1: Point3<f64>,
    r1: Vector3<f64>,
    p2: Point3<f64>,
    r2: Option<Vector3<f64>>,
}

impl AnchorPair {
    fn resolve(frame: &JointFrame<'_>, anchor1: &Point3<f64>, anchor2: &Point3<f64>) -> Self {
        let p1 = frame.body1.pose.transform_point(anchor1);
        let r1 = p1 - frame.body1.pose.position;
        let (p2, r2) = match frame.body2 {
            Some(body) => {
                let p2 = body.pose.transform_point(anchor2);
                (p2, Some(p2 - body.pose.position))
            }
            None => (*anchor2, None),
        };
        Self { p1, r1, p2, r2 }
    }

    /// Three rows pinning the anchors together along the world axes.
    fn fill_point_rows(&self, gain: f64, rows: &mut RowWriter<'_>) {
        let error = self.p2 - self.p1;
        for (k, axis) in [Vector3::x(), Vector3::y(), Vector3::z()].iter().enumerate() {
            let mut row = rows.jacobian(k);
            row.set_linear1(axis);
            row.set_angular1(&self.r1.cross(axis));
            if let Some(r2) = &self.r2 {
                row.set_linear2(&-axis);
                row.set_angular2(&-r2.cross(axis));
            }
            rows.set_bias(k, gain * error[k]);
        }
    }
}

fn local_anchor(body: Option<&RigidBody>, world: &Point3<f64>) -> Point3<f64> {
    body.map_or(*world, |b| b.pose.inverse_transform_point(world))
}

/// Two unit vectors spanning the plane orthogonal to `n`.
fn plane_space(n: &Vector3<f64>) -> (Vector3<f64>, Vector3<f64>) {
    let helper = if n.x.abs() > 0.7 {
        Vector3::y()
    } else {
        Vector3::x()
    };
    let p = n.cross(&helper).normalize();
    let q = n.cross(&p);
    (p, q)
}

/// Ball-and-socket joint: keeps one anchor point of each body coincident.
///
/// # Example
///
/// ```
/// use sim_quickstep::{BallJoint, Joint};
/// use sim_types::{BodyId, MassProperties, RigidBody};
/// use nalgebra::Point3;
///
/// let a = RigidBody::new(BodyId::new(0), MassProperties::unit())
///     .with_position(Point3::new(-0.5, 0.0, 0.0));
/// let b = RigidBody::new(BodyId::new(1), MassProperties::unit())
///     .with_position(Point3::new(0.5, 0.0, 0.0));
///
/// let joint = BallJoint::at_world_anchor(&a, Some(&b), Point3::origin());
/// assert_eq!(joint.row_info().rows, 3);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BallJoint {
    body1: BodyId,
    body2: Option<BodyId>,
    /// Anchor in body 1 frame.
    anchor1: Point3<f64>,
    /// Anchor in body 2 frame, or in world frame without a body 2.
    anchor2: Point3<f64>,
    cfm: Option<f64>,
    memory: SolverMemory,
    feedback: Option<JointFeedback>,
}

impl BallJoint {
    /// Create a ball joint with both anchors at the body origins.
    #[must_use]
    pub fn new(body1: BodyId, body2: Option<BodyId>) -> Self {
        Self {
            body1,
            body2,
            anchor1: Point3::origin(),
            anchor2: Point3::origin(),
            cfm: None,
            memory: SolverMemory::default(),
            feedback: None,
        }
    }

    /// Create a ball joint whose anchors meet at `anchor` (world frame) in
    /// the bodies' current poses.
    #[must_use]
    pub fn at_world_anchor(
        body1: &RigidBody,
        body2: Option<&RigidBody>,
        anchor: Point3<f64>,
    ) -> Self {
        Self::new(body1.id, body2.map(|b| b.id))
            .with_anchor1(local_anchor(Some(body1), &anchor))
            .with_anchor2(local_anchor(body2, &anchor))
    }

    /// Set the anchor in body 1 frame.
    #[must_use]
    pub fn with_anchor1(mut self, anchor: Point3<f64>) -> Self {
        self.anchor1 = anchor;
        self
    }

    /// Set the anchor in body 2 frame (world frame without a body 2).
    #[must_use]
    pub fn with_anchor2(mut self, anchor: Point3<f64>) -> Self {
        self.anchor2 = anchor;
        self
    }

    /// Override the world CFM for this joint's rows.
    #[must_use]
    pub fn with_cfm(mut self, cfm: f64) -> Self {
        self.cfm = Some(cfm);
        self
    }

    /// Request force/torque feedback.
    #[must_use]
    pub fn with_feedback(mut self) -> Self {
        self.feedback = Some(JointFeedback::default());
        self
    }
}

impl Joint for BallJoint {
    fn bodies(&self) -> (BodyId, Option<BodyId>) {
        (self.body1, self.body2)
    }

    fn row_info(&self) -> RowInfo {
        RowInfo::bilateral(3)
    }

    fn max_rows(&self) -> usize {
        3
    }

    fn fill_rows(&self, frame: &JointFrame<'_>, rows: &mut RowWriter<'_>) {
        let anchors = AnchorPair::resolve(frame, &self.anchor1, &self.anchor2);
        anchors.fill_point_rows(frame.error_gain(), rows);
        if let Some(cfm) = self.cfm {
            for i in 0..3 {
                rows.set_cfm(i, cfm);
            }
        }
    }

    fn solver_memory(&self) -> &SolverMemory {
        &self.memory
    }

    fn solver_memory_mut(&mut self) -> &mut SolverMemory {
        &mut self.memory
    }

    fn feedback(&self) -> Option<&JointFeedback> {
        self.feedback.as_ref()
    }

    fn feedback_mut(&mut self) -> Option<&mut JointFeedback> {
        self.feedback.as_mut()
    }
}

/// Hinge joint: a ball joint that also keeps one axis of each body aligned,
/// leaving rotation about that axis free.
///
/// With [`with_damping`](Self::with_damping) the free rotation is damped
/// implicitly by the solver.
#[derive(Debug, Clone, PartialEq)]
pub struct HingeJoint {
    body1: BodyId,
    body2: Option<BodyId>,
    anchor1: Point3<f64>,
    anchor2: Point3<f64>,
    /// Axis in body 1 frame.
    axis1: Vector3<f64>,
    /// Axis in body 2 frame, or in world frame without a body 2.
    axis2: Vector3<f64>,
    damping: Option<f64>,
    memory: SolverMemory,
    feedback: Option<JointFeedback>,
}

impl HingeJoint {
    /// Create a hinge at world point `anchor` rotating about world `axis`,
    /// using the bodies' current poses.
    #[must_use]
    pub fn at_world_anchor(
        body1: &RigidBody,
        body2: Option<&RigidBody>,
        anchor: Point3<f64>,
        axis: Vector3<f64>,
    ) -> Self {
        let axis = axis.normalize();
        let local_axis = |body: Option<&RigidBody>| {
            body.map_or(axis, |b| b.pose.rotation.inverse() * axis)
        };
        Self {
            body1: body1.id,
            body2: body2.map(|b| b.id),
            anchor1: local_anchor(Some(body1), &anchor),
            anchor2: local_anchor(body2, &anchor),
            axis1: local_axis(Some(body1)),
            axis2: local_axis(body2),
            damping: None,
            memory: SolverMemory::default(),
            feedback: None,
        }
    }

    /// Damp relative rotation about the hinge axis with `coefficient`.
    #[must_use]
    pub fn with_damping(mut self, coefficient: f64) -> Self {
        self.damping = Some(coefficient);
        self
    }

    /// Request force/torque feedback.
    #[must_use]
    pub fn with_feedback(mut self) -> Self {
        self.feedback = Some(JointFeedback::default());
        self
    }

    fn world_axes(&self, frame: &JointFrame<'_>) -> (Vector3<f64>, Vector3<f64>) {
        let a1 = frame.body1.pose.transform_vector(&self.axis1);
        let a2 = frame
            .body2
            .map_or(self.axis2, |b| b.pose.transform_vector(&self.axis2));
        (a1, a2)
    }
}

impl Joint for HingeJoint {
    fn bodies(&self) -> (BodyId, Option<BodyId>) {
        (self.body1, self.body2)
    }

    fn row_info(&self) -> RowInfo {
        RowInfo::bilateral(5)
    }

    fn max_rows(&self) -> usize {
        5
    }

    fn fill_rows(&self, frame: &JointFrame<'_>, rows: &mut RowWriter<'_>) {
        let gain = frame.error_gain();
        AnchorPair::resolve(frame, &self.anchor1, &self.anchor2).fill_point_rows(gain, rows);

        let (a1, a2) = self.world_axes(frame);
        let (p, q) = plane_space(&a1);
        let misalignment = a1.cross(&a2);
        for (i, dir) in [(3, p), (4, q)] {
            let mut row = rows.jacobian(i);
            row.set_angular1(&dir);
            if frame.body2.is_some() {
                row.set_angular2(&-dir);
            }
            rows.set_bias(i, gain * misalignment.dot(&dir));
        }
    }

    fn damping(&self) -> Option<f64> {
        self.damping
    }

    fn fill_damping_row(&self, frame: &JointFrame<'_>, row: &mut JacobianRowMut<'_>) {
        let (a1, _) = self.world_axes(frame);
        row.set_angular1(&a1);
        if frame.body2.is_some() {
            row.set_angular2(&-a1);
        }
    }

    fn solver_memory(&self) -> &SolverMemory {
        &self.memory
    }

    fn solver_memory_mut(&mut self) -> &mut SolverMemory {
        &mut self.memory
    }

    fn feedback(&self) -> Option<&JointFeedback> {
        self.feedback.as_ref()
    }

    fn feedback_mut(&mut self) -> Option<&mut JointFeedback> {
        self.feedback.as_mut()
    }
}

/// Contact point produced by collision detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContactGeometry {
    /// Contact position in world frame.
    pub position: Point3<f64>,
    /// Unit normal pointing from body 2 into body 1.
    pub normal: Vector3<f64>,
    /// Penetration depth (positive when overlapping).
    pub depth: f64,
}

/// Non-penetration contact with Coulomb friction.
///
/// Row 0 pushes along the normal with `lambda ≥ 0`. When the friction
/// coefficient is positive, rows 1 and 2 act along two tangents and are
/// coupled to row 0, so their impulse stays within `μ·lambda_normal`.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactJoint {
    body1: BodyId,
    body2: Option<BodyId>,
    geometry: ContactGeometry,
    friction: f64,
    soft_cfm: Option<f64>,
    memory: SolverMemory,
    feedback: Option<JointFeedback>,
}

impl ContactJoint {
    /// Create a frictionless contact.
    #[must_use]
    pub fn new(body1: BodyId, body2: Option<BodyId>, geometry: ContactGeometry) -> Self {
        Self {
            body1,
            body2,
            geometry,
            friction: 0.0,
            soft_cfm: None,
            memory: SolverMemory::default(),
            feedback: None,
        }
    }

    /// Set the friction coefficient `μ`.
    #[must_use]
    pub fn with_friction(mut self, mu: f64) -> Self {
        self.friction = mu.max(0.0);
        self
    }

    /// Soften the normal row with its own CFM.
    #[must_use]
    pub fn with_soft_cfm(mut self, cfm: f64) -> Self {
        self.soft_cfm = Some(cfm);
        self
    }

    /// Request force/torque feedback.
    #[must_use]
    pub fn with_feedback(mut self) -> Self {
        self.feedback = Some(JointFeedback::default());
        self
    }
}

impl Joint for ContactJoint {
    fn bodies(&self) -> (BodyId, Option<BodyId>) {
        (self.body1, self.body2)
    }

    fn row_info(&self) -> RowInfo {
        let rows = if self.friction > 0.0 { 3 } else { 1 };
        RowInfo { rows, unbounded: 0 }
    }

    fn max_rows(&self) -> usize {
        3
    }

    fn fill_rows(&self, frame: &JointFrame<'_>, rows: &mut RowWriter<'_>) {
        let n = self.geometry.normal;
        let r1 = self.geometry.position - frame.body1.pose.position;
        let r2 = frame.body2.map(|b| self.geometry.position - b.pose.position);

        let set_direction = |rows: &mut RowWriter<'_>, i: usize, dir: &Vector3<f64>| {
            let mut row = rows.jacobian(i);
            row.set_linear1(dir);
            row.set_angular1(&r1.cross(dir));
            if let Some(r2) = &r2 {
                row.set_linear2(&-dir);
                row.set_angular2(&-r2.cross(dir));
            }
        };

        set_direction(rows, 0, &n);
        rows.set_bias(0, frame.error_gain() * self.geometry.depth);
        rows.set_bounds(0, 0.0, f64::INFINITY);
        if let Some(cfm) = self.soft_cfm {
            rows.set_cfm(0, cfm);
        }

        if rows.rows() == 3 {
            let (t1, t2) = plane_space(&n);
            for (i, dir) in [(1, t1), (2, t2)] {
                set_direction(rows, i, &dir);
                rows.set_bounds(i, -self.friction, self.friction);
                rows.set_friction_index(i, 0);
            }
        }
    }

    fn solver_memory(&self) -> &SolverMemory {
        &self.memory
    }

    fn solver_memory_mut(&mut self) -> &mut SolverMemory {
        &mut self.memory
    }

    fn feedback(&self) -> Option<&JointFeedback> {
        self.feedback.as_ref()
    }

    fn feedback_mut(&mut self) -> Option<&mut JointFeedback> {
        self.feedback.as_mut()
    }
}

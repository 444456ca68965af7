//! Rigid body types consumed by the constraint solver.
//!
//! A [`RigidBody`] carries everything one solver step reads (pose, mass,
//! inertia) and everything it writes (velocities, force and torque
//! accumulators). Position integration lives outside the solver, so the pose
//! is only ever read here.

use nalgebra::{Matrix3, Point3, UnitQuaternion, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Unique identifier for a rigid body in the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BodyId(pub u64);

impl BodyId {
    /// Create a new body ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl From<u64> for BodyId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for BodyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Body({})", self.0)
    }
}

/// Position and orientation of a rigid body.
///
/// # Example
///
/// ```
/// use sim_types::Pose;
/// use nalgebra::Point3;
///
/// let pose = Pose::from_position(Point3::new(1.0, 2.0, 3.0));
/// let world = pose.transform_point(&Point3::new(1.0, 0.0, 0.0));
/// assert_eq!(world, Point3::new(2.0, 2.0, 3.0));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Pose {
    /// Position of the center of mass in world coordinates.
    pub position: Point3<f64>,
    /// Orientation as a unit quaternion.
    pub rotation: UnitQuaternion<f64>,
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose {
    /// Create an identity pose (origin, no rotation).
    #[must_use]
    pub fn identity() -> Self {
        Self {
            position: Point3::origin(),
            rotation: UnitQuaternion::identity(),
        }
    }

    /// Create a pose from position only (identity rotation).
    #[must_use]
    pub fn from_position(position: Point3<f64>) -> Self {
        Self {
            position,
            rotation: UnitQuaternion::identity(),
        }
    }

    /// Create a pose from position and rotation.
    #[must_use]
    pub const fn from_position_rotation(
        position: Point3<f64>,
        rotation: UnitQuaternion<f64>,
    ) -> Self {
        Self { position, rotation }
    }

    /// Rotation matrix taking body-frame vectors to world frame.
    #[must_use]
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Transform a point from local to world coordinates.
    #[must_use]
    pub fn transform_point(&self, local: &Point3<f64>) -> Point3<f64> {
        self.position + self.rotation * local.coords
    }

    /// Transform a vector from local to world coordinates (rotation only).
    #[must_use]
    pub fn transform_vector(&self, local: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * local
    }

    /// Transform a point from world to local coordinates.
    #[must_use]
    pub fn inverse_transform_point(&self, world: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.rotation.inverse() * (world - self.position))
    }
}

/// Linear and angular velocity of a rigid body, both in world frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Twist {
    /// Linear velocity of the center of mass (m/s).
    pub linear: Vector3<f64>,
    /// Angular velocity (rad/s).
    pub angular: Vector3<f64>,
}

impl Twist {
    /// Zero velocity.
    #[must_use]
    pub fn zero() -> Self {
        Self::default()
    }

    /// Velocity of a point at `offset` from the center of mass.
    #[must_use]
    pub fn velocity_at_point(&self, offset: &Vector3<f64>) -> Vector3<f64> {
        self.linear + self.angular.cross(offset)
    }
}

/// Mass and body-frame inertia of a rigid body.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MassProperties {
    /// Total mass in kg.
    pub mass: f64,
    /// Inertia tensor about the center of mass in body coordinates (kg·m²).
    pub inertia: Matrix3<f64>,
}

impl MassProperties {
    /// Create mass properties with given values.
    #[must_use]
    pub const fn new(mass: f64, inertia: Matrix3<f64>) -> Self {
        Self { mass, inertia }
    }

    /// Unit mass with identity inertia.
    #[must_use]
    pub fn unit() -> Self {
        Self {
            mass: 1.0,
            inertia: Matrix3::identity(),
        }
    }

    /// Create mass properties for a uniform sphere.
    ///
    /// Inertia of a solid sphere: I = (2/5) * m * r²
    #[must_use]
    pub fn sphere(mass: f64, radius: f64) -> Self {
        let i = 0.4 * mass * radius * radius;
        Self {
            mass,
            inertia: Matrix3::from_diagonal(&Vector3::new(i, i, i)),
        }
    }

    /// Create mass properties for a uniform box.
    ///
    /// Inertia of a solid box with dimensions (x, y, z):
    /// - Ixx = (1/12) * m * (y² + z²)
    /// - Iyy = (1/12) * m * (x² + z²)
    /// - Izz = (1/12) * m * (x² + y²)
    #[must_use]
    pub fn box_shape(mass: f64, half_extents: Vector3<f64>) -> Self {
        let x2 = 4.0 * half_extents.x * half_extents.x;
        let y2 = 4.0 * half_extents.y * half_extents.y;
        let z2 = 4.0 * half_extents.z * half_extents.z;
        let k = mass / 12.0;
        Self {
            mass,
            inertia: Matrix3::from_diagonal(&Vector3::new(
                k * (y2 + z2),
                k * (x2 + z2),
                k * (x2 + y2),
            )),
        }
    }

    /// Validate the mass properties.
    pub fn validate(&self) -> crate::Result<()> {
        if !self.mass.is_finite() || self.mass <= 0.0 {
            return Err(crate::SimError::invalid_mass(format!(
                "mass must be positive and finite, got {}",
                self.mass
            )));
        }
        if self.inertia.try_inverse().is_none() {
            return Err(crate::SimError::invalid_mass("inertia tensor is singular"));
        }
        Ok(())
    }
}

/// Per-body behavior flags read by the stepper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BodyFlags {
    /// Skip world gravity for this body.
    pub gravity_exempt: bool,
    /// Apply the gyroscopic torque `-ω × (I·ω)` each step.
    pub gyroscopic: bool,
}

/// A dynamic rigid body as seen by the constraint solver.
///
/// # Example
///
/// ```
/// use sim_types::{BodyId, MassProperties, RigidBody};
/// use nalgebra::Vector3;
///
/// let body = RigidBody::new(BodyId::new(1), MassProperties::sphere(2.0, 0.5))
///     .with_linear_velocity(Vector3::new(1.0, 0.0, 0.0));
///
/// assert_eq!(body.inv_mass, 0.5);
/// assert!(body.force.norm() < 1e-12);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RigidBody {
    /// Identifier joints use to refer to this body.
    pub id: BodyId,
    /// World pose.
    pub pose: Pose,
    /// World-frame velocities.
    pub twist: Twist,
    /// Mass in kg.
    pub mass: f64,
    /// Inverse mass (zero for infinite mass).
    pub inv_mass: f64,
    /// Body-frame inertia tensor.
    pub inertia: Matrix3<f64>,
    /// Body-frame inverse inertia tensor.
    pub inv_inertia: Matrix3<f64>,
    /// Accumulated world-frame force, zeroed after each step.
    pub force: Vector3<f64>,
    /// Accumulated world-frame torque, zeroed after each step.
    pub torque: Vector3<f64>,
    /// Behavior flags.
    pub flags: BodyFlags,
}

impl RigidBody {
    /// Create a body at rest at the origin.
    ///
    /// A singular inertia tensor yields a zero inverse inertia (rotation
    /// unaffected by torques), and a non-positive mass a zero inverse mass.
    #[must_use]
    pub fn new(id: BodyId, mass: MassProperties) -> Self {
        let inv_mass = if mass.mass > 0.0 { 1.0 / mass.mass } else { 0.0 };
        let inv_inertia = mass.inertia.try_inverse().unwrap_or_else(Matrix3::zeros);
        Self {
            id,
            pose: Pose::identity(),
            twist: Twist::zero(),
            mass: mass.mass,
            inv_mass,
            inertia: mass.inertia,
            inv_inertia,
            force: Vector3::zeros(),
            torque: Vector3::zeros(),
            flags: BodyFlags::default(),
        }
    }

    /// Set the pose.
    #[must_use]
    pub fn with_pose(mut self, pose: Pose) -> Self {
        self.pose = pose;
        self
    }

    /// Set the position, keeping the orientation.
    #[must_use]
    pub fn with_position(mut self, position: Point3<f64>) -> Self {
        self.pose.position = position;
        self
    }

    /// Set the linear velocity.
    #[must_use]
    pub fn with_linear_velocity(mut self, v: Vector3<f64>) -> Self {
        self.twist.linear = v;
        self
    }

    /// Set the angular velocity.
    #[must_use]
    pub fn with_angular_velocity(mut self, omega: Vector3<f64>) -> Self {
        self.twist.angular = omega;
        self
    }

    /// Exempt the body from world gravity.
    #[must_use]
    pub fn without_gravity(mut self) -> Self {
        self.flags.gravity_exempt = true;
        self
    }

    /// Enable gyroscopic torque.
    #[must_use]
    pub fn with_gyroscopic(mut self) -> Self {
        self.flags.gyroscopic = true;
        self
    }

    /// Add a force through the center of mass.
    pub fn add_force(&mut self, force: Vector3<f64>) {
        self.force += force;
    }

    /// Add a torque.
    pub fn add_torque(&mut self, torque: Vector3<f64>) {
        self.torque += torque;
    }

    /// Inverse inertia rotated into world frame: `R·I⁻¹·Rᵀ`.
    #[must_use]
    pub fn world_inv_inertia(&self) -> Matrix3<f64> {
        let r = self.pose.rotation_matrix();
        r * self.inv_inertia * r.transpose()
    }

    /// Inertia rotated into world frame: `R·I·Rᵀ`.
    #[must_use]
    pub fn world_inertia(&self) -> Matrix3<f64> {
        let r = self.pose.rotation_matrix();
        r * self.inertia * r.transpose()
    }

    /// Zero the force and torque accumulators.
    pub fn clear_accumulators(&mut self) {
        self.force = Vector3::zeros();
        self.torque = Vector3::zeros();
    }
}

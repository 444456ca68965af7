//! Configuration types for the quickstep solver.
//!
//! Every solver policy is a runtime value resolved once per step: row
//! ordering, convergence norm, force merging across chunks, preconditioning,
//! damping and warm starting are all plain fields here.

use crate::dynamics::Gravity;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// World-level parameters consumed by every step.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WorldConfig {
    /// Gravity applied to every body not flagged gravity-exempt.
    pub gravity: Gravity,
    /// Constraint force mixing applied to rows whose joint does not set its own.
    pub global_cfm: f64,
    /// Error reduction parameter passed to joints when filling rows.
    pub global_erp: f64,
    /// Solver parameters.
    pub quickstep: QuickStepConfig,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            gravity: Gravity::earth(),
            global_cfm: 1e-5,
            global_erp: 0.2,
            quickstep: QuickStepConfig::default(),
        }
    }
}

impl WorldConfig {
    /// Default world without gravity.
    #[must_use]
    pub fn zero_gravity() -> Self {
        Self {
            gravity: Gravity::zero(),
            ..Default::default()
        }
    }

    /// Set the gravity.
    #[must_use]
    pub fn with_gravity(mut self, gravity: Gravity) -> Self {
        self.gravity = gravity;
        self
    }

    /// Set the global CFM.
    #[must_use]
    pub fn with_cfm(mut self, cfm: f64) -> Self {
        self.global_cfm = cfm;
        self
    }

    /// Set the global ERP.
    #[must_use]
    pub fn with_erp(mut self, erp: f64) -> Self {
        self.global_erp = erp;
        self
    }

    /// Set the solver configuration.
    #[must_use]
    pub fn with_quickstep(mut self, quickstep: QuickStepConfig) -> Self {
        self.quickstep = quickstep;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if !self.global_cfm.is_finite() || self.global_cfm < 0.0 {
            return Err(crate::SimError::invalid_config(
                "global_cfm must be finite and non-negative",
            ));
        }

        if !(0.0..=1.0).contains(&self.global_erp) {
            return Err(crate::SimError::invalid_config(
                "global_erp must be between 0 and 1",
            ));
        }

        if !self.gravity.acceleration.iter().all(|a| a.is_finite()) {
            return Err(crate::SimError::invalid_config("gravity must be finite"));
        }

        self.quickstep.validate()
    }
}

/// Parameters of the SOR-LCP iteration and its row scheduling.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct QuickStepConfig {
    /// Iteration budget per chunk.
    pub iterations: usize,
    /// SOR relaxation factor `w`, in (0, 2).
    pub sor_w: f64,
    /// A chunk stops once its residual drops strictly below this value.
    /// Zero runs the full budget.
    pub tolerance: f64,
    /// How the per-iteration residual is measured.
    pub convergence: ConvergenceNorm,
    /// Row visitation policy.
    pub reorder: ReorderPolicy,
    /// Serialize writes to the shared row order during reordering.
    pub lock_while_reordering: bool,
    /// Seed lambda from the previous step (scaled by 0.9).
    pub warm_start: bool,
    /// Assemble damping rows and run the damping sub-steps.
    pub joint_damping: bool,
    /// Right-hand side preconditioning pass.
    pub preconditioning: RhsPreconditioner,
    /// How chunks combine their contributions to the shared accumulators.
    pub merge: ForceMerge,
    /// Number of row chunks (0 behaves like 1).
    pub num_chunks: usize,
    /// Rows added on each side of every chunk.
    pub num_overlap: usize,
    /// Seed for the chunk-local shuffles.
    pub random_seed: u64,
    /// Emit per-iteration residuals at trace level.
    pub report_convergence: bool,
}

impl Default for QuickStepConfig {
    fn default() -> Self {
        Self {
            iterations: 20,
            sor_w: 1.3,
            tolerance: 0.0,
            convergence: ConvergenceNorm::Rms,
            reorder: ReorderPolicy::Random,
            lock_while_reordering: false,
            warm_start: true,
            joint_damping: true,
            preconditioning: RhsPreconditioner::GaussSeidel,
            merge: ForceMerge::Shared,
            num_chunks: 1,
            num_overlap: 0,
            random_seed: 0,
            report_convergence: false,
        }
    }
}

impl QuickStepConfig {
    /// Fewer iterations for interactive frame rates.
    #[must_use]
    pub fn realtime() -> Self {
        Self {
            iterations: 10,
            ..Default::default()
        }
    }

    /// Long iteration budget with error-driven ordering.
    #[must_use]
    pub fn high_accuracy() -> Self {
        Self {
            iterations: 50,
            tolerance: 1e-10,
            reorder: ReorderPolicy::ByError,
            ..Default::default()
        }
    }

    /// Fixed ordering on a single chunk: bit-reproducible across runs.
    #[must_use]
    pub fn deterministic() -> Self {
        Self {
            reorder: ReorderPolicy::Partitioned,
            num_chunks: 1,
            num_overlap: 0,
            ..Default::default()
        }
    }

    /// Set the iteration budget.
    #[must_use]
    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    /// Set the SOR relaxation factor.
    #[must_use]
    pub fn with_sor_w(mut self, w: f64) -> Self {
        self.sor_w = w;
        self
    }

    /// Set the convergence tolerance and norm.
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: f64, norm: ConvergenceNorm) -> Self {
        self.tolerance = tolerance;
        self.convergence = norm;
        self
    }

    /// Set the row ordering policy.
    #[must_use]
    pub fn with_reorder(mut self, reorder: ReorderPolicy) -> Self {
        self.reorder = reorder;
        self
    }

    /// Split the rows into `num_chunks` chunks widened by `num_overlap` rows.
    #[must_use]
    pub fn with_chunks(mut self, num_chunks: usize, num_overlap: usize) -> Self {
        self.num_chunks = num_chunks;
        self.num_overlap = num_overlap;
        self
    }

    /// Set the merge strategy.
    #[must_use]
    pub fn with_merge(mut self, merge: ForceMerge) -> Self {
        self.merge = merge;
        self
    }

    /// Enable or disable warm starting.
    #[must_use]
    pub fn with_warm_start(mut self, enabled: bool) -> Self {
        self.warm_start = enabled;
        self
    }

    /// Enable or disable joint damping.
    #[must_use]
    pub fn with_joint_damping(mut self, enabled: bool) -> Self {
        self.joint_damping = enabled;
        self
    }

    /// Set the preconditioning pass.
    #[must_use]
    pub fn with_preconditioning(mut self, preconditioning: RhsPreconditioner) -> Self {
        self.preconditioning = preconditioning;
        self
    }

    /// Serialize write-backs of the shared row order.
    #[must_use]
    pub fn with_lock_while_reordering(mut self, enabled: bool) -> Self {
        self.lock_while_reordering = enabled;
        self
    }

    /// Emit per-iteration residuals at trace level.
    #[must_use]
    pub fn with_report_convergence(mut self, enabled: bool) -> Self {
        self.report_convergence = enabled;
        self
    }

    /// Set the shuffle seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    /// Chunk count with the zero case folded into one.
    #[must_use]
    pub fn effective_chunks(&self) -> usize {
        self.num_chunks.max(1)
    }

    /// Validate the solver configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if !(self.sor_w > 0.0 && self.sor_w < 2.0) {
            return Err(crate::SimError::invalid_config(format!(
                "sor_w must be in (0, 2), got {}",
                self.sor_w
            )));
        }

        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(crate::SimError::invalid_config(
                "tolerance must be finite and non-negative",
            ));
        }

        Ok(())
    }
}

/// Residual measure used for the per-chunk convergence test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ConvergenceNorm {
    /// Square root of the sum of squared row deltas.
    #[default]
    Rms,
    /// Largest absolute row delta.
    MaxAbs,
}

/// Order in which a chunk visits its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ReorderPolicy {
    /// Unbounded rows first, then friction-coupled rows, fixed for the step.
    Partitioned,
    /// Partitioned, then shuffled within the chunk every eighth iteration.
    #[default]
    Random,
    /// Unbounded rows first, then by ascending change in lambda since the
    /// previous iteration.
    ByError,
}

/// Right-hand side preconditioning applied before the main solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RhsPreconditioner {
    /// Fixed 30-sweep Gauss-Seidel pass in body-velocity space.
    ///
    /// The solved velocities are mapped back through the mass matrix, so the
    /// right-hand side is only preserved for unit masses. A body of mass `m`
    /// hanging from a joint under gravity leaves the step moving at about
    /// `(m - 1)·g·h` against gravity; use [`Disabled`](Self::Disabled) where
    /// that drift matters.
    #[default]
    GaussSeidel,
    /// Use the right-hand side as assembled.
    Disabled,
}

/// How concurrently running chunks combine their accumulator updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ForceMerge {
    /// All chunks read and write the same buffers without ordering.
    /// Lost updates are tolerated as relaxation noise.
    #[default]
    Shared,
    /// Each chunk works on private copies which are summed in chunk order
    /// after the barrier.
    Reduce,
}

impl std::fmt::Display for ReorderPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Partitioned => write!(f, "partitioned"),
            Self::Random => write!(f, "random"),
            Self::ByError => write!(f, "by-error"),
        }
    }
}

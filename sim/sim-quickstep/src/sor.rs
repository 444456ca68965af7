//! Projected SOR iteration over the constraint rows.
//!
//! # Setup
//!
//! For every row `i`:
//!
//! ```text
//! iMJ_i   = M⁻¹·J_iᵀ                    (per body block)
//! Ad_i    = w / (J_i·iMJ_i + cfm_i)
//! J_i    *= Ad_i,  rhs_i *= Ad_i,  ad_cfm_i = Ad_i·cfm_i
//! ```
//!
//! and `fc = Σ iMJ_i·λ_i` for the (warm-started) impulses, so `fc` always
//! holds the body velocity change the current `λ` produces.
//!
//! # Row update
//!
//! ```text
//! δ  = rhs_i - λ_i·ad_cfm_i + b_damp_i - J_i·fc
//! λ' = clamp(λ_i + δ, lo_i, hi_i)
//! fc += (λ' - λ_i)·iMJ_i
//! ```
//!
//! Friction rows take their bounds from the row they are coupled to:
//! `±|hi_i·λ_findex|`, read at the time the row is visited.
//!
//! # Ordering
//!
//! Rows without a friction index are placed first, so normal impulses are
//! available when friction rows read them. [`ReorderPolicy::Random`]
//! shuffles each chunk every [`RANDOM_REORDER_PERIOD`] iterations;
//! [`ReorderPolicy::ByError`] sorts each chunk by the change of `λ` over the
//! previous iteration.

use std::sync::{Mutex, PoisonError};

use nalgebra::Matrix3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sim_types::{ConvergenceNorm, ForceMerge, QuickStepConfig, ReorderPolicy, RigidBody};
use tracing::{debug, trace, warn};

use crate::arena::StepArena;
use crate::assembly::ConstraintRows;
use crate::damping::{DampingCoupling, DampingRows};
use crate::rows::{body_range, dot6, BodyPair, JacobianMatrix, JacobianRow};
use crate::schedule::{dispatch, partition_rows, ChunkTask, RowChunk, TaskPool};
use crate::shared::{Accumulator, SharedIndices, SharedReals};
use crate::Result;

/// Scale applied to stored impulses when warm starting.
pub const WARM_START_FACTOR: f64 = 0.9;

/// Iterations between shuffles under [`ReorderPolicy::Random`].
pub const RANDOM_REORDER_PERIOD: usize = 8;

/// Iterations run in natural order under [`ReorderPolicy::ByError`] before
/// error history is available.
pub const NATURAL_ORDER_ITERATIONS: usize = 2;

/// Outcome of one chunk's iteration loop.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChunkReport {
    /// Rows the chunk processed.
    pub chunk: RowChunk,
    /// Iterations actually run.
    pub iterations: usize,
    /// Residual of the last iteration.
    pub residual: f64,
    /// Whether the residual dropped below the tolerance.
    pub converged: bool,
}

/// `iMJ = M⁻¹·Jᵀ`, row by row.
pub fn compute_inv_mass_jt(
    rows: &ConstraintRows,
    bodies: &[RigidBody],
    inv_inertia: &[Matrix3<f64>],
    out: &mut JacobianMatrix,
) {
    for (i, pair) in rows.pairs.iter().enumerate() {
        let j = rows.jacobian.row(i);
        let mut imj = out.row_mut(i);
        let b1 = pair.first;
        imj.set_linear1(&(j.linear1() * bodies[b1].inv_mass));
        imj.set_angular1(&(inv_inertia[b1] * j.angular1()));
        if let Some(b2) = pair.second {
            imj.set_linear2(&(j.linear2() * bodies[b2].inv_mass));
            imj.set_angular2(&(inv_inertia[b2] * j.angular2()));
        }
    }
}

/// Add `Σ iMJ_i·λ_i` to `fc`.
pub fn accumulate_constraint_force(
    inv_mass_jt: &JacobianMatrix,
    pairs: &[BodyPair],
    lambda: &SharedReals,
    fc: &SharedReals,
) {
    for (i, pair) in pairs.iter().enumerate() {
        let l = lambda.get(i);
        if l == 0.0 {
            continue;
        }
        let row = inv_mass_jt.row(i);
        for (k, v) in body_range(pair.first).zip(row.body1()) {
            fc.add(k, v * l);
        }
        if let Some(b2) = pair.second {
            for (k, v) in body_range(b2).zip(row.body2()) {
                fc.add(k, v * l);
            }
        }
    }
}

/// Compute `Ad`, scale `J` and `rhs` by it, and fill `ad_cfm`.
///
/// A row whose denominator is not positive is switched off (`Ad = 0`).
pub fn scale_rows(
    rows: &mut ConstraintRows,
    inv_mass_jt: &JacobianMatrix,
    sor_w: f64,
    ad: &mut [f64],
    ad_cfm: &mut [f64],
) {
    for i in 0..rows.len() {
        let pair = rows.pairs[i];
        let j = rows.jacobian.row(i);
        let imj = inv_mass_jt.row(i);
        let mut denominator = dot6(j.body1(), imj.body1()) + rows.cfm[i];
        if pair.second.is_some() {
            denominator += dot6(j.body2(), imj.body2());
        }

        let scale = if denominator > 0.0 {
            sor_w / denominator
        } else {
            warn!(row = i, denominator, "constraint row has no effective mass, disabling it");
            0.0
        };

        rows.jacobian.row_mut(i).scale(scale);
        rows.rhs[i] *= scale;
        ad[i] = scale;
        ad_cfm[i] = scale * rows.cfm[i];
    }
}

/// Rows without a friction index from the head, coupled rows from the tail.
pub fn partition_order(findex: &[Option<usize>], order: &SharedIndices) {
    let mut head = 0;
    let mut tail = findex.len();
    for (i, coupled) in findex.iter().enumerate() {
        if coupled.is_none() {
            order.set(head, i);
            head += 1;
        } else {
            tail -= 1;
            order.set(tail, i);
        }
    }
}

fn chunk_seed(seed: u64, step: u64, chunk: usize) -> u64 {
    seed ^ step.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (chunk as u64 + 1).wrapping_mul(0xC2B2_AE3D_27D4_EB4F)
}

fn shuffle(rows: &mut [usize], rng: &mut StdRng) {
    for i in 1..rows.len() {
        let j = rng.gen_range(0..=i);
        rows.swap(i, j);
    }
}

/// The scaled row system, read-only during the iteration.
#[derive(Debug, Clone, Copy)]
pub struct RowSystem<'a> {
    /// `Ad`-scaled Jacobian.
    pub jacobian: &'a JacobianMatrix,
    /// `M⁻¹·Jᵀ`, unscaled.
    pub inv_mass_jt: &'a JacobianMatrix,
    /// Bodies per row.
    pub pairs: &'a [BodyPair],
    /// Lower bounds.
    pub lo: &'a [f64],
    /// Upper bounds.
    pub hi: &'a [f64],
    /// Friction coupling.
    pub findex: &'a [Option<usize>],
    /// `Ad`-scaled right-hand side.
    pub rhs: &'a [f64],
    /// `Ad` per row.
    pub ad: &'a [f64],
    /// `Ad·cfm` per row.
    pub ad_cfm: &'a [f64],
    /// Damping projection `b_damp`, when damping rows exist.
    pub damping_bias: Option<&'a SharedReals>,
}

impl RowSystem<'_> {
    fn row_dot<F: Accumulator + ?Sized>(row: &JacobianRow<'_>, pair: BodyPair, fc: &F) -> f64 {
        let mut sum: f64 = body_range(pair.first)
            .zip(row.body1())
            .map(|(k, j)| j * fc.get(k))
            .sum();
        if let Some(b2) = pair.second {
            sum += body_range(b2)
                .zip(row.body2())
                .map(|(k, j)| j * fc.get(k))
                .sum::<f64>();
        }
        sum
    }

    /// Relax row `i`, returning the applied impulse change.
    fn relax<F, L>(&self, i: usize, fc: &mut F, lambda: &mut L) -> f64
    where
        F: Accumulator + ?Sized,
        L: Accumulator + ?Sized,
    {
        let pair = self.pairs[i];
        let old = lambda.get(i);

        let mut delta = self.rhs[i] - old * self.ad_cfm[i];
        if let Some(bias) = self.damping_bias {
            delta += bias.get(i);
        }
        delta -= Self::row_dot(&self.jacobian.row(i), pair, &*fc);

        let (lo, hi) = match self.findex[i] {
            Some(coupled) => {
                let limit = (self.hi[i] * lambda.get(coupled)).abs();
                (-limit, limit)
            }
            None => (self.lo[i], self.hi[i]),
        };

        let new = old + delta;
        let new = if new < lo {
            delta = lo - old;
            lo
        } else if new > hi {
            delta = hi - old;
            hi
        } else {
            new
        };
        lambda.set(i, new);

        let imj = self.inv_mass_jt.row(i);
        for (k, v) in body_range(pair.first).zip(imj.body1()) {
            fc.add(k, delta * v);
        }
        if let Some(b2) = pair.second {
            for (k, v) in body_range(b2).zip(imj.body2()) {
                fc.add(k, delta * v);
            }
        }
        delta
    }
}

/// Per-chunk buffers, allocated before dispatch.
#[derive(Debug, Default)]
struct ChunkScratch {
    chunk: RowChunk,
    order: Vec<usize>,
    errors: Vec<f64>,
    last_lambda: Vec<f64>,
    fc: Vec<f64>,
    lambda: Vec<f64>,
}

impl ChunkScratch {
    fn allocate(
        arena: &mut StepArena,
        chunk: RowChunk,
        config: &QuickStepConfig,
        private: bool,
        fc: &SharedReals,
        lambda: &SharedReals,
    ) -> Result<Self> {
        let width = chunk.len();
        let needs_order = private || config.reorder != ReorderPolicy::Partitioned;
        let by_error = config.reorder == ReorderPolicy::ByError;

        let mut scratch = Self {
            chunk,
            order: arena.alloc(if needs_order { width } else { 0 }, 0)?,
            errors: arena.alloc(if by_error { width } else { 0 }, 0.0)?,
            last_lambda: arena.alloc(if by_error { width } else { 0 }, 0.0)?,
            fc: arena.alloc(if private { fc.len() } else { 0 }, 0.0)?,
            lambda: arena.alloc(if private { lambda.len() } else { 0 }, 0.0)?,
        };
        fc.copy_to(&mut scratch.fc);
        lambda.copy_to(&mut scratch.lambda);
        Ok(scratch)
    }
}

/// Row order as seen by one chunk.
enum ChunkOrder<'s> {
    /// Positions read from the shared order; reordering goes through
    /// `scratch` and is written back.
    Shared {
        order: &'s SharedIndices,
        scratch: &'s mut [usize],
        lock: Option<&'s Mutex<()>>,
    },
    /// The chunk owns its order outright.
    Private(&'s mut [usize]),
}

impl ChunkOrder<'_> {
    fn row(&self, chunk: &RowChunk, pos: usize) -> usize {
        match self {
            Self::Shared { order, .. } => order.get(pos),
            Self::Private(rows) => rows[pos - chunk.start],
        }
    }

    fn permute(&mut self, chunk: &RowChunk, f: impl FnOnce(&mut [usize])) {
        match self {
            Self::Shared {
                order,
                scratch,
                lock,
            } => {
                let _guard = lock.map(|l| l.lock().unwrap_or_else(PoisonError::into_inner));
                for (k, slot) in scratch.iter_mut().enumerate() {
                    *slot = order.get(chunk.start + k);
                }
                f(&mut scratch[..]);
                for (k, &row) in scratch.iter().enumerate() {
                    order.set(chunk.start + k, row);
                }
            }
            Self::Private(rows) => f(&mut rows[..]),
        }
    }
}

/// Everything one chunk needs to run its iteration loop.
#[derive(Clone, Copy)]
struct ChunkKernel<'a> {
    sys: RowSystem<'a>,
    config: &'a QuickStepConfig,
    damping: Option<DampingCoupling<'a>>,
}

impl ChunkKernel<'_> {
    #[allow(clippy::too_many_arguments)]
    fn reorder<L: Accumulator + ?Sized>(
        &self,
        iteration: usize,
        chunk: &RowChunk,
        order: &mut ChunkOrder<'_>,
        errors: &mut [f64],
        last_lambda: &mut [f64],
        lambda: &L,
        rng: &mut StdRng,
    ) {
        match self.config.reorder {
            ReorderPolicy::Partitioned => {}
            ReorderPolicy::Random => {
                if iteration % RANDOM_REORDER_PERIOD == 0 {
                    order.permute(chunk, |rows| shuffle(rows, rng));
                }
            }
            ReorderPolicy::ByError => {
                let start = chunk.start;
                let sorted = iteration >= NATURAL_ORDER_ITERATIONS;
                if sorted {
                    for (k, error) in errors.iter_mut().enumerate() {
                        let now = lambda.get(start + k);
                        let before = last_lambda[k];
                        *error = if now == 0.0 && before == 0.0 {
                            f64::INFINITY
                        } else {
                            (now - before).abs()
                        };
                    }
                }

                let errors = &*errors;
                let findex = self.sys.findex;
                order.permute(chunk, |rows| {
                    for (k, row) in rows.iter_mut().enumerate() {
                        *row = start + k;
                    }
                    if sorted {
                        rows.sort_by(|&a, &b| {
                            findex[a]
                                .is_some()
                                .cmp(&findex[b].is_some())
                                .then(errors[a - start].total_cmp(&errors[b - start]))
                        });
                    }
                });

                for (k, last) in last_lambda.iter_mut().enumerate() {
                    *last = lambda.get(start + k);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run<F, L>(
        &self,
        chunk: RowChunk,
        order: &mut ChunkOrder<'_>,
        errors: &mut [f64],
        last_lambda: &mut [f64],
        fc: &mut F,
        lambda: &mut L,
        rng: &mut StdRng,
    ) -> ChunkReport
    where
        F: Accumulator + ?Sized,
        L: Accumulator + ?Sized,
    {
        let config = self.config;
        let mut report = ChunkReport {
            chunk,
            ..ChunkReport::default()
        };

        for iteration in 0..config.iterations {
            if let Some(damping) = &self.damping {
                damping.sub_step(
                    iteration,
                    config.iterations,
                    &*fc,
                    self.sys.inv_mass_jt,
                    self.sys.ad,
                    self.sys.pairs,
                );
            }

            self.reorder(iteration, &chunk, order, errors, last_lambda, &*lambda, rng);

            let mut sum_sq = 0.0;
            let mut max_abs: f64 = 0.0;
            for pos in chunk.start..chunk.end {
                let i = order.row(&chunk, pos);
                let delta = self.sys.relax(i, fc, lambda);
                sum_sq += delta * delta;
                max_abs = max_abs.max(delta.abs());
            }

            report.iterations = iteration + 1;
            report.residual = match config.convergence {
                ConvergenceNorm::Rms => sum_sq.sqrt(),
                ConvergenceNorm::MaxAbs => max_abs,
            };

            if config.report_convergence {
                trace!(
                    chunk = chunk.index,
                    iteration,
                    residual = report.residual,
                    "sor iteration"
                );
            }

            if report.residual < config.tolerance {
                report.converged = true;
                break;
            }
        }

        if !report.converged && config.tolerance > 0.0 {
            debug!(
                chunk = chunk.index,
                residual = report.residual,
                tolerance = config.tolerance,
                "iteration budget exhausted before convergence"
            );
        }
        report
    }

    #[allow(clippy::too_many_arguments)]
    fn run_task(
        &self,
        scratch: &mut ChunkScratch,
        shared_order: &SharedIndices,
        lock: Option<&Mutex<()>>,
        fc: &SharedReals,
        lambda: &SharedReals,
        seed: u64,
        private: bool,
    ) -> ChunkReport {
        let chunk = scratch.chunk;
        let mut rng = StdRng::seed_from_u64(seed);
        let ChunkScratch {
            order: order_buf,
            errors,
            last_lambda,
            fc: fc_private,
            lambda: lambda_private,
            ..
        } = scratch;

        if private {
            for (k, slot) in order_buf.iter_mut().enumerate() {
                *slot = shared_order.get(chunk.start + k);
            }
            let mut order = ChunkOrder::Private(order_buf);
            self.run(
                chunk,
                &mut order,
                errors,
                last_lambda,
                &mut fc_private[..],
                &mut lambda_private[..],
                &mut rng,
            )
        } else {
            let mut order = ChunkOrder::Shared {
                order: shared_order,
                scratch: order_buf,
                lock,
            };
            self.run(
                chunk,
                &mut order,
                errors,
                last_lambda,
                &mut fc.view(),
                &mut lambda.view(),
                &mut rng,
            )
        }
    }
}

/// Fold private chunk results back into the shared buffers in chunk order.
///
/// Each chunk owns the impulses of the rows at its core positions: positions
/// of the shared order, or row indices themselves when `natural_rows`.
fn merge_private(
    scratch: &[ChunkScratch],
    order: &SharedIndices,
    natural_rows: bool,
    fc: &SharedReals,
    lambda: &SharedReals,
) {
    for k in 0..fc.len() {
        let base = fc.get(k);
        let change: f64 = scratch.iter().map(|s| s.fc[k] - base).sum();
        fc.set(k, base + change);
    }
    for s in scratch {
        for pos in s.chunk.core_start..s.chunk.core_end {
            let row = if natural_rows { pos } else { order.get(pos) };
            lambda.set(row, s.lambda[row]);
        }
    }
}

/// Body data the iteration reads besides the rows themselves.
#[derive(Debug, Clone, Copy)]
pub struct LcpBodies<'a> {
    /// Bodies of the step.
    pub bodies: &'a [RigidBody],
    /// World-frame inverse inertia per body.
    pub inv_inertia: &'a [Matrix3<f64>],
    /// Damping rows, when damping is active this step.
    pub damping: Option<&'a DampingRows>,
    /// Step size `h`.
    pub step: f64,
    /// Monotonic step counter, mixed into the shuffle seeds.
    pub step_index: u64,
}

/// Solve for `lambda` and the resulting `fc`.
///
/// On entry `lambda` holds the warm-start impulses and `fc` is zero;
/// `reports` must hold one slot per chunk of [`partition_rows`].
#[allow(clippy::too_many_arguments)]
pub fn solve_lcp(
    arena: &mut StepArena,
    pool: Option<&dyn TaskPool>,
    config: &QuickStepConfig,
    input: &LcpBodies<'_>,
    rows: &mut ConstraintRows,
    lambda: &SharedReals,
    fc: &SharedReals,
    reports: &mut [ChunkReport],
) -> Result<()> {
    let m = rows.len();
    arena.scoped(|arena| {
        let mut inv_mass_jt = JacobianMatrix::zeroed(arena, m)?;
        compute_inv_mass_jt(rows, input.bodies, input.inv_inertia, &mut inv_mass_jt);
        accumulate_constraint_force(&inv_mass_jt, &rows.pairs, lambda, fc);

        let mut ad = arena.alloc(m, 0.0)?;
        let mut ad_cfm = arena.alloc(m, 0.0)?;
        scale_rows(rows, &inv_mass_jt, config.sor_w, &mut ad, &mut ad_cfm);

        let order = SharedIndices::zeroed(arena, m)?;
        partition_order(&rows.findex, &order);

        let damping_bias = SharedReals::zeroed(arena, if input.damping.is_some() { m } else { 0 })?;

        let chunk_count = partition_rows(m, config.effective_chunks(), config.num_overlap).count();
        debug_assert_eq!(reports.len(), chunk_count);
        let private = config.merge == ForceMerge::Reduce && chunk_count > 1;
        let mut scratch = Vec::with_capacity(chunk_count);
        for chunk in partition_rows(m, config.effective_chunks(), config.num_overlap) {
            scratch.push(ChunkScratch::allocate(arena, chunk, config, private, fc, lambda)?);
        }

        let rows: &ConstraintRows = rows;
        let kernel = ChunkKernel {
            sys: RowSystem {
                jacobian: &rows.jacobian,
                inv_mass_jt: &inv_mass_jt,
                pairs: &rows.pairs,
                lo: &rows.lo,
                hi: &rows.hi,
                findex: &rows.findex,
                rhs: &rows.rhs,
                ad: &ad,
                ad_cfm: &ad_cfm,
                damping_bias: input.damping.map(|_| &damping_bias),
            },
            config,
            damping: input.damping.map(|damping| DampingCoupling {
                rows: damping,
                bodies: input.bodies,
                inv_inertia: input.inv_inertia,
                bias: &damping_bias,
                step: input.step,
            }),
        };

        let lock = Mutex::new(());
        let lock = config.lock_while_reordering.then_some(&lock);
        let order = &order;
        let tasks: Vec<ChunkTask<'_>> = scratch
            .iter_mut()
            .zip(reports.iter_mut())
            .map(|(scratch, report)| {
                let seed = chunk_seed(config.random_seed, input.step_index, scratch.chunk.index);
                Box::new(move || {
                    *report = kernel.run_task(scratch, order, lock, fc, lambda, seed, private);
                }) as ChunkTask<'_>
            })
            .collect();
        dispatch(pool, tasks);

        if private {
            let natural_rows = config.reorder == ReorderPolicy::ByError;
            merge_private(&scratch, order, natural_rows, fc, lambda);
        }
        Ok(())
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::assembly::RowCounts;
    use crate::rows::BODY_STRIDE;
    use crate::schedule::GlobalPool;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use sim_types::{BodyId, MassProperties};

    fn unit_bodies(n: u64) -> (Vec<RigidBody>, Vec<Matrix3<f64>>) {
        let bodies = (0..n)
            .map(|i| RigidBody::new(BodyId::new(i), MassProperties::unit()))
            .collect();
        (bodies, vec![Matrix3::identity(); n as usize])
    }

    fn rows_with(arena: &mut StepArena, m: usize) -> ConstraintRows {
        let counts = RowCounts {
            rows: m,
            ..Default::default()
        };
        ConstraintRows::allocate(arena, &counts, 0.0).unwrap()
    }

    struct Solved {
        lambda: Vec<f64>,
        fc: Vec<f64>,
        reports: Vec<ChunkReport>,
    }

    fn solve(
        config: &QuickStepConfig,
        bodies: &[RigidBody],
        inv_inertia: &[Matrix3<f64>],
        build: impl Fn(&mut ConstraintRows),
        m: usize,
        pool: Option<&dyn TaskPool>,
    ) -> Solved {
        let mut arena = StepArena::with_capacity(1 << 20);
        let mut rows = rows_with(&mut arena, m);
        build(&mut rows);
        let lambda = SharedReals::zeroed(&mut arena, m).unwrap();
        let fc = SharedReals::zeroed(&mut arena, bodies.len() * BODY_STRIDE).unwrap();
        let chunks = partition_rows(m, config.effective_chunks(), config.num_overlap).count();
        let mut reports = vec![ChunkReport::default(); chunks];
        let input = LcpBodies {
            bodies,
            inv_inertia,
            damping: None,
            step: 0.01,
            step_index: 0,
        };
        solve_lcp(
            &mut arena,
            pool,
            config,
            &input,
            &mut rows,
            &lambda,
            &fc,
            &mut reports,
        )
        .unwrap();

        let mut out = Solved {
            lambda: vec![0.0; m],
            fc: vec![0.0; fc.len()],
            reports,
        };
        lambda.copy_to(&mut out.lambda);
        fc.copy_to(&mut out.fc);
        out
    }

    #[test]
    fn test_partition_order() {
        let mut arena = StepArena::with_capacity(1024);
        let order = SharedIndices::zeroed(&mut arena, 5).unwrap();
        partition_order(&[None, Some(0), None, Some(0), None], &order);
        let got: Vec<_> = (0..5).map(|i| order.get(i)).collect();
        assert_eq!(got, vec![0, 2, 4, 3, 1]);
    }

    #[test]
    fn test_shuffle_is_permutation() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut rows: Vec<usize> = (10..30).collect();
        shuffle(&mut rows, &mut rng);
        let mut sorted = rows.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (10..30).collect::<Vec<_>>());
    }

    #[test]
    fn test_chunk_seeds_differ() {
        assert_ne!(chunk_seed(1, 0, 0), chunk_seed(1, 0, 1));
        assert_ne!(chunk_seed(1, 0, 0), chunk_seed(1, 1, 0));
        assert_eq!(chunk_seed(3, 4, 5), chunk_seed(3, 4, 5));
    }

    #[test]
    fn test_scale_rows_disables_empty_row() {
        let mut arena = StepArena::with_capacity(4096);
        let (bodies, inv_inertia) = unit_bodies(1);
        let mut rows = rows_with(&mut arena, 2);
        rows.jacobian.row_mut(0).set_linear1(&Vector3::new(2.0, 0.0, 0.0));
        rows.cfm[0] = 1.0;
        rows.rhs.copy_from_slice(&[10.0, 10.0]);

        let mut imj = JacobianMatrix::zeroed(&mut arena, 2).unwrap();
        compute_inv_mass_jt(&rows, &bodies, &inv_inertia, &mut imj);
        let mut ad = vec![0.0; 2];
        let mut ad_cfm = vec![0.0; 2];
        scale_rows(&mut rows, &imj, 1.0, &mut ad, &mut ad_cfm);

        assert_relative_eq!(ad[0], 0.2);
        assert_relative_eq!(ad_cfm[0], 0.2);
        assert_relative_eq!(rows.rhs[0], 2.0);
        assert_relative_eq!(rows.jacobian.row(0).linear1().x, 0.4);
        assert_eq!(ad[1], 0.0);
        assert_eq!(rows.rhs[1], 0.0);
    }

    #[test]
    fn test_single_row_exact() {
        let (bodies, inv_inertia) = unit_bodies(1);
        let config = QuickStepConfig::deterministic()
            .with_sor_w(1.0)
            .with_iterations(5);
        let solved = solve(
            &config,
            &bodies,
            &inv_inertia,
            |rows| {
                rows.jacobian.row_mut(0).set_linear1(&Vector3::x());
                rows.rhs[0] = 2.0;
            },
            1,
            None,
        );

        assert_relative_eq!(solved.lambda[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(solved.fc[0], 2.0, epsilon = 1e-12);
        assert_eq!(solved.reports[0].iterations, 5);
        assert_relative_eq!(solved.reports[0].residual, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_tolerance_stops_early() {
        let (bodies, inv_inertia) = unit_bodies(1);
        let config = QuickStepConfig::deterministic()
            .with_sor_w(1.0)
            .with_iterations(50)
            .with_tolerance(1e-9, ConvergenceNorm::MaxAbs);
        let solved = solve(
            &config,
            &bodies,
            &inv_inertia,
            |rows| {
                rows.jacobian.row_mut(0).set_linear1(&Vector3::x());
                rows.rhs[0] = 2.0;
            },
            1,
            None,
        );

        assert!(solved.reports[0].converged);
        assert_eq!(solved.reports[0].iterations, 2);
    }

    #[test]
    fn test_friction_bound_scales_with_normal_impulse() {
        let (bodies, inv_inertia) = unit_bodies(1);
        let config = QuickStepConfig::deterministic()
            .with_sor_w(1.0)
            .with_iterations(10);
        let solved = solve(
            &config,
            &bodies,
            &inv_inertia,
            |rows| {
                rows.jacobian.row_mut(0).set_linear1(&Vector3::z());
                rows.lo[0] = 0.0;
                rows.rhs[0] = 2.0;

                rows.jacobian.row_mut(1).set_linear1(&Vector3::x());
                rows.hi[1] = 0.25;
                rows.findex[1] = Some(0);
                rows.rhs[1] = 10.0;
            },
            2,
            None,
        );

        assert_relative_eq!(solved.lambda[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(solved.lambda[1], 0.5, epsilon = 1e-12);
        assert_relative_eq!(solved.fc[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(solved.fc[2], 2.0, epsilon = 1e-12);
    }

    /// Friction row 0 coupled to normal row 1, which comes later in natural
    /// order.
    fn friction_before_normal(rows: &mut ConstraintRows) {
        rows.jacobian.row_mut(0).set_linear1(&Vector3::x());
        rows.hi[0] = 0.25;
        rows.findex[0] = Some(1);
        rows.rhs[0] = 10.0;

        rows.jacobian.row_mut(1).set_linear1(&Vector3::z());
        rows.lo[1] = 0.0;
        rows.rhs[1] = 2.0;
    }

    #[test]
    fn test_forward_friction_index_reads_previous_iteration() {
        let (bodies, inv_inertia) = unit_bodies(1);
        let natural = QuickStepConfig::default()
            .with_reorder(ReorderPolicy::ByError)
            .with_sor_w(1.0);

        // First sweep: the normal impulse is still zero when row 0 is visited.
        let one = solve(
            &natural.with_iterations(1),
            &bodies,
            &inv_inertia,
            friction_before_normal,
            2,
            None,
        );
        assert_eq!(one.lambda[0], 0.0);
        assert_relative_eq!(one.lambda[1], 2.0, epsilon = 1e-12);
        assert_eq!(one.fc[0], 0.0);

        // Second sweep: row 0 sees the normal impulse from the first.
        let two = solve(
            &natural.with_iterations(2),
            &bodies,
            &inv_inertia,
            friction_before_normal,
            2,
            None,
        );
        assert_relative_eq!(two.lambda[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(two.lambda[1], 2.0, epsilon = 1e-12);
        assert_relative_eq!(two.fc[0], 0.5, epsilon = 1e-12);

        // Partitioned order visits the normal row first, so one sweep is enough.
        let partitioned = solve(
            &QuickStepConfig::deterministic()
                .with_sor_w(1.0)
                .with_iterations(1),
            &bodies,
            &inv_inertia,
            friction_before_normal,
            2,
            None,
        );
        assert_relative_eq!(partitioned.lambda[0], 0.5, epsilon = 1e-12);
    }

    fn two_independent_rows(rows: &mut ConstraintRows) {
        rows.jacobian.row_mut(0).set_linear1(&Vector3::x());
        rows.pairs[0] = BodyPair::new(0, None);
        rows.rhs[0] = 1.0;
        rows.jacobian.row_mut(1).set_linear1(&Vector3::y());
        rows.pairs[1] = BodyPair::new(1, None);
        rows.rhs[1] = 3.0;
    }

    #[test]
    fn test_reduce_matches_shared_for_independent_rows() {
        let (bodies, inv_inertia) = unit_bodies(2);
        let base = QuickStepConfig::deterministic()
            .with_sor_w(1.0)
            .with_iterations(4)
            .with_chunks(2, 0);

        let shared = solve(&base, &bodies, &inv_inertia, two_independent_rows, 2, None);
        let reduced = solve(
            &base.with_merge(ForceMerge::Reduce),
            &bodies,
            &inv_inertia,
            two_independent_rows,
            2,
            Some(&GlobalPool as &dyn TaskPool),
        );

        assert_eq!(shared.reports.len(), 2);
        for (a, b) in shared.lambda.iter().zip(&reduced.lambda) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
        for (a, b) in shared.fc.iter().zip(&reduced.fc) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
        assert_relative_eq!(reduced.lambda[1], 3.0, epsilon = 1e-12);
        assert_relative_eq!(reduced.fc[7], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_reduce_by_error_keeps_every_chunk_result() {
        let (bodies, inv_inertia) = unit_bodies(2);
        let config = QuickStepConfig::default()
            .with_reorder(ReorderPolicy::ByError)
            .with_merge(ForceMerge::Reduce)
            .with_sor_w(1.0)
            .with_iterations(6)
            .with_chunks(2, 0);
        let solved = solve(&config, &bodies, &inv_inertia, two_independent_rows, 2, None);
        assert_relative_eq!(solved.lambda[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(solved.lambda[1], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_by_error_and_random_converge() {
        let (bodies, inv_inertia) = unit_bodies(2);
        for reorder in [ReorderPolicy::ByError, ReorderPolicy::Random] {
            let config = QuickStepConfig::default()
                .with_reorder(reorder)
                .with_sor_w(1.0)
                .with_iterations(12);
            let solved = solve(&config, &bodies, &inv_inertia, two_independent_rows, 2, None);
            assert_relative_eq!(solved.lambda[0], 1.0, epsilon = 1e-12);
            assert_relative_eq!(solved.lambda[1], 3.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_warm_start_lambda_seeds_fc() {
        let mut arena = StepArena::with_capacity(1 << 16);
        let (bodies, inv_inertia) = unit_bodies(1);
        let mut rows = rows_with(&mut arena, 1);
        rows.jacobian.row_mut(0).set_linear1(&Vector3::x());
        let lambda = SharedReals::zeroed(&mut arena, 1).unwrap();
        lambda.set(0, 4.0);
        let fc = SharedReals::zeroed(&mut arena, BODY_STRIDE).unwrap();

        let mut imj = JacobianMatrix::zeroed(&mut arena, 1).unwrap();
        compute_inv_mass_jt(&rows, &bodies, &inv_inertia, &mut imj);
        accumulate_constraint_force(&imj, &rows.pairs, &lambda, &fc);
        assert_eq!(fc.get(0), 4.0);
    }
}

//! Block-structured constraint rows.
//!
//! Each constraint row couples at most two bodies and is stored as twelve
//! contiguous `f64`s:
//!
//! ```text
//! [ l1x l1y l1z  a1x a1y a1z  l2x l2y l2z  a2x a2y a2z ]
//!   linear1      angular1     linear2      angular2
//! ```
//!
//! [`JacobianMatrix`] keeps that flat layout (the SOR inner loop streams
//! through it) and exposes the four named sub-blocks through
//! [`JacobianRow`] / [`JacobianRowMut`], so the stride arithmetic lives
//! in one place. Body-space vectors (`fc`, `tmp1`, damping buffers) use the
//! matching six-wide layout per body, see [`body_range`].

use std::ops::Range;

use nalgebra::Vector3;

use crate::arena::StepArena;
use crate::Result;

/// Values per Jacobian row.
pub const ROW_STRIDE: usize = 12;

/// Values per body in body-space vectors.
pub const BODY_STRIDE: usize = 6;

/// Index range of `body` in a six-wide body-space vector.
#[inline]
#[must_use]
pub const fn body_range(body: usize) -> Range<usize> {
    body * BODY_STRIDE..(body + 1) * BODY_STRIDE
}

#[inline]
pub(crate) fn dot6(a: &[f64], b: &[f64]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2] + a[3] * b[3] + a[4] * b[4] + a[5] * b[5]
}

/// Dense body indices of a row. `second` is `None` when the row constrains
/// a body against the static world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BodyPair {
    /// First body.
    pub first: usize,
    /// Second body, if any.
    pub second: Option<usize>,
}

impl BodyPair {
    /// Create a body pair.
    #[must_use]
    pub const fn new(first: usize, second: Option<usize>) -> Self {
        Self { first, second }
    }
}

/// Read-only view of one Jacobian row.
#[derive(Debug, Clone, Copy)]
pub struct JacobianRow<'a> {
    data: &'a [f64],
}

impl<'a> JacobianRow<'a> {
    /// Wrap a twelve-value slice.
    #[must_use]
    pub fn new(data: &'a [f64]) -> Self {
        debug_assert_eq!(data.len(), ROW_STRIDE);
        Self { data }
    }

    /// Linear block of the first body.
    #[must_use]
    pub fn linear1(&self) -> Vector3<f64> {
        Vector3::new(self.data[0], self.data[1], self.data[2])
    }

    /// Angular block of the first body.
    #[must_use]
    pub fn angular1(&self) -> Vector3<f64> {
        Vector3::new(self.data[3], self.data[4], self.data[5])
    }

    /// Linear block of the second body.
    #[must_use]
    pub fn linear2(&self) -> Vector3<f64> {
        Vector3::new(self.data[6], self.data[7], self.data[8])
    }

    /// Angular block of the second body.
    #[must_use]
    pub fn angular2(&self) -> Vector3<f64> {
        Vector3::new(self.data[9], self.data[10], self.data[11])
    }

    /// Six values acting on the first body.
    #[must_use]
    pub fn body1(&self) -> &'a [f64] {
        &self.data[..BODY_STRIDE]
    }

    /// Six values acting on the second body.
    #[must_use]
    pub fn body2(&self) -> &'a [f64] {
        &self.data[BODY_STRIDE..]
    }

    /// All twelve values.
    #[must_use]
    pub fn as_slice(&self) -> &'a [f64] {
        self.data
    }

    /// `J·v` for a six-wide body-space vector `v`.
    #[must_use]
    pub fn apply(&self, pair: BodyPair, v: &[f64]) -> f64 {
        let mut sum = dot6(self.body1(), &v[body_range(pair.first)]);
        if let Some(b2) = pair.second {
            sum += dot6(self.body2(), &v[body_range(b2)]);
        }
        sum
    }
}

/// Mutable view of one Jacobian row.
#[derive(Debug)]
pub struct JacobianRowMut<'a> {
    data: &'a mut [f64],
}

impl<'a> JacobianRowMut<'a> {
    /// Wrap a twelve-value slice.
    pub fn new(data: &'a mut [f64]) -> Self {
        debug_assert_eq!(data.len(), ROW_STRIDE);
        Self { data }
    }

    fn set3(&mut self, offset: usize, v: &Vector3<f64>) {
        self.data[offset] = v.x;
        self.data[offset + 1] = v.y;
        self.data[offset + 2] = v.z;
    }

    /// Set the linear block of the first body.
    pub fn set_linear1(&mut self, v: &Vector3<f64>) {
        self.set3(0, v);
    }

    /// Set the angular block of the first body.
    pub fn set_angular1(&mut self, v: &Vector3<f64>) {
        self.set3(3, v);
    }

    /// Set the linear block of the second body.
    pub fn set_linear2(&mut self, v: &Vector3<f64>) {
        self.set3(6, v);
    }

    /// Set the angular block of the second body.
    pub fn set_angular2(&mut self, v: &Vector3<f64>) {
        self.set3(9, v);
    }

    /// Multiply every value by `factor`.
    pub fn scale(&mut self, factor: f64) {
        for value in self.data.iter_mut() {
            *value *= factor;
        }
    }
}

/// Dense `rows × 12` Jacobian.
#[derive(Debug, Clone, PartialEq)]
pub struct JacobianMatrix {
    data: Vec<f64>,
}

impl JacobianMatrix {
    /// Allocate a zeroed matrix from the arena.
    pub fn zeroed(arena: &mut StepArena, rows: usize) -> Result<Self> {
        Ok(Self {
            data: arena.alloc(rows * ROW_STRIDE, 0.0)?,
        })
    }

    /// Number of rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.data.len() / ROW_STRIDE
    }

    /// View row `i`.
    #[inline]
    #[must_use]
    pub fn row(&self, i: usize) -> JacobianRow<'_> {
        JacobianRow::new(&self.data[i * ROW_STRIDE..(i + 1) * ROW_STRIDE])
    }

    /// Mutable view of row `i`.
    #[inline]
    pub fn row_mut(&mut self, i: usize) -> JacobianRowMut<'_> {
        JacobianRowMut::new(&mut self.data[i * ROW_STRIDE..(i + 1) * ROW_STRIDE])
    }

    /// Raw values of a row range.
    pub fn rows_mut(&mut self, rows: Range<usize>) -> &mut [f64] {
        &mut self.data[rows.start * ROW_STRIDE..rows.end * ROW_STRIDE]
    }

    /// Copy `count` rows starting at `src_row` of `src` into this matrix at
    /// `dst_row`.
    pub fn copy_rows(&mut self, dst_row: usize, src: &Self, src_row: usize, count: usize) {
        let len = count * ROW_STRIDE;
        let dst = dst_row * ROW_STRIDE;
        let from = src_row * ROW_STRIDE;
        self.data[dst..dst + len].copy_from_slice(&src.data[from..from + len]);
    }

    /// Flat storage.
    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }
}

/// Writer handed to a joint for its slice of the global row arrays.
///
/// Row indices are joint-local; the assembler translates friction indices
/// into global rows afterwards.
#[derive(Debug)]
pub struct RowWriter<'a> {
    jacobian: &'a mut [f64],
    bias: &'a mut [f64],
    cfm: &'a mut [f64],
    lo: &'a mut [f64],
    hi: &'a mut [f64],
    findex: &'a mut [Option<usize>],
}

impl<'a> RowWriter<'a> {
    /// Bundle the per-row slices of one joint. All slices must cover the
    /// same number of rows.
    pub fn new(
        jacobian: &'a mut [f64],
        bias: &'a mut [f64],
        cfm: &'a mut [f64],
        lo: &'a mut [f64],
        hi: &'a mut [f64],
        findex: &'a mut [Option<usize>],
    ) -> Self {
        debug_assert_eq!(jacobian.len(), bias.len() * ROW_STRIDE);
        Self {
            jacobian,
            bias,
            cfm,
            lo,
            hi,
            findex,
        }
    }

    /// Rows available to the joint.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.bias.len()
    }

    /// Jacobian blocks of local row `i`.
    pub fn jacobian(&mut self, i: usize) -> JacobianRowMut<'_> {
        JacobianRowMut::new(&mut self.jacobian[i * ROW_STRIDE..(i + 1) * ROW_STRIDE])
    }

    /// Velocity-level bias `c` of row `i` (target constraint velocity).
    pub fn set_bias(&mut self, i: usize, c: f64) {
        self.bias[i] = c;
    }

    /// Constraint force mixing of row `i`; rows left untouched keep the
    /// world's global CFM.
    pub fn set_cfm(&mut self, i: usize, cfm: f64) {
        self.cfm[i] = cfm;
    }

    /// Impulse bounds of row `i`; rows left untouched are unbounded.
    pub fn set_bounds(&mut self, i: usize, lo: f64, hi: f64) {
        self.lo[i] = lo;
        self.hi[i] = hi;
    }

    /// Couple row `i` to local row `coupled`: its bounds become
    /// `±|hi[i]·lambda[coupled]|`.
    pub fn set_friction_index(&mut self, i: usize, coupled: usize) {
        self.findex[i] = Some(coupled);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_named_blocks() {
        let mut arena = StepArena::with_capacity(1024);
        let mut j = JacobianMatrix::zeroed(&mut arena, 2).unwrap();

        {
            let mut row = j.row_mut(1);
            row.set_linear1(&Vector3::new(1.0, 2.0, 3.0));
            row.set_angular1(&Vector3::new(4.0, 5.0, 6.0));
            row.set_linear2(&Vector3::new(7.0, 8.0, 9.0));
            row.set_angular2(&Vector3::new(10.0, 11.0, 12.0));
        }

        assert_eq!(j.rows(), 2);
        let row = j.row(1);
        assert_eq!(row.linear1(), Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(row.angular2(), Vector3::new(10.0, 11.0, 12.0));
        assert_eq!(row.body2()[0], 7.0);
        assert!(j.row(0).as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_apply_skips_missing_body() {
        let mut arena = StepArena::with_capacity(1024);
        let mut j = JacobianMatrix::zeroed(&mut arena, 1).unwrap();
        j.row_mut(0).set_linear1(&Vector3::x());
        j.row_mut(0).set_linear2(&Vector3::new(100.0, 0.0, 0.0));

        let v = [2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 5.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        assert_relative_eq!(j.row(0).apply(BodyPair::new(0, None), &v), 2.0);
        assert_relative_eq!(j.row(0).apply(BodyPair::new(0, Some(1)), &v), 502.0);
    }

    #[test]
    fn test_copy_rows() {
        let mut arena = StepArena::with_capacity(4096);
        let mut src = JacobianMatrix::zeroed(&mut arena, 3).unwrap();
        src.row_mut(2).set_angular1(&Vector3::z());
        let mut dst = JacobianMatrix::zeroed(&mut arena, 1).unwrap();
        dst.copy_rows(0, &src, 2, 1);
        assert_eq!(dst.row(0).angular1(), Vector3::z());
    }

    #[test]
    fn test_row_writer() {
        let mut jac = vec![0.0; 2 * ROW_STRIDE];
        let mut bias = vec![0.0; 2];
        let mut cfm = vec![1e-5; 2];
        let mut lo = vec![f64::NEG_INFINITY; 2];
        let mut hi = vec![f64::INFINITY; 2];
        let mut findex = vec![None; 2];

        let mut writer =
            RowWriter::new(&mut jac, &mut bias, &mut cfm, &mut lo, &mut hi, &mut findex);
        assert_eq!(writer.rows(), 2);
        writer.jacobian(1).set_linear1(&Vector3::y());
        writer.set_bias(0, 0.5);
        writer.set_bounds(1, -0.3, 0.3);
        writer.set_friction_index(1, 0);

        assert_eq!(jac[ROW_STRIDE + 1], 1.0);
        assert_eq!(bias[0], 0.5);
        assert_eq!(lo[1], -0.3);
        assert_eq!(findex, vec![None, Some(0)]);
        assert_eq!(cfm, vec![1e-5; 2]);
    }

    #[test]
    fn test_body_range() {
        assert_eq!(body_range(0), 0..6);
        assert_eq!(body_range(3), 18..24);
    }
}

//! Buffers shared by concurrently running row chunks.
//!
//! # The benign race
//!
//! Chunks update `fc` (and, where chunks overlap, `lambda`) without any
//! ordering between them. Each element is an `AtomicU64` holding `f64` bits,
//! accessed with `Relaxed` loads and stores, so every read sees *some*
//! previously written value and no read is torn. [`SharedReals::add`] is a
//! separate load and store, not a CAS loop: two chunks
//! adding to the same body at once may lose one of the increments. The SOR
//! iteration absorbs this as relaxation noise and later sweeps correct it.
//!
//! Deployments that need run-to-run reproducibility with several chunks use
//! [`ForceMerge::Reduce`](sim_types::ForceMerge::Reduce) instead, which gives
//! each chunk private copies behind the same [`Accumulator`] interface.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::arena::StepArena;
use crate::Result;

/// Read/modify access to a flat `f64` buffer, shared or private.
pub trait Accumulator {
    /// Read element `i`.
    fn get(&self, i: usize) -> f64;

    /// Overwrite element `i`.
    fn set(&mut self, i: usize, value: f64);

    /// Add `delta` to element `i`.
    #[inline]
    fn add(&mut self, i: usize, delta: f64) {
        let value = self.get(i) + delta;
        self.set(i, value);
    }
}

impl Accumulator for [f64] {
    #[inline]
    fn get(&self, i: usize) -> f64 {
        self[i]
    }

    #[inline]
    fn set(&mut self, i: usize, value: f64) {
        self[i] = value;
    }
}

impl Accumulator for Vec<f64> {
    #[inline]
    fn get(&self, i: usize) -> f64 {
        self[i]
    }

    #[inline]
    fn set(&mut self, i: usize, value: f64) {
        self[i] = value;
    }
}

/// `f64` buffer writable through a shared reference.
#[derive(Debug)]
pub struct SharedReals {
    cells: Vec<AtomicU64>,
}

impl SharedReals {
    /// Allocate `len` zeros from the arena.
    pub fn zeroed(arena: &mut StepArena, len: usize) -> Result<Self> {
        let zero = 0.0_f64.to_bits();
        Ok(Self {
            cells: arena.alloc_with(len, || AtomicU64::new(zero))?,
        })
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Read element `i`.
    #[inline]
    #[must_use]
    pub fn get(&self, i: usize) -> f64 {
        f64::from_bits(self.cells[i].load(Ordering::Relaxed))
    }

    /// Overwrite element `i`.
    #[inline]
    pub fn set(&self, i: usize, value: f64) {
        self.cells[i].store(value.to_bits(), Ordering::Relaxed);
    }

    /// Unsynchronized read-modify-write, see the module docs.
    #[inline]
    pub fn add(&self, i: usize, delta: f64) {
        self.set(i, self.get(i) + delta);
    }

    /// Set every element to `value`.
    pub fn fill(&self, value: f64) {
        for i in 0..self.len() {
            self.set(i, value);
        }
    }

    /// Overwrite the buffer from `values`, element by element.
    pub fn load_from(&self, values: &[f64]) {
        for (i, &value) in values.iter().enumerate().take(self.len()) {
            self.set(i, value);
        }
    }

    /// Copy the current contents into `out`.
    pub fn copy_to(&self, out: &mut [f64]) {
        for (i, dst) in out.iter_mut().enumerate().take(self.len()) {
            *dst = self.get(i);
        }
    }

    /// Accumulator view usable from many chunks at once.
    #[must_use]
    pub fn view(&self) -> SharedView<'_> {
        SharedView(self)
    }
}

/// Copyable handle implementing [`Accumulator`] over a [`SharedReals`].
#[derive(Debug, Clone, Copy)]
pub struct SharedView<'a>(&'a SharedReals);

impl Accumulator for SharedView<'_> {
    #[inline]
    fn get(&self, i: usize) -> f64 {
        self.0.get(i)
    }

    #[inline]
    fn set(&mut self, i: usize, value: f64) {
        self.0.set(i, value);
    }
}

/// Row-index buffer writable through a shared reference.
#[derive(Debug)]
pub struct SharedIndices {
    cells: Vec<AtomicUsize>,
}

impl SharedIndices {
    /// Allocate `len` zeros from the arena.
    pub fn zeroed(arena: &mut StepArena, len: usize) -> Result<Self> {
        Ok(Self {
            cells: arena.alloc_with(len, || AtomicUsize::new(0))?,
        })
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Read element `i`.
    #[inline]
    #[must_use]
    pub fn get(&self, i: usize) -> usize {
        self.cells[i].load(Ordering::Relaxed)
    }

    /// Overwrite element `i`.
    #[inline]
    pub fn set(&self, i: usize, value: usize) {
        self.cells[i].store(value, Ordering::Relaxed);
    }
}

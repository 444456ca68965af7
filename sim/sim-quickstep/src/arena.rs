//! Budgeted scratch arena for one solver step.
//!
//! The step memory estimate is computed before anything is allocated; the
//! arena then hands out every buffer the step uses and charges it against
//! that budget like a bump allocator. Buffers are owned `Vec`s so the borrow
//! checker still sees them as independent, but nothing is ever returned to
//! the budget individually: space comes back only when a scoped region ends
//! or when the most recent allocation is shrunk in place.
//!
//! Sizes are charged in [`efficient_size`] units, i.e. rounded up to
//! [`EFFICIENT_ALIGNMENT`], so the estimator and the arena agree on the
//! footprint of every array.

use sim_types::SimError;

use crate::Result;

/// Alignment every allocation is padded to.
pub const EFFICIENT_ALIGNMENT: usize = 16;

/// Round `bytes` up to the next multiple of [`EFFICIENT_ALIGNMENT`].
#[must_use]
pub const fn efficient_size(bytes: usize) -> usize {
    bytes.div_ceil(EFFICIENT_ALIGNMENT) * EFFICIENT_ALIGNMENT
}

/// Charged footprint of `count` values of `T`.
#[must_use]
pub const fn array_size<T>(count: usize) -> usize {
    efficient_size(std::mem::size_of::<T>() * count)
}

/// A saved cursor position, see [`StepArena::mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaMark(usize);

/// Scratch budget for a single step.
#[derive(Debug, Clone, Default)]
pub struct StepArena {
    capacity: usize,
    cursor: usize,
    last_start: usize,
    peak: usize,
}

impl StepArena {
    /// Create an arena with the given byte budget.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Reset for a new step with a fresh budget.
    pub fn begin_step(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.cursor = 0;
        self.last_start = 0;
        self.peak = 0;
    }

    /// Byte budget.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently charged.
    #[must_use]
    pub fn used(&self) -> usize {
        self.cursor
    }

    /// Bytes still available.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.cursor
    }

    /// Highest `used()` value seen since the last [`begin_step`](Self::begin_step).
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak
    }

    fn charge<T>(&mut self, count: usize) -> Result<()> {
        let requested = std::mem::size_of::<T>()
            .checked_mul(count)
            .and_then(|bytes| bytes.checked_add(EFFICIENT_ALIGNMENT - 1))
            .map_or(usize::MAX, |bytes| {
                bytes / EFFICIENT_ALIGNMENT * EFFICIENT_ALIGNMENT
            });

        if requested > self.remaining() {
            return Err(SimError::ArenaExhausted {
                requested,
                remaining: self.remaining(),
            });
        }

        self.last_start = self.cursor;
        self.cursor += requested;
        self.peak = self.peak.max(self.cursor);
        Ok(())
    }

    /// Allocate `count` copies of `value`.
    pub fn alloc<T: Clone>(&mut self, count: usize, value: T) -> Result<Vec<T>> {
        self.charge::<T>(count)?;
        Ok(vec![value; count])
    }

    /// Allocate `count` values produced by `f`.
    pub fn alloc_with<T>(&mut self, count: usize, f: impl FnMut() -> T) -> Result<Vec<T>> {
        self.charge::<T>(count)?;
        let mut buf = Vec::with_capacity(count);
        buf.resize_with(count, f);
        Ok(buf)
    }

    /// Truncate `buf` to `new_len`.
    ///
    /// When `buf` is the most recent allocation its tail is returned to the
    /// budget; otherwise the space stays charged until the enclosing region
    /// is released.
    pub fn shrink<T>(&mut self, buf: &mut Vec<T>, new_len: usize) {
        if new_len >= buf.len() {
            return;
        }
        let old = array_size::<T>(buf.len());
        if self.cursor - self.last_start == old {
            self.cursor = self.last_start + array_size::<T>(new_len);
        }
        buf.truncate(new_len);
    }

    /// Save the current cursor.
    #[must_use]
    pub fn mark(&self) -> ArenaMark {
        ArenaMark(self.cursor)
    }

    /// Return everything allocated since `mark` to the budget.
    pub fn release(&mut self, mark: ArenaMark) {
        debug_assert!(mark.0 <= self.cursor, "arena mark released out of order");
        self.cursor = mark.0.min(self.cursor);
        self.last_start = self.cursor;
    }

    /// Run `f` in a nested region released when it returns.
    ///
    /// Buffers allocated inside cannot outlive the region unless `f`
    /// returns them, in which case their space is still released; callers
    /// keep long-lived buffers outside the region.
    pub fn scoped<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let mark = self.mark();
        let result = f(self);
        self.release(mark);
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_efficient_size_rounds_up() {
        assert_eq!(efficient_size(0), 0);
        assert_eq!(efficient_size(1), 16);
        assert_eq!(efficient_size(16), 16);
        assert_eq!(efficient_size(17), 32);
        assert_eq!(array_size::<f64>(3), 32);
    }

    #[test]
    fn test_alloc_charges_budget() {
        let mut arena = StepArena::with_capacity(64);
        let a = arena.alloc(3, 1.5_f64).unwrap();
        assert_eq!(a, vec![1.5; 3]);
        assert_eq!(arena.used(), 32);
        assert_eq!(arena.remaining(), 32);

        let b = arena.alloc_with(4, || 7_u64).unwrap();
        assert_eq!(b.len(), 4);
        assert_eq!(arena.used(), 64);

        let err = arena.alloc(1, 0_u8).unwrap_err();
        assert!(err.is_arena_exhausted());
    }

    #[test]
    fn test_scoped_region_releases() {
        let mut arena = StepArena::with_capacity(256);
        let _outer = arena.alloc(2, 0.0_f64).unwrap();

        let inner_used = arena.scoped(|arena| {
            let _tmp = arena.alloc(10, 0.0_f64).unwrap();
            arena.used()
        });

        assert_eq!(inner_used, 16 + 80);
        assert_eq!(arena.used(), 16);
        assert_eq!(arena.peak(), 96);
    }

    #[test]
    fn test_shrink_last_allocation() {
        let mut arena = StepArena::with_capacity(1024);
        let _head = arena.alloc(2, 0_u32).unwrap();
        let mut buf = arena.alloc(20, 0.0_f64).unwrap();
        assert_eq!(arena.used(), 16 + 160);

        arena.shrink(&mut buf, 5);
        assert_eq!(buf.len(), 5);
        assert_eq!(arena.used(), 16 + 48);
        assert_eq!(arena.peak(), 176);
    }

    #[test]
    fn test_shrink_older_allocation_keeps_charge() {
        let mut arena = StepArena::with_capacity(1024);
        let mut first = arena.alloc(20, 0.0_f64).unwrap();
        let _second = arena.alloc(2, 0.0_f64).unwrap();

        arena.shrink(&mut first, 1);
        assert_eq!(first.len(), 1);
        assert_eq!(arena.used(), 160 + 16);
    }

    #[test]
    fn test_begin_step_resets() {
        let mut arena = StepArena::with_capacity(64);
        let _a = arena.alloc(8, 0.0_f64).unwrap();
        arena.begin_step(128);
        assert_eq!(arena.used(), 0);
        assert_eq!(arena.peak(), 0);
        assert_eq!(arena.capacity(), 128);
    }

    #[test]
    fn test_overflowing_request_is_exhaustion() {
        let mut arena = StepArena::with_capacity(64);
        let err = arena.alloc_with(usize::MAX / 2, || 0.0_f64).unwrap_err();
        assert!(err.is_arena_exhausted());
    }
}

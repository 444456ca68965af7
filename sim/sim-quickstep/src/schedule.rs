//! Row scheduling across worker threads.
//!
//! The `m` constraint rows are split into contiguous chunks of
//! `⌈m / num_chunks⌉` rows, each widened by `num_overlap` rows on both sides.
//! Every chunk runs its own SOR iteration loop as one task; the caller hands
//! all tasks to a [`TaskPool`] and blocks until they finish.
//!
//! # Overlap
//!
//! Rows inside an overlap are relaxed by two neighbouring chunks. This is a
//! smoothing device, not a correctness requirement: each chunk still visits
//! every row of its core range.
//!
//! # Sequential Fallback
//!
//! Without a pool, or with a pool reporting zero workers, the same tasks run
//! one after another on the calling thread, in chunk order. A single chunk
//! therefore produces identical results with and without a pool.

use tracing::debug;

/// A contiguous range of row-order positions processed by one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowChunk {
    /// Chunk number, `0..chunk_count`.
    pub index: usize,
    /// First position processed, including overlap.
    pub start: usize,
    /// One past the last position processed, including overlap.
    pub end: usize,
    /// First position owned by this chunk alone.
    pub core_start: usize,
    /// One past the last owned position.
    pub core_end: usize,
}

impl RowChunk {
    /// Positions processed, including overlap.
    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the chunk processes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Rows per chunk before overlap is added.
#[must_use]
pub fn chunk_len(rows: usize, num_chunks: usize) -> usize {
    rows.div_ceil(num_chunks.max(1)).max(1)
}

/// Split `rows` positions into chunks.
///
/// Yields at most `num_chunks` chunks; fewer when rows run out first.
pub fn partition_rows(
    rows: usize,
    num_chunks: usize,
    overlap: usize,
) -> impl Iterator<Item = RowChunk> {
    let step = chunk_len(rows, num_chunks);
    (0..rows).step_by(step).enumerate().map(move |(index, core_start)| {
        let core_end = (core_start + step).min(rows);
        RowChunk {
            index,
            start: core_start.saturating_sub(overlap),
            end: (core_end + overlap).min(rows),
            core_start,
            core_end,
        }
    })
}

/// One unit of scheduled work.
pub type ChunkTask<'env> = Box<dyn FnOnce() + Send + 'env>;

/// Thread pool contract used by the row scheduler.
pub trait TaskPool: Send + Sync {
    /// Worker count. Zero makes the scheduler run tasks on the caller.
    fn size(&self) -> usize;

    /// Schedule every task and block until all have completed.
    fn execute<'env>(&self, tasks: Vec<ChunkTask<'env>>);
}

impl TaskPool for rayon::ThreadPool {
    fn size(&self) -> usize {
        self.current_num_threads()
    }

    fn execute<'env>(&self, tasks: Vec<ChunkTask<'env>>) {
        self.scope(|scope| {
            for task in tasks {
                scope.spawn(move |_| task());
            }
        });
    }
}

/// Runs tasks on rayon's global pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalPool;

impl TaskPool for GlobalPool {
    fn size(&self) -> usize {
        rayon::current_num_threads()
    }

    fn execute<'env>(&self, tasks: Vec<ChunkTask<'env>>) {
        rayon::scope(|scope| {
            for task in tasks {
                scope.spawn(move |_| task());
            }
        });
    }
}

/// Run `tasks` on `pool`, or sequentially when there is no usable pool.
pub fn dispatch<'env>(pool: Option<&dyn TaskPool>, tasks: Vec<ChunkTask<'env>>) {
    match pool {
        Some(pool) if pool.size() > 0 => pool.execute(tasks),
        _ => {
            debug!(tasks = tasks.len(), "running row chunks on the calling thread");
            for task in tasks {
                task();
            }
        }
    }
}

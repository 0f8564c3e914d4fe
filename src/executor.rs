//! Parallel mask fan-out.
//!
//! An [`Executor`] owns a rayon thread pool and fills one [`TokenBitmask`]
//! row per `(matcher, row)` pair concurrently. Pairs are independent by
//! construction — every validation below runs *before* any dispatch, so a
//! failed call has no partial effects:
//!
//! - every target row must be in bounds,
//! - no matcher may appear twice (two concurrent mutations of one matcher),
//! - no row may appear twice (two concurrent writers of one row),
//! - all matchers must agree with the buffer's row width.
//!
//! Rows are disjoint slices of one buffer, so the workers need no locking
//! between them; the call blocks until every row is written and the result
//! is bit-identical to filling the rows sequentially in list order.

use std::sync::{Mutex, MutexGuard};

use anyhow::{Result, bail};
use rayon::prelude::*;
use rustc_hash::FxHashSet;

use crate::bitmask::TokenBitmask;
use crate::matcher::{Matcher, validate_mask_ptr};

/// A mask-fill request: the matcher and its destination row.
pub type MaskRequest<'a> = (&'a Mutex<Matcher>, usize);

/// Shared executor for bulk mask computation. Owns a thread pool; borrows
/// matchers and the destination buffer only for the duration of one call.
pub struct Executor {
    pool: rayon::ThreadPool,
}

/// Base pointer of the mask buffer, moved into the worker closure.
/// Row disjointness is established by validation before dispatch.
#[derive(Clone, Copy)]
struct RowBase(*mut u32);
unsafe impl Send for RowBase {}
unsafe impl Sync for RowBase {}

fn lock(m: &Mutex<Matcher>) -> MutexGuard<'_, Matcher> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Executor {
    /// Create an executor. Defaults to 80% of available parallelism,
    /// clamped to `1..=32` threads.
    pub fn new(num_threads: Option<usize>) -> Result<Self> {
        let num_threads = num_threads.unwrap_or_else(|| {
            let n = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            (n * 80 / 100).clamp(1, 32)
        });
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()?;
        Ok(Executor { pool })
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Fill one buffer row per request, in parallel. Blocks until all rows
    /// are written; any validation failure aborts the whole call before any
    /// computation runs.
    pub fn fill_next_token_bitmask_par(
        &self,
        requests: &[MaskRequest<'_>],
        mask: &mut TokenBitmask,
    ) -> Result<()> {
        let words_per_row = mask.words_per_row();
        self.validate_requests(requests, mask.num_rows(), words_per_row)?;

        if let [(matcher, row)] = requests {
            let row = mask.row_mut(*row)?;
            lock(matcher).fill_mask_into(row);
            return Ok(());
        }

        let base = RowBase(mask.base_ptr());
        self.pool.install(|| {
            requests.par_iter().for_each(|&(matcher, row)| {
                // Capture the whole `RowBase` (Send + Sync), not the bare
                // `*mut u32` field that edition-2024 disjoint capture would
                // otherwise pick.
                let base = &base;
                // SAFETY: rows are validated in-bounds and pairwise distinct,
                // so each worker writes a disjoint region of the buffer.
                let dst = unsafe {
                    std::slice::from_raw_parts_mut(base.0.add(row * words_per_row), words_per_row)
                };
                lock(matcher).fill_mask_into(dst);
            });
        });
        Ok(())
    }

    /// Raw-pointer fan-out for externally managed memory: `base` points to
    /// `num_rows` rows of `one_mask_bytes` each.
    ///
    /// On top of the request validation this checks that `base` is non-null
    /// and `u32`-aligned and that `one_mask_bytes` is exactly one row; a
    /// buffer too small or too large both fail before any write.
    ///
    /// # Safety
    /// `base` must point to `num_rows * one_mask_bytes` bytes of writable
    /// memory not aliased by any live Rust reference during the call.
    pub unsafe fn unsafe_fill_next_token_bitmask_ptr(
        &self,
        requests: &[MaskRequest<'_>],
        base: *mut u32,
        one_mask_bytes: usize,
        num_rows: usize,
    ) -> Result<()> {
        if requests.is_empty() {
            bail!("No matchers");
        }
        let words_per_row = lock(requests[0].0).words_per_row();
        validate_mask_ptr(base, one_mask_bytes, words_per_row)?;
        self.validate_requests(requests, num_rows, words_per_row)?;

        if let [(matcher, row)] = requests {
            let mut guard = lock(matcher);
            // SAFETY: pointer, alignment, and row size validated above; the
            // row index is in bounds.
            return unsafe {
                guard.unsafe_compute_mask_ptr(base.add(row * words_per_row), one_mask_bytes)
            };
        }

        let base = RowBase(base);
        self.pool.install(|| {
            requests.par_iter().for_each(|&(matcher, row)| {
                // Capture the whole `RowBase` (Send + Sync), not the bare
                // `*mut u32` field that edition-2024 disjoint capture would
                // otherwise pick.
                let base = &base;
                // SAFETY: as above, plus pairwise-distinct rows.
                let dst = unsafe {
                    std::slice::from_raw_parts_mut(base.0.add(row * words_per_row), words_per_row)
                };
                lock(matcher).fill_mask_into(dst);
            });
        });
        Ok(())
    }

    /// Pre-dispatch validation shared by both entry points.
    fn validate_requests(
        &self,
        requests: &[MaskRequest<'_>],
        num_rows: usize,
        words_per_row: usize,
    ) -> Result<()> {
        if requests.is_empty() {
            bail!("No matchers");
        }
        let mut seen_matchers: FxHashSet<usize> = FxHashSet::default();
        let mut seen_rows: FxHashSet<usize> = FxHashSet::default();

        for &(matcher, row) in requests {
            if row >= num_rows {
                bail!(
                    "Target index out of bounds: row {} (buffer has {} rows)",
                    row,
                    num_rows
                );
            }
            // Identity pre-pass: the same matcher twice would mean two
            // concurrent mutable borrows.
            if !seen_matchers.insert(std::ptr::from_ref(matcher) as usize) {
                bail!("Already borrowed: matcher for row {} appears more than once", row);
            }
            if !seen_rows.insert(row) {
                bail!("duplicate target row {}", row);
            }
            if lock(matcher).words_per_row() != words_per_row {
                bail!(
                    "Invalid buffer size: {} words per row, matcher for row {} needs {}",
                    words_per_row,
                    row,
                    lock(matcher).words_per_row()
                );
            }
        }
        Ok(())
    }
}

//! Consistency checks applied by readers and folders.
//!
//! Two independent checks live here:
//!
//! - [`verify_fold_keys`] walks the sorted keys a fold visited against the
//!   contiguous key space `1..=expected_max` and reports the **first**
//!   divergence only, so that a grossly corrupted store produces one log
//!   line per fold rather than one per key.
//! - [`check_sequence`] compares an observed [`Record`] against the
//!   `min_seq` baseline the worker was started with.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::fmt;

use crate::record::Record;

/// Outcome of [`verify_fold_keys`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldCheck {
    /// Every key in `1..=expected_max` was visited exactly once.
    Complete,
    /// The first expected key that was never visited.
    Missing(u32),
    /// The first key visited more than once.
    Duplicate(u32),
    /// A key outside `1..=expected_max`.
    Unexpected(u32),
}

impl FoldCheck {
    pub fn is_complete(&self) -> bool {
        matches!(self, FoldCheck::Complete)
    }
}

impl fmt::Display for FoldCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FoldCheck::Complete => write!(f, "complete"),
            FoldCheck::Missing(k) => write!(f, "missing key {k}"),
            FoldCheck::Duplicate(k) => write!(f, "duplicate key {k}"),
            FoldCheck::Unexpected(k) => write!(f, "unexpected key {k}"),
        }
    }
}

/// Checks that `sorted` is exactly the sequence `1, 2, ..., expected_max`.
///
/// `sorted` must be in ascending order; duplicates are expected to be
/// adjacent. The walk stops at the first divergence: `[1, 2, 3, 6]` against
/// 5 is `Missing(4)`, not `Unexpected(6)`.
pub fn verify_fold_keys(sorted: &[u32], expected_max: u32) -> FoldCheck {
    // u64 so the cursor can step past u32::MAX without wrapping.
    let mut expected: u64 = 1;
    let mut prev: Option<u32> = None;

    for &key in sorted {
        if prev == Some(key) {
            return FoldCheck::Duplicate(key);
        }
        // A gap below `expected_max` is reported before the key that
        // jumped over it, even when that key is itself out of range.
        match u64::from(key).cmp(&expected) {
            Ordering::Equal if key <= expected_max => expected += 1,
            Ordering::Greater if expected <= u64::from(expected_max) => {
                return FoldCheck::Missing(expected as u32);
            }
            // Key 0, keys past `expected_max`, and unsorted input.
            _ => return FoldCheck::Unexpected(key),
        }
        prev = Some(key);
    }

    if expected <= u64::from(expected_max) {
        FoldCheck::Missing(expected as u32)
    } else {
        FoldCheck::Complete
    }
}

/// A read that observed a sequence number below the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleRead {
    pub key: u32,
    pub observed: u64,
    pub expected: u64,
}

impl fmt::Display for StaleRead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stale read for key {}: observed seq {}, expected >= {}",
            self.key, self.observed, self.expected
        )
    }
}

/// Returns `Err` when `observed.seq < min_seq`.
///
/// A sequence number *above* the baseline is fine: the writer races every
/// reader and may already be part-way through a newer pass.
pub fn check_sequence(min_seq: u64, observed: &Record) -> Result<(), StaleRead> {
    if observed.seq < min_seq {
        return Err(StaleRead {
            key: observed.key,
            observed: observed.seq,
            expected: min_seq,
        });
    }
    Ok(())
}

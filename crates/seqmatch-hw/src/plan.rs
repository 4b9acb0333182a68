//! Memory-budget chunk partitioning.
//!
//! A sweep compares every query against every target, but the score buffer
//! for the full cross product rarely fits in the DMA-capable region. The
//! planner sizes the largest query window whose score cells fit the
//! remaining budget and emits one chunk per window: full-width chunks
//! followed, when the query count does not divide evenly, by one remainder
//! chunk of exactly the leftover width.
//!
//! Everything here is integer arithmetic on counts and byte budgets; no
//! device, no allocation beyond the chunk list.

use std::time::Duration;

use crate::layout::CELL_BYTES;

/// Target count at or above which calibration is skipped and the sweep runs
/// exactly once.
pub const LARGE_PROBLEM_THRESHOLD: u32 = 100_000;

/// One accelerator invocation: a window of the (target, query) cross
/// product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// First target sequence of the window.
    pub target_offset: u32,
    /// Target sequences in the window.
    pub target_count: u32,
    /// First query sequence of the window.
    pub query_offset: u32,
    /// Query sequences in the window.
    pub query_count: u32,
}

/// The partition of one sweep into chunk invocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    /// Query width of a full chunk.
    pub chunk_queries: u32,
    /// Invocations in sweep order.
    pub chunks: Vec<ChunkDescriptor>,
    /// Chunk-to-sweep scaling factor for calibration:
    /// `ceil(query_count / chunk_queries)`.
    pub calibration_factor: u32,
    /// u32 cells the score buffer needs (`target_count × chunk_queries`).
    pub score_cells: usize,
}

/// Why a sweep cannot be planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanError {
    /// The score buffer for even a single query column does not fit.
    BudgetExceeded {
        /// Bytes the sweep needs at minimum (live allocations plus one
        /// query column of score cells).
        needed: u64,
        /// Configured budget in bytes.
        budget: u64,
    },
    /// Zero targets or zero queries.
    EmptyDimension {
        /// Requested target count.
        target_count: u32,
        /// Requested query count.
        query_count: u32,
    },
}

impl std::fmt::Display for PlanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BudgetExceeded { needed, budget } => {
                write!(f, "sweep needs {needed} bytes but budget is {budget}")
            }
            Self::EmptyDimension {
                target_count,
                query_count,
            } => write!(
                f,
                "nothing to align: {target_count} targets x {query_count} queries"
            ),
        }
    }
}

impl std::error::Error for PlanError {}

/// Partition a sweep of `target_count × query_count` pairs.
///
/// `allocated_bytes` is the registry's current live total; the score buffer
/// must fit in `budget_bytes − allocated_bytes` at four bytes per pair.
///
/// # Errors
///
/// [`PlanError::BudgetExceeded`] when one query column of score cells does
/// not fit the remaining budget, [`PlanError::EmptyDimension`] when either
/// count is zero. No other outcome: a successful plan always has at least
/// one chunk of at least one query.
pub fn plan_chunks(
    target_count: u32,
    query_count: u32,
    budget_bytes: u64,
    allocated_bytes: u64,
) -> Result<ChunkPlan, PlanError> {
    if target_count == 0 || query_count == 0 {
        return Err(PlanError::EmptyDimension {
            target_count,
            query_count,
        });
    }

    let needed = allocated_bytes + u64::from(target_count) * CELL_BYTES as u64;
    if needed > budget_bytes {
        return Err(PlanError::BudgetExceeded {
            needed,
            budget: budget_bytes,
        });
    }

    let available = budget_bytes - allocated_bytes;
    let max_pairs = available / CELL_BYTES as u64;
    // needed <= budget guarantees max_pairs >= target_count, so >= 1 here.
    #[allow(clippy::cast_possible_truncation)]
    let chunk_queries = (max_pairs / u64::from(target_count)).min(u64::from(query_count)) as u32;

    let full = query_count / chunk_queries;
    let remainder = query_count % chunk_queries;

    let mut chunks = Vec::with_capacity(full as usize + usize::from(remainder > 0));
    for i in 0..full {
        chunks.push(ChunkDescriptor {
            target_offset: 0,
            target_count,
            query_offset: i * chunk_queries,
            query_count: chunk_queries,
        });
    }
    if remainder > 0 {
        chunks.push(ChunkDescriptor {
            target_offset: 0,
            target_count,
            query_offset: query_count - remainder,
            query_count: remainder,
        });
    }

    Ok(ChunkPlan {
        chunk_queries,
        chunks,
        calibration_factor: query_count.div_ceil(chunk_queries),
        score_cells: target_count as usize * chunk_queries as usize,
    })
}

/// Repetition count that stretches a sweep to at least `min_exec_time`.
///
/// `chunk_duration` is one measured chunk; the sweep estimate is
/// `chunk_duration × calibration_factor`. Always at least 1. A zero
/// estimate (chunk below timer resolution) also yields 1 — repeating an
/// unmeasurable sweep adds no information.
#[must_use]
pub fn repetitions(
    chunk_duration: Duration,
    calibration_factor: u32,
    min_exec_time: Duration,
) -> u32 {
    let estimate = chunk_duration.saturating_mul(calibration_factor);
    if estimate.is_zero() {
        return 1;
    }
    let reps = min_exec_time.as_nanos().div_ceil(estimate.as_nanos());
    u32::try_from(reps).unwrap_or(u32::MAX).max(1)
}

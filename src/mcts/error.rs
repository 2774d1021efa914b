//! Recoverable, construction-time configuration errors for the Batched
//! Scheduler. Every other invariant violation in this crate (allocator
//! exhaustion, non-finite policy logits, calling `update` out of turn, a
//! sim-budget overrun while `autoplay` is set) is a `panic!` naming the
//! violated invariant — see DESIGN.md's "Error taxonomy" entry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("batch_size must be at least 1")]
    EmptyBatch,

    #[error("num_sectors must be at least 1")]
    EmptySectors,

    #[error("sims_per_move must be at least 1")]
    EmptySimBudget,

    #[error("num_threads must be at least 1")]
    EmptyThreadCount,
}

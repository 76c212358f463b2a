//! Instant timeline.
//!
//! The timeline is the single source of truth for what happened to a table.
//! Every action (commit, delta commit, clean, compaction, rollback,
//! savepoint, restore) is an *instant* identified by `(timestamp, action)`
//! and moves through three states, each represented by exactly one file in
//! the metadata directory:
//!
//! ```text
//! <table_root>/
//!   .lakeline/
//!     20240101093000123.commit.requested   # intent (optional plan payload)
//!     20240101093000123.commit.inflight    # in progress (workload payload)
//!     20240101093000123.commit             # completed (commit metadata)
//! ```
//!
//! A transition creates the new state file with create-if-absent semantics
//! and only then deletes the old one. Readers only trust COMPLETED instants;
//! pending instants are either resumed or rolled back.
//!
//! - [`Instant`], [`InstantTime`], [`ActionType`], [`InstantState`]: identity
//!   and state of a single instant.
//! - [`Timeline`]: an immutable, filterable snapshot.
//! - [`ActiveTimeline`]: the persistent timeline of a table, with the
//!   transition operations.

use snafu::{Backtrace, prelude::*};

use crate::storage::StorageError;

mod active;
mod instant;
mod view;

pub use active::ActiveTimeline;
pub use instant::{ActionType, Instant, InstantState, InstantTime};
pub use view::Timeline;

/// Errors raised while reading or transitioning the timeline.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TimelineError {
    /// Storage failure while touching instant files.
    #[snafu(display("Timeline storage error: {source}"))]
    Storage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// A state file for this identity already exists.
    #[snafu(display("Instant already exists: {instant}"))]
    InstantAlreadyExists {
        /// The instant that could not be created.
        instant: String,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },

    /// The state file the operation expected is missing.
    #[snafu(display("Instant not found: {instant}"))]
    InstantNotFound {
        /// The instant that was looked up.
        instant: String,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },

    /// The requested state change is not allowed from the instant's state.
    #[snafu(display("Cannot transition {instant} to {target}"))]
    InvalidTransition {
        /// The instant being transitioned.
        instant: String,
        /// The state it was asked to move to.
        target: InstantState,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },
}

/// Result alias for timeline operations.
pub type TimelineResult<T> = Result<T, TimelineError>;

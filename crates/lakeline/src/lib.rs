//! # lakeline
//!
//! Transactional timeline and action protocol for a versioned table format.
//!
//! This crate is the supported public entry point and provides a small,
//! stable surface over `lakeline-core`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use lakeline::prelude::*;
//!
//! let table = Table::create(
//!     TableLocation::local("/tmp/trips"),
//!     TableConfig::new("trips", TableType::MergeOnRead),
//!     WriteConfig::default(),
//!     LocalEngine::new(),
//!     Arc::new(InMemoryIndex::new()),
//! )
//! .await?;
//! let mut client = WriteClient::new(table);
//! let ts = client.start_commit().await?;
//! client.upsert(&ts, records).await?;
//! ```

/// Convenience prelude with the stable, supported surface.
pub mod prelude;

/// Metadata payloads recorded on the timeline.
pub mod metadata {
    pub use lakeline_core::metadata::{
        CleanMetadata, CleanStat, CleanerPlan, CleaningPolicy, CommitMetadata,
        CompactionOperation, CompactionPlan, RestoreMetadata, RollbackMetadata, RollbackStat,
        SavepointMetadata, WriteOperationType, WriteStat,
    };
}

pub use lakeline_core::action::{ActionError, ActionResult};
pub use lakeline_core::client::WriteClient;
pub use lakeline_core::config::{
    CleanerConfig, CompactionConfig, ConsistencyGuardConfig, ConsistencyPolicy, RollbackConfig,
    TableConfig, TableType, WriteConcurrencyMode, WriteConfig,
};
pub use lakeline_core::engine::{LocalEngine, WriteEngine};
pub use lakeline_core::fs_view::BootstrapIndex;
pub use lakeline_core::index::{InMemoryIndex, RecordIndex};
pub use lakeline_core::model::{Record, RecordKey, RecordLocation, WriteStatus};
pub use lakeline_core::storage::TableLocation;
pub use lakeline_core::table::{Table, TableError};
pub use lakeline_core::timeline::{ActionType, Instant, InstantState, InstantTime, Timeline};

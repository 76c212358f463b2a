//! Wrapper prelude.
//!
//! The `lakeline` crate is the supported public entry point. Downstream code
//! should prefer importing from this prelude instead of depending on internal
//! core module paths.

pub use crate::metadata;
pub use crate::{
    ActionError, InMemoryIndex, InstantTime, LocalEngine, Record, RecordKey, Table, TableConfig,
    TableError, TableLocation, TableType, WriteClient, WriteConfig,
};
pub use std::sync::Arc;

//! Transactional timeline and action protocol for the lakeline table format.
//!
//! Every change to a table is an *instant* on its timeline, recorded as state
//! files under `.lakeline/` that move REQUESTED → INFLIGHT → COMPLETED. This
//! crate provides:
//!
//! - the instant model and active timeline with crash-safe transitions
//!   (`timeline` module);
//! - the action executors driving commits, rollbacks, cleans, compactions,
//!   savepoints and restores (`action` module);
//! - a consistency guard for stores whose listings lag writes
//!   (`consistency` module);
//! - the file system view that turns data file names into file groups and
//!   slices (`fs_view` module);
//! - collaborator traits for execution engines and record indexes, with
//!   local implementations (`engine`, `index` modules);
//! - the [`WriteClient`](client::WriteClient) tying it together.
//!
//! Storage access goes through the `storage` module, which resolves
//! table-relative paths against a [`TableLocation`](storage::TableLocation).
#![deny(missing_docs)]
pub mod action;
pub mod client;
pub mod config;
pub mod consistency;
pub mod engine;
pub mod fs_view;
pub mod index;
pub mod log_format;
pub mod markers;
pub mod metadata;
pub mod model;
pub mod schema;
pub mod storage;
pub mod table;
pub mod timeline;

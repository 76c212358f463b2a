//! On-disk layout helpers for a table root.
//!
//! This module centralizes all *relative* path conventions under a table root:
//! - the metadata directory holding instant files and the table config
//!   (`.lakeline/`)
//! - the marker directory of an in-progress write (`.lakeline/.temp/<instant>/`)
//! - partition directories holding base and log files
//!
//! The functions here return relative [`std::path::PathBuf`] values. Callers are
//! expected to join these with a table root (a [`crate::storage::TableLocation`])
//! before doing IO.

use std::path::PathBuf;

// ====================
// Metadata layout
// ====================

/// Name of the hidden metadata directory under the table root.
pub const METADATA_DIR_NAME: &str = ".lakeline";

/// Name of the auxiliary directory under the metadata directory that holds
/// per-instant marker trees.
pub const TEMP_DIR_NAME: &str = ".temp";

/// File name of the persisted table configuration.
pub const TABLE_CONFIG_FILE_NAME: &str = "table.json";

/// File name of the index mapping bootstrapped base files to their sources.
pub const BOOTSTRAP_INDEX_FILE_NAME: &str = "bootstrap_index.json";

/// Relative path: `.lakeline/`
pub fn metadata_rel_dir() -> PathBuf {
    PathBuf::from(METADATA_DIR_NAME)
}

/// Relative path: `.lakeline/table.json`
pub fn table_config_rel_path() -> PathBuf {
    metadata_rel_dir().join(TABLE_CONFIG_FILE_NAME)
}

/// Relative path: `.lakeline/bootstrap_index.json`
pub fn bootstrap_index_rel_path() -> PathBuf {
    metadata_rel_dir().join(BOOTSTRAP_INDEX_FILE_NAME)
}

/// Relative path: `.lakeline/<file_name>` for an instant state file.
pub fn instant_rel_path(file_name: &str) -> PathBuf {
    metadata_rel_dir().join(file_name)
}

/// Relative path: `.lakeline/.temp/`
pub fn temp_rel_dir() -> PathBuf {
    metadata_rel_dir().join(TEMP_DIR_NAME)
}

/// Relative path: `.lakeline/.temp/<instant_time>/`
pub fn marker_rel_dir(instant_time: &str) -> PathBuf {
    temp_rel_dir().join(instant_time)
}

// ====================
// Data layout
// ====================

/// Relative path of a partition directory. The empty partition path denotes
/// the table root (non-partitioned tables).
pub fn partition_rel_dir(partition_path: &str) -> PathBuf {
    if partition_path.is_empty() {
        PathBuf::new()
    } else {
        PathBuf::from(partition_path)
    }
}

/// Relative path: `<partition>/<file_name>`
pub fn data_file_rel_path(partition_path: &str, file_name: &str) -> PathBuf {
    partition_rel_dir(partition_path).join(file_name)
}

/// Returns true for directory or file names that never hold table data
/// (hidden metadata, temp files).
pub fn is_reserved_name(name: &str) -> bool {
    name == METADATA_DIR_NAME || name.ends_with(".tmp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_dir_lives_under_metadata_temp() {
        assert_eq!(
            marker_rel_dir("20240101000000000"),
            PathBuf::from(".lakeline/.temp/20240101000000000")
        );
    }

    #[test]
    fn empty_partition_maps_to_table_root() {
        assert_eq!(data_file_rel_path("", "f.jsonl"), PathBuf::from("f.jsonl"));
        assert_eq!(
            data_file_rel_path("2024/01/01", "f.jsonl"),
            PathBuf::from("2024/01/01/f.jsonl")
        );
    }
}

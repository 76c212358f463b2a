//! Data file naming.
//!
//! - Base file: `{file_id}_{write_token}_{instant}{ext}`
//! - Log file: `.{file_id}_{base_instant}.log.{version}_{write_token}`
//!
//! File ids are simple (hyphen-less) UUIDs and write tokens are
//! `{task}-{attempt}`, so neither contains an underscore.

use crate::timeline::InstantTime;

const LOG_INFIX: &str = ".log.";

/// Components of a base file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBaseFileName {
    /// File group id.
    pub file_id: String,
    /// Token of the task attempt that wrote the file.
    pub write_token: String,
    /// Instant that wrote the file.
    pub instant_time: InstantTime,
}

/// Components of a log file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLogFileName {
    /// File group id.
    pub file_id: String,
    /// Base instant of the file slice the log belongs to.
    pub base_instant_time: InstantTime,
    /// Log version within the slice, starting at 1.
    pub version: u32,
    /// Token of the task attempt that created the file.
    pub write_token: String,
}

/// A fresh file group id.
pub fn new_file_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Write token of attempt `attempt` of task `task`.
pub fn write_token(task: usize, attempt: u32) -> String {
    format!("{task}-{attempt}")
}

/// Base file name for a file group written by `instant_time`.
pub fn base_file_name(
    file_id: &str,
    write_token: &str,
    instant_time: &InstantTime,
    extension: &str,
) -> String {
    format!("{file_id}_{write_token}_{instant_time}{extension}")
}

/// Log file name for version `version` of the slice based at `base_instant_time`.
pub fn log_file_name(
    file_id: &str,
    base_instant_time: &InstantTime,
    version: u32,
    write_token: &str,
) -> String {
    format!(".{file_id}_{base_instant_time}{LOG_INFIX}{version}_{write_token}")
}

/// Parse a base file name. Hidden files, temp files and names that do not
/// have three `_`-separated components are rejected.
pub fn parse_base_file_name(name: &str) -> Option<ParsedBaseFileName> {
    if name.starts_with('.') || name.ends_with(".tmp") {
        return None;
    }
    let stem = match name.find('.') {
        Some(idx) => &name[..idx],
        None => name,
    };
    let mut parts = stem.split('_');
    let file_id = parts.next().filter(|s| !s.is_empty())?;
    let write_token = parts.next().filter(|s| !s.is_empty())?;
    let instant = parts.next().filter(|s| is_instant_like(s))?;
    if parts.next().is_some() {
        return None;
    }
    Some(ParsedBaseFileName {
        file_id: file_id.to_string(),
        write_token: write_token.to_string(),
        instant_time: InstantTime::new(instant),
    })
}

/// Parse a log file name.
pub fn parse_log_file_name(name: &str) -> Option<ParsedLogFileName> {
    let rest = name.strip_prefix('.')?;
    let (head, tail) = rest.split_once(LOG_INFIX)?;
    let (file_id, base_instant) = head.split_once('_')?;
    let (version, write_token) = tail.split_once('_')?;
    if file_id.is_empty() || !is_instant_like(base_instant) || write_token.is_empty() {
        return None;
    }
    Some(ParsedLogFileName {
        file_id: file_id.to_string(),
        base_instant_time: InstantTime::new(base_instant),
        version: version.parse().ok()?,
        write_token: write_token.to_string(),
    })
}

fn is_instant_like(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_file_names_parse_back() {
        let ts = InstantTime::new("20240101000000000");
        let name = base_file_name("abc123", &write_token(3, 0), &ts, ".jsonl");
        assert_eq!(name, "abc123_3-0_20240101000000000.jsonl");

        let parsed = parse_base_file_name(&name).expect("base file");
        assert_eq!(parsed.file_id, "abc123");
        assert_eq!(parsed.write_token, "3-0");
        assert_eq!(parsed.instant_time, ts);
    }

    #[test]
    fn log_file_names_parse_back() {
        let ts = InstantTime::new("20240101000000000");
        let name = log_file_name("abc123", &ts, 2, "0-1");
        assert_eq!(name, ".abc123_20240101000000000.log.2_0-1");

        let parsed = parse_log_file_name(&name).expect("log file");
        assert_eq!(parsed.file_id, "abc123");
        assert_eq!(parsed.base_instant_time, ts);
        assert_eq!(parsed.version, 2);
        assert_eq!(parsed.write_token, "0-1");
        assert!(parse_base_file_name(&name).is_none());
    }

    #[test]
    fn foreign_files_are_ignored() {
        assert!(parse_base_file_name("README.md").is_none());
        assert!(parse_base_file_name("a_b_notatime.jsonl").is_none());
        assert!(parse_base_file_name(".a_b_001.jsonl.1234.tmp").is_none());
        assert!(parse_log_file_name(".hidden").is_none());
    }
}

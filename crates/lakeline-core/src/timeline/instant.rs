//! Instant identity, action kinds and lifecycle states.

use std::{borrow::Borrow, fmt};

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Timestamp identifying an instant on the timeline.
///
/// Instant times are fixed-width digit strings (`yyyyMMddHHmmssSSS`), so the
/// derived lexical ordering is also chronological. The default is the empty
/// timestamp, which sorts before every real instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstantTime(String);

impl InstantTime {
    /// `chrono` format string used for freshly generated instant times.
    pub const FORMAT: &'static str = "%Y%m%d%H%M%S%3f";

    /// Wraps an existing timestamp string.
    pub fn new(ts: impl Into<String>) -> Self {
        InstantTime(ts.into())
    }

    /// Instant time for the current wall clock.
    pub fn now() -> Self {
        InstantTime(Utc::now().format(Self::FORMAT).to_string())
    }

    /// The smallest instant time strictly greater than `self`, keeping the
    /// same width. Returns `None` for non-numeric timestamps.
    pub fn successor(&self) -> Option<Self> {
        if self.0.is_empty() || !self.0.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let next = self.0.parse::<u64>().ok()?.checked_add(1)?;
        let formatted = format!("{next:0width$}", width = self.0.len());
        (formatted.len() == self.0.len()).then_some(InstantTime(formatted))
    }

    /// Borrow the timestamp string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstantTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstantTime {
    fn from(s: &str) -> Self {
        InstantTime(s.to_string())
    }
}

impl From<String> for InstantTime {
    fn from(s: String) -> Self {
        InstantTime(s)
    }
}

impl From<&InstantTime> for InstantTime {
    fn from(t: &InstantTime) -> Self {
        t.clone()
    }
}

impl AsRef<str> for InstantTime {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for InstantTime {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Kind of action an instant records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Copy-on-write data commit.
    Commit,
    /// Merge-on-read data commit (writes log files).
    DeltaCommit,
    /// Removal of obsolete file slices.
    Clean,
    /// Merge of base and log files into a new base file (merge-on-read only).
    Compaction,
    /// Undo of a failed or unwanted commit.
    Rollback,
    /// Pin of a completed commit against cleaning.
    Savepoint,
    /// Roll back of every commit after a given instant.
    Restore,
}

impl ActionType {
    /// All action kinds in file-name order.
    pub const ALL: [ActionType; 7] = [
        ActionType::Commit,
        ActionType::DeltaCommit,
        ActionType::Clean,
        ActionType::Compaction,
        ActionType::Rollback,
        ActionType::Savepoint,
        ActionType::Restore,
    ];

    /// Actions that write data files and form the commits timeline.
    pub const COMMIT_ACTIONS: [ActionType; 3] = [
        ActionType::Commit,
        ActionType::DeltaCommit,
        ActionType::Compaction,
    ];

    /// Name used in instant file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Commit => "commit",
            ActionType::DeltaCommit => "deltacommit",
            ActionType::Clean => "clean",
            ActionType::Compaction => "compaction",
            ActionType::Rollback => "rollback",
            ActionType::Savepoint => "savepoint",
            ActionType::Restore => "restore",
        }
    }

    /// Inverse of [`ActionType::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == s)
    }

    /// True for actions that belong to the commits timeline.
    pub fn is_commit_action(&self) -> bool {
        Self::COMMIT_ACTIONS.contains(self)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an instant. States only move forward, except for the
/// explicit reverts used by rollback and compaction retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InstantState {
    /// Intent recorded; the payload (if any) is the plan.
    Requested,
    /// Work in progress; the payload (if any) describes the workload.
    Inflight,
    /// Durable and visible to readers.
    Completed,
}

impl InstantState {
    const REQUESTED_SUFFIX: &'static str = ".requested";
    const INFLIGHT_SUFFIX: &'static str = ".inflight";

    /// File-name suffix for this state (empty for completed instants).
    pub fn suffix(&self) -> &'static str {
        match self {
            InstantState::Requested => Self::REQUESTED_SUFFIX,
            InstantState::Inflight => Self::INFLIGHT_SUFFIX,
            InstantState::Completed => "",
        }
    }
}

impl fmt::Display for InstantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstantState::Requested => "REQUESTED",
            InstantState::Inflight => "INFLIGHT",
            InstantState::Completed => "COMPLETED",
        };
        f.write_str(s)
    }
}

/// A point on the timeline: `(timestamp, action)` identity plus its state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instant {
    /// Instant time.
    pub timestamp: InstantTime,
    /// Action recorded by this instant.
    pub action: ActionType,
    /// Current lifecycle state.
    pub state: InstantState,
}

impl Instant {
    /// Build an instant in an arbitrary state.
    pub fn new(timestamp: impl Into<InstantTime>, action: ActionType, state: InstantState) -> Self {
        Instant {
            timestamp: timestamp.into(),
            action,
            state,
        }
    }

    /// A REQUESTED instant.
    pub fn requested(timestamp: impl Into<InstantTime>, action: ActionType) -> Self {
        Self::new(timestamp, action, InstantState::Requested)
    }

    /// An INFLIGHT instant.
    pub fn inflight(timestamp: impl Into<InstantTime>, action: ActionType) -> Self {
        Self::new(timestamp, action, InstantState::Inflight)
    }

    /// A COMPLETED instant.
    pub fn completed(timestamp: impl Into<InstantTime>, action: ActionType) -> Self {
        Self::new(timestamp, action, InstantState::Completed)
    }

    /// Same identity, different state.
    pub fn with_state(&self, state: InstantState) -> Self {
        Instant {
            timestamp: self.timestamp.clone(),
            action: self.action,
            state,
        }
    }

    /// True once the instant is durable and visible.
    pub fn is_completed(&self) -> bool {
        self.state == InstantState::Completed
    }

    /// True for REQUESTED and INFLIGHT instants.
    pub fn is_pending(&self) -> bool {
        !self.is_completed()
    }

    /// True if both instants share `(timestamp, action)`.
    pub fn same_identity(&self, other: &Instant) -> bool {
        self.timestamp == other.timestamp && self.action == other.action
    }

    /// File name of the state file: `<ts>.<action>[.requested|.inflight]`.
    pub fn file_name(&self) -> String {
        format!(
            "{}.{}{}",
            self.timestamp,
            self.action.as_str(),
            self.state.suffix()
        )
    }

    /// Parse an instant state file name. Returns `None` for anything that is
    /// not an instant file (temp files, the table config, ...).
    pub fn parse_file_name(name: &str) -> Option<Self> {
        let (ts, rest) = name.split_once('.')?;
        if ts.is_empty() || !ts.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return None;
        }

        let (action, state) = if let Some(a) = rest.strip_suffix(InstantState::REQUESTED_SUFFIX) {
            (a, InstantState::Requested)
        } else if let Some(a) = rest.strip_suffix(InstantState::INFLIGHT_SUFFIX) {
            (a, InstantState::Inflight)
        } else {
            (rest, InstantState::Completed)
        };

        let action = ActionType::parse(action)?;
        Some(Instant::new(ts, action, state))
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}__{}__{}]", self.timestamp, self.action, self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_encode_state_suffix() {
        let requested = Instant::requested("20240101000000001", ActionType::Clean);
        assert_eq!(requested.file_name(), "20240101000000001.clean.requested");
        assert_eq!(
            requested.with_state(InstantState::Inflight).file_name(),
            "20240101000000001.clean.inflight"
        );
        assert_eq!(
            requested.with_state(InstantState::Completed).file_name(),
            "20240101000000001.clean"
        );
    }

    #[test]
    fn parse_file_name_inverts_file_name() {
        for action in ActionType::ALL {
            for state in [
                InstantState::Requested,
                InstantState::Inflight,
                InstantState::Completed,
            ] {
                let instant = Instant::new("001", action, state);
                assert_eq!(Instant::parse_file_name(&instant.file_name()), Some(instant));
            }
        }
    }

    #[test]
    fn parse_file_name_rejects_foreign_files() {
        assert_eq!(Instant::parse_file_name("table.json"), None);
        assert_eq!(Instant::parse_file_name(".001.commit.abc.tmp"), None);
        assert_eq!(Instant::parse_file_name("001.unknown"), None);
        assert_eq!(Instant::parse_file_name("001"), None);
    }

    #[test]
    fn successor_keeps_width() {
        let t = InstantTime::new("20240101000000999");
        assert_eq!(t.successor(), Some(InstantTime::new("20240101000001000")));
        assert_eq!(InstantTime::new("009").successor(), Some(InstantTime::new("010")));
        assert_eq!(InstantTime::new("999").successor(), None);
        assert_eq!(InstantTime::new("c1").successor(), None);
    }

    #[test]
    fn default_instant_time_sorts_before_real_instants() {
        let empty = InstantTime::default();
        assert_eq!(empty.as_str(), "");
        assert!(empty < InstantTime::new("000"));
        assert_eq!(empty.successor(), None);
    }

    #[test]
    fn generated_instant_times_are_fixed_width() {
        assert_eq!(InstantTime::now().as_str().len(), 17);
    }

    #[test]
    fn states_order_forward() {
        assert!(InstantState::Requested < InstantState::Inflight);
        assert!(InstantState::Inflight < InstantState::Completed);
    }
}

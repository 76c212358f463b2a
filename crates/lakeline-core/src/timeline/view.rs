//! Immutable, filterable timeline snapshots.

use crate::timeline::{ActionType, Instant, InstantState, InstantTime};

/// An ordered snapshot of instants.
///
/// Instants are sorted by `(timestamp, action)`. Every projection returns a
/// new `Timeline`; iteration through [`Timeline::instants`] is lazy and can be
/// restarted any number of times.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timeline {
    instants: Vec<Instant>,
}

impl Timeline {
    /// Build a timeline from instants in any order.
    pub fn new(mut instants: Vec<Instant>) -> Self {
        instants.sort_by(|a, b| (&a.timestamp, a.action).cmp(&(&b.timestamp, b.action)));
        Timeline { instants }
    }

    /// Iterate the instants in timeline order.
    pub fn instants(&self) -> std::slice::Iter<'_, Instant> {
        self.instants.iter()
    }

    /// Timestamps of all instants, in order.
    pub fn timestamps(&self) -> Vec<InstantTime> {
        self.instants.iter().map(|i| i.timestamp.clone()).collect()
    }

    /// Keep the instants matching `pred`.
    pub fn filter(&self, pred: impl Fn(&Instant) -> bool) -> Timeline {
        Timeline {
            instants: self.instants.iter().filter(|i| pred(i)).cloned().collect(),
        }
    }

    /// Completed instants only.
    pub fn filter_completed(&self) -> Timeline {
        self.filter(Instant::is_completed)
    }

    /// REQUESTED and INFLIGHT instants.
    pub fn filter_pending(&self) -> Timeline {
        self.filter(Instant::is_pending)
    }

    /// Instants in exactly `state`.
    pub fn filter_state(&self, state: InstantState) -> Timeline {
        self.filter(|i| i.state == state)
    }

    /// Instants whose action is one of `actions`.
    pub fn filter_by_actions(&self, actions: &[ActionType]) -> Timeline {
        self.filter(|i| actions.contains(&i.action))
    }

    /// Commit, delta-commit and compaction instants (all states).
    pub fn commits_timeline(&self) -> Timeline {
        self.filter_by_actions(&ActionType::COMMIT_ACTIONS)
    }

    /// Completed commit-family instants.
    pub fn completed_commits_timeline(&self) -> Timeline {
        self.commits_timeline().filter_completed()
    }

    /// Pending commit and delta-commit instants, excluding compactions.
    pub fn pending_writes_timeline(&self) -> Timeline {
        self.filter(|i| {
            i.is_pending() && matches!(i.action, ActionType::Commit | ActionType::DeltaCommit)
        })
    }

    /// Pending compaction instants.
    pub fn pending_compaction_timeline(&self) -> Timeline {
        self.filter(|i| i.is_pending() && i.action == ActionType::Compaction)
    }

    /// Clean instants (all states).
    pub fn clean_timeline(&self) -> Timeline {
        self.filter_by_actions(&[ActionType::Clean])
    }

    /// Completed savepoints.
    pub fn savepoint_timeline(&self) -> Timeline {
        self.filter_by_actions(&[ActionType::Savepoint])
            .filter_completed()
    }

    /// Rollback instants (all states).
    pub fn rollback_timeline(&self) -> Timeline {
        self.filter_by_actions(&[ActionType::Rollback])
    }

    /// Restore instants (all states).
    pub fn restore_timeline(&self) -> Timeline {
        self.filter_by_actions(&[ActionType::Restore])
    }

    /// Instants strictly after `ts`.
    pub fn find_instants_after(&self, ts: &InstantTime) -> Timeline {
        self.filter(|i| i.timestamp > *ts)
    }

    /// Instants strictly before `ts`.
    pub fn find_instants_before(&self, ts: &InstantTime) -> Timeline {
        self.filter(|i| i.timestamp < *ts)
    }

    /// Instants in `(start, end]`.
    pub fn find_instants_in_range(&self, start: &InstantTime, end: &InstantTime) -> Timeline {
        self.filter(|i| i.timestamp > *start && i.timestamp <= *end)
    }

    /// First instant, if any.
    pub fn first_instant(&self) -> Option<&Instant> {
        self.instants.first()
    }

    /// Last instant, if any.
    pub fn last_instant(&self) -> Option<&Instant> {
        self.instants.last()
    }

    /// Instant at position `n` (0-based).
    pub fn nth_instant(&self, n: usize) -> Option<&Instant> {
        self.instants.get(n)
    }

    /// Number of instants.
    pub fn count_instants(&self) -> usize {
        self.instants.len()
    }

    /// True when there are no instants.
    pub fn is_empty(&self) -> bool {
        self.instants.is_empty()
    }

    /// The instant with this identity, in whatever state it currently is.
    pub fn get(&self, ts: &InstantTime, action: ActionType) -> Option<&Instant> {
        self.instants
            .iter()
            .find(|i| i.timestamp == *ts && i.action == action)
    }

    /// True if an instant with the identity of `instant` exists.
    pub fn contains_instant(&self, instant: &Instant) -> bool {
        self.get(&instant.timestamp, instant.action).is_some()
    }

    /// True if any instant carries timestamp `ts`.
    pub fn contains_timestamp(&self, ts: &InstantTime) -> bool {
        self.instants.iter().any(|i| i.timestamp == *ts)
    }

    /// True if an instant at `ts` exists and is completed.
    pub fn is_completed(&self, ts: &InstantTime) -> bool {
        self.instants
            .iter()
            .any(|i| i.timestamp == *ts && i.is_completed())
    }

    /// True if an instant at `ts` exists and is pending.
    pub fn is_pending(&self, ts: &InstantTime) -> bool {
        self.instants
            .iter()
            .any(|i| i.timestamp == *ts && i.is_pending())
    }

    /// Insert or replace the instant with the same identity.
    pub(crate) fn upsert(&mut self, instant: Instant) {
        match self
            .instants
            .iter_mut()
            .find(|i| i.same_identity(&instant))
        {
            Some(existing) => *existing = instant,
            None => {
                self.instants.push(instant);
                self.instants
                    .sort_by(|a, b| (&a.timestamp, a.action).cmp(&(&b.timestamp, b.action)));
            }
        }
    }

    /// Drop the instant with the identity of `instant`.
    pub(crate) fn remove(&mut self, instant: &Instant) {
        self.instants.retain(|i| !i.same_identity(instant));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Timeline {
        Timeline::new(vec![
            Instant::completed("003", ActionType::Commit),
            Instant::completed("001", ActionType::Commit),
            Instant::completed("002", ActionType::Clean),
            Instant::inflight("004", ActionType::DeltaCommit),
            Instant::requested("005", ActionType::Compaction),
            Instant::completed("003", ActionType::Savepoint),
        ])
    }

    #[test]
    fn instants_are_ordered_and_restartable() {
        let timeline = sample();
        let first: Vec<_> = timeline.instants().map(|i| i.file_name()).collect();
        let second: Vec<_> = timeline.instants().map(|i| i.file_name()).collect();
        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![
                "001.commit",
                "002.clean",
                "003.commit",
                "003.savepoint",
                "004.deltacommit.inflight",
                "005.compaction.requested",
            ]
        );
    }

    #[test]
    fn projections_select_expected_instants() {
        let timeline = sample();
        assert_eq!(timeline.commits_timeline().count_instants(), 4);
        assert_eq!(timeline.completed_commits_timeline().count_instants(), 2);
        assert_eq!(timeline.pending_writes_timeline().count_instants(), 1);
        assert_eq!(timeline.pending_compaction_timeline().count_instants(), 1);
        assert_eq!(timeline.savepoint_timeline().count_instants(), 1);
        assert_eq!(
            timeline
                .find_instants_after(&InstantTime::new("003"))
                .timestamps(),
            vec![InstantTime::new("004"), InstantTime::new("005")]
        );
        assert_eq!(
            timeline
                .find_instants_in_range(&InstantTime::new("001"), &InstantTime::new("003"))
                .count_instants(),
            3
        );
    }

    #[test]
    fn state_queries_by_timestamp() {
        let timeline = sample();
        assert!(timeline.is_completed(&InstantTime::new("001")));
        assert!(timeline.is_pending(&InstantTime::new("004")));
        assert!(!timeline.contains_timestamp(&InstantTime::new("006")));
        assert_eq!(
            timeline.last_instant().map(|i| i.action),
            Some(ActionType::Compaction)
        );
    }

    #[test]
    fn upsert_replaces_same_identity() {
        let mut timeline = sample();
        timeline.upsert(Instant::completed("004", ActionType::DeltaCommit));
        assert_eq!(timeline.count_instants(), 6);
        assert!(timeline.is_completed(&InstantTime::new("004")));

        timeline.remove(&Instant::requested("005", ActionType::Compaction));
        assert_eq!(timeline.count_instants(), 5);
    }
}

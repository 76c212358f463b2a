//! The active timeline: instant state files under `.lakeline/`.

use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::BTreeMap;

use crate::storage::{self, TableLocation, layout};
use crate::timeline::{
    ActionType, Instant, InstantAlreadyExistsSnafu, InstantNotFoundSnafu, InstantState,
    InstantTime, InvalidTransitionSnafu, StorageSnafu, Timeline, TimelineResult,
};

use snafu::ResultExt;

/// The persistent timeline of a table plus an in-memory snapshot of it.
///
/// The snapshot is taken when the timeline is loaded and is refreshed by
/// [`ActiveTimeline::reload`]. Transitions performed through this handle
/// update the snapshot in place.
#[derive(Debug, Clone)]
pub struct ActiveTimeline {
    location: TableLocation,
    timeline: Timeline,
}

impl ActiveTimeline {
    /// Load the timeline by listing the metadata directory.
    ///
    /// If a crash left two state files for one identity (the new state was
    /// created but the old one not yet deleted), the more advanced state wins
    /// and the stale lower-state file is removed.
    pub async fn load(location: TableLocation) -> TimelineResult<Self> {
        let timeline = Self::scan(&location).await?;
        Ok(ActiveTimeline { location, timeline })
    }

    async fn scan(location: &TableLocation) -> TimelineResult<Timeline> {
        let entries = storage::list_dir_or_empty(location.storage(), &layout::metadata_rel_dir())
            .await
            .context(StorageSnafu)?;

        let mut latest: BTreeMap<(InstantTime, ActionType), Instant> = BTreeMap::new();
        let mut stale = Vec::new();
        for entry in entries.into_iter().filter(|e| !e.is_dir) {
            let Some(instant) = Instant::parse_file_name(&entry.name) else {
                continue;
            };
            let key = (instant.timestamp.clone(), instant.action);
            match latest.get(&key) {
                Some(existing) if existing.state >= instant.state => stale.push(instant),
                _ => {
                    if let Some(previous) = latest.insert(key, instant) {
                        stale.push(previous);
                    }
                }
            }
        }

        for instant in stale {
            let rel = layout::instant_rel_path(&instant.file_name());
            if storage::delete_file(location.storage(), &rel)
                .await
                .context(StorageSnafu)?
            {
                warn!(
                    "Removed stale state file {} left by an interrupted transition",
                    rel.display()
                );
            }
        }
        Ok(Timeline::new(latest.into_values().collect()))
    }

    /// Refresh the snapshot from storage.
    pub async fn reload(&mut self) -> TimelineResult<()> {
        self.timeline = Self::scan(&self.location).await?;
        Ok(())
    }

    /// The current snapshot.
    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// The table this timeline belongs to.
    pub fn location(&self) -> &TableLocation {
        &self.location
    }

    /// A fresh instant time strictly greater than every instant in the
    /// snapshot.
    pub fn new_instant_time(&self) -> InstantTime {
        let now = InstantTime::now();
        let last = self.timeline.instants().map(|i| &i.timestamp).max();
        match last {
            Some(last) if now <= *last => last.successor().unwrap_or(now),
            _ => now,
        }
    }

    /// Record a new REQUESTED instant with `payload` (may be empty).
    ///
    /// Fails with
    /// [`TimelineError::InstantAlreadyExists`](crate::timeline::TimelineError::InstantAlreadyExists)
    /// when any state file for the same `(timestamp, action)` exists.
    pub async fn create_requested(
        &mut self,
        timestamp: &InstantTime,
        action: ActionType,
        payload: &[u8],
    ) -> TimelineResult<Instant> {
        let instant = Instant::requested(timestamp, action);
        for state in [InstantState::Inflight, InstantState::Completed] {
            if self.state_file_exists(&instant.with_state(state)).await? {
                return InstantAlreadyExistsSnafu {
                    instant: instant.with_state(state).to_string(),
                }
                .fail();
            }
        }
        self.create_state_file(&instant, payload).await?;
        info!("Created requested instant {instant}");
        self.timeline.upsert(instant.clone());
        Ok(instant)
    }

    /// REQUESTED → INFLIGHT. With `payload == None` the inflight file is
    /// empty.
    pub async fn transition_requested_to_inflight(
        &mut self,
        requested: &Instant,
        payload: Option<&[u8]>,
    ) -> TimelineResult<Instant> {
        self.transition(
            requested,
            InstantState::Requested,
            InstantState::Inflight,
            payload.unwrap_or_default(),
        )
        .await
    }

    /// INFLIGHT → COMPLETED with the final metadata payload.
    pub async fn transition_inflight_to_complete(
        &mut self,
        inflight: &Instant,
        payload: &[u8],
    ) -> TimelineResult<Instant> {
        self.transition(
            inflight,
            InstantState::Inflight,
            InstantState::Completed,
            payload,
        )
        .await
    }

    /// COMPLETED → INFLIGHT. Used to unpublish a commit before rolling it
    /// back. With `payload == None` the completed payload is kept; actions
    /// whose inflight payload differs from their completed one pass it in.
    pub async fn revert_complete_to_inflight(
        &mut self,
        completed: &Instant,
        payload: Option<&[u8]>,
    ) -> TimelineResult<Instant> {
        let payload = match payload {
            Some(payload) => Bytes::copy_from_slice(payload),
            None => self.read_details(completed).await?,
        };
        self.transition(
            completed,
            InstantState::Completed,
            InstantState::Inflight,
            &payload,
        )
        .await
    }

    /// INFLIGHT → REQUESTED, keeping the payload. Used to retry a compaction
    /// whose inflight attempt was rolled back.
    pub async fn revert_inflight_to_requested(
        &mut self,
        inflight: &Instant,
    ) -> TimelineResult<Instant> {
        let payload = self.read_details(inflight).await?;
        self.transition(
            inflight,
            InstantState::Inflight,
            InstantState::Requested,
            &payload,
        )
        .await
    }

    /// Remove every state file of the identity of `instant`.
    pub async fn delete_instant(&mut self, instant: &Instant) -> TimelineResult<()> {
        // Most advanced first, so a crash never leaves an older state looking
        // current while a newer one is still around.
        for state in [
            InstantState::Completed,
            InstantState::Inflight,
            InstantState::Requested,
        ] {
            let rel = layout::instant_rel_path(&instant.with_state(state).file_name());
            if storage::delete_file(self.location.storage(), &rel)
                .await
                .context(StorageSnafu)?
            {
                debug!("Deleted instant file {}", rel.display());
            }
        }
        info!(
            "Deleted instant {}__{}",
            instant.timestamp, instant.action
        );
        self.timeline.remove(instant);
        Ok(())
    }

    /// Payload stored with `instant` in its current state.
    pub async fn read_details(&self, instant: &Instant) -> TimelineResult<Bytes> {
        let rel = layout::instant_rel_path(&instant.file_name());
        match storage::read_all_bytes(self.location.storage(), &rel).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.is_not_found() => InstantNotFoundSnafu {
                instant: instant.to_string(),
            }
            .fail(),
            Err(e) => Err(e).context(StorageSnafu),
        }
    }

    async fn transition(
        &mut self,
        from: &Instant,
        expected: InstantState,
        target: InstantState,
        payload: &[u8],
    ) -> TimelineResult<Instant> {
        if from.state != expected {
            return InvalidTransitionSnafu {
                instant: from.to_string(),
                target,
            }
            .fail();
        }
        let from = from.with_state(expected);
        if !self.state_file_exists(&from).await? {
            return InstantNotFoundSnafu {
                instant: from.to_string(),
            }
            .fail();
        }

        let to = from.with_state(target);
        if target < expected {
            // A lower-state file may survive an interrupted forward
            // transition; reverting replaces it.
            storage::write_atomic(
                self.location.storage(),
                &layout::instant_rel_path(&to.file_name()),
                payload,
            )
            .await
            .context(StorageSnafu)?;
        } else {
            self.create_state_file(&to, payload).await?;
        }
        storage::delete_file(
            self.location.storage(),
            &layout::instant_rel_path(&from.file_name()),
        )
        .await
        .context(StorageSnafu)?;

        info!("Transitioned {from} to {target}");
        self.timeline.upsert(to.clone());
        Ok(to)
    }

    async fn state_file_exists(&self, instant: &Instant) -> TimelineResult<bool> {
        storage::exists(
            self.location.storage(),
            &layout::instant_rel_path(&instant.file_name()),
        )
        .await
        .context(StorageSnafu)
    }

    async fn create_state_file(&self, instant: &Instant, payload: &[u8]) -> TimelineResult<()> {
        let rel = layout::instant_rel_path(&instant.file_name());
        match storage::write_new_atomic(self.location.storage(), &rel, payload).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_exists() => InstantAlreadyExistsSnafu {
                instant: instant.to_string(),
            }
            .fail(),
            Err(e) => Err(e).context(StorageSnafu),
        }
    }
}

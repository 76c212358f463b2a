//! Cleaner: plan and delete file slices no longer needed by the retained
//! history.
//!
//! A clean runs in two phases. Planning inspects the file system view and
//! persists a [`CleanerPlan`] as `<ts>.clean.requested`; execution moves the
//! instant to INFLIGHT (carrying the plan along), deletes the planned files
//! with bounded parallelism, waits until they are no longer listed and
//! completes the instant with [`CleanMetadata`]. Plans left pending by an
//! earlier process are executed before a new one is made, so a crashed clean
//! is finished rather than re-planned.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use snafu::prelude::*;

use crate::action::commit::wait_disappear;
use crate::action::{ActionResult, CleanSnafu, ProtocolResult, elapsed_ms};
use crate::config::CleanerConfig;
use crate::engine::WriteEngine;
use crate::fs_view::{FileGroup, FileSlice, FileSystemView, TableFileSystemView};
use crate::metadata::{
    CleanFileInfo, CleanMetadata, CleanStat, CleanerPlan, CleaningPolicy, METADATA_VERSION,
    PartitionCleanStat, SavepointMetadata,
};
use crate::storage::{self, StorageLocation};
use crate::table::Table;
use crate::timeline::{ActionType, ActiveTimeline, Instant, InstantState, InstantTime, Timeline};

/// Finish pending cleans, then plan and run a new clean at `instant_time`.
/// Returns `None` when there was nothing to clean.
pub(crate) async fn clean<E: WriteEngine>(
    table: &mut Table<E>,
    instant_time: &InstantTime,
) -> ActionResult<Option<CleanMetadata>> {
    let pending: Vec<Instant> = table
        .timeline
        .timeline()
        .clean_timeline()
        .filter_pending()
        .instants()
        .cloned()
        .collect();
    for instant in pending {
        info!("Resuming pending clean {instant}");
        run_clean(table, &instant).await.context(CleanSnafu {
            instant: instant.timestamp.to_string(),
        })?;
    }

    let requested = request_clean(table, instant_time)
        .await
        .context(CleanSnafu {
            instant: instant_time.to_string(),
        })?;
    match requested {
        Some(instant) => run_clean(table, &instant)
            .await
            .map(Some)
            .context(CleanSnafu {
                instant: instant_time.to_string(),
            }),
        None => Ok(None),
    }
}

/// Compute a plan and persist it as a REQUESTED clean. An empty plan
/// creates no instant.
async fn request_clean<E: WriteEngine>(
    table: &mut Table<E>,
    instant_time: &InstantTime,
) -> ProtocolResult<Option<Instant>> {
    let view = TableFileSystemView::load(&table.timeline).await?;
    let savepointed = savepointed_files(&table.timeline).await?;
    let plan = plan_clean(
        &view,
        &table.timeline.timeline().completed_commits_timeline(),
        &savepointed,
        &table.write_config.cleaner,
    );
    if plan.is_empty() {
        info!("Nothing to clean at {instant_time}");
        return Ok(None);
    }
    info!(
        "Planned clean {instant_time}: {} file(s) in {} partition(s), earliest retained {:?}",
        plan.total_files(),
        plan.files_to_delete_per_partition.len(),
        plan.earliest_instant_to_retain
    );
    let instant = table
        .timeline
        .create_requested(instant_time, ActionType::Clean, &plan.to_bytes()?)
        .await?;
    Ok(Some(instant))
}

/// Base file names pinned by completed savepoints.
pub(crate) async fn savepointed_files(timeline: &ActiveTimeline) -> ProtocolResult<BTreeSet<String>> {
    let mut files = BTreeSet::new();
    for instant in timeline.timeline().savepoint_timeline().instants() {
        let bytes = timeline.read_details(instant).await?;
        files.extend(SavepointMetadata::from_bytes(&bytes)?.savepointed_files());
    }
    Ok(files)
}

/// Decide which files a clean deletes. The result depends only on the
/// arguments: partitions and paths come out sorted.
pub fn plan_clean(
    view: &dyn FileSystemView,
    completed_commits: &Timeline,
    savepointed_files: &BTreeSet<String>,
    config: &CleanerConfig,
) -> CleanerPlan {
    let pending_compaction: BTreeSet<(String, String, InstantTime)> = view
        .pending_compaction_operations()
        .into_iter()
        .map(|(_, op)| (op.partition_path, op.file_id, op.base_instant_time))
        .collect();
    let keep_for_compaction = |slice: &FileSlice| {
        pending_compaction.contains(&(
            slice.partition_path.clone(),
            slice.file_id.clone(),
            slice.base_instant_time.clone(),
        ))
    };
    let is_savepointed = |slice: &FileSlice| {
        slice
            .base_file
            .as_ref()
            .is_some_and(|b| savepointed_files.contains(&b.file_name))
    };

    let earliest_instant_to_retain = match config.policy {
        CleaningPolicy::KeepLatestCommits => completed_commits
            .count_instants()
            .checked_sub(config.commits_retained + 1)
            .and_then(|n| completed_commits.nth_instant(n))
            .map(|i| i.timestamp.clone()),
        CleaningPolicy::KeepLatestFileVersions => None,
    };

    let mut files_to_delete_per_partition = BTreeMap::new();
    for partition in view.partition_paths() {
        let mut paths = BTreeSet::new();
        let mut bootstrap_paths = BTreeSet::new();
        for group in view.file_groups(&partition) {
            let doomed = match config.policy {
                CleaningPolicy::KeepLatestCommits => match &earliest_instant_to_retain {
                    Some(earliest) => slices_older_than(&group, earliest),
                    None => Vec::new(),
                },
                CleaningPolicy::KeepLatestFileVersions => {
                    slices_beyond_versions(&group, config.file_versions_retained, &is_savepointed)
                }
            };
            for slice in doomed {
                if is_savepointed(slice) || keep_for_compaction(slice) {
                    debug!(
                        "Keeping slice {}@{} of {partition}",
                        slice.file_id, slice.base_instant_time
                    );
                    continue;
                }
                paths.extend(slice.file_rel_paths());
                bootstrap_paths.extend(
                    slice
                        .base_file
                        .as_ref()
                        .and_then(|b| b.bootstrap_source.clone()),
                );
            }
        }
        let files: Vec<CleanFileInfo> = paths
            .into_iter()
            .map(|file_path| CleanFileInfo {
                file_path,
                is_bootstrap_base_file: false,
            })
            .chain(bootstrap_paths.into_iter().map(|file_path| CleanFileInfo {
                file_path,
                is_bootstrap_base_file: true,
            }))
            .collect();
        if !files.is_empty() {
            files_to_delete_per_partition.insert(partition, files);
        }
    }

    CleanerPlan {
        earliest_instant_to_retain,
        policy: config.policy,
        files_to_delete_per_partition,
        version: METADATA_VERSION,
    }
}

/// Slices based strictly before `earliest`, never the latest one.
fn slices_older_than<'a>(group: &'a FileGroup, earliest: &InstantTime) -> Vec<&'a FileSlice> {
    group
        .slices_newest_first()
        .skip(1)
        .filter(|s| s.base_instant_time < *earliest)
        .collect()
}

/// Slices past the `retained` newest ones. Savepointed slices do not count
/// towards `retained`.
fn slices_beyond_versions<'a>(
    group: &'a FileGroup,
    retained: usize,
    is_savepointed: &impl Fn(&FileSlice) -> bool,
) -> Vec<&'a FileSlice> {
    let mut kept = 0;
    let mut doomed = Vec::new();
    for slice in group.slices_newest_first() {
        if slice.is_empty() || is_savepointed(slice) {
            continue;
        }
        if kept < retained {
            kept += 1;
        } else {
            doomed.push(slice);
        }
    }
    doomed
}

/// Execute a REQUESTED or INFLIGHT clean through to COMPLETED.
async fn run_clean<E: WriteEngine>(
    table: &mut Table<E>,
    instant: &Instant,
) -> ProtocolResult<CleanMetadata> {
    let start = std::time::Instant::now();
    let bytes = table.timeline.read_details(instant).await?;
    let plan = CleanerPlan::from_bytes(&bytes)?;
    let inflight = if instant.state == InstantState::Requested {
        table
            .timeline
            .transition_requested_to_inflight(instant, Some(&bytes))
            .await?
    } else {
        instant.clone()
    };

    let parallelism = table.write_config.cleaner.parallelism.max(1);
    info!(
        "Cleaning {} file(s) for {} with parallelism {parallelism}",
        plan.total_files(),
        inflight.timestamp
    );
    let outcomes = delete_planned_files(table.location.storage(), &plan, parallelism).await;

    let mut stats: BTreeMap<String, PartitionCleanStat> = BTreeMap::new();
    let mut deleted: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (partition, file, success) in outcomes {
        if success && !file.is_bootstrap_base_file {
            deleted
                .entry(partition.clone())
                .or_default()
                .push(file_name(&file.file_path).to_string());
        }
        let mut outcome = PartitionCleanStat::new(partition.clone());
        outcome.add_deleted_file(&file.file_path, success, file.is_bootstrap_base_file);
        let merged = match stats.remove(&partition) {
            Some(existing) => existing.merge(outcome),
            None => outcome,
        };
        stats.insert(partition, merged);
    }
    wait_disappear(table.guard.as_ref(), &deleted).await?;

    let clean_stats: Vec<CleanStat> = plan
        .files_to_delete_per_partition
        .keys()
        .map(|partition| {
            CleanStat::from_plan_and_outcome(&plan, partition, stats.remove(partition))
        })
        .collect();
    let metadata = CleanMetadata::new(
        inflight.timestamp.clone(),
        elapsed_ms(start),
        plan.earliest_instant_to_retain.clone(),
        clean_stats,
    );
    table
        .timeline
        .transition_inflight_to_complete(&inflight, &metadata.to_bytes()?)
        .await?;
    info!(
        "Completed clean {}: {} file(s) deleted",
        inflight.timestamp, metadata.total_files_deleted
    );
    Ok(metadata)
}

/// Delete every planned file, at most `parallelism` at a time. A file that
/// is already gone, or that fails to delete, is reported unsuccessful.
/// Bootstrap source files are planned by resolved path and deleted as such.
async fn delete_planned_files(
    location: &StorageLocation,
    plan: &CleanerPlan,
    parallelism: usize,
) -> Vec<(String, CleanFileInfo, bool)> {
    let work = plan
        .files_to_delete_per_partition
        .iter()
        .flat_map(|(partition, files)| files.iter().map(move |f| (partition.clone(), f.clone())));

    stream::iter(work)
        .map(|(partition, file)| async move {
            let success = match storage::delete_file(location, Path::new(&file.file_path)).await {
                Ok(true) => true,
                Ok(false) => {
                    debug!("Clean target {} already gone", file.file_path);
                    false
                }
                Err(e) => {
                    warn!("Failed to delete {}: {e}", file.file_path);
                    false
                }
            };
            (partition, file, success)
        })
        .buffer_unordered(parallelism)
        .collect()
        .await
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_view::BaseFile;
    use crate::metadata::CompactionOperation;

    struct StaticView {
        groups: Vec<FileGroup>,
        pending: Vec<(InstantTime, CompactionOperation)>,
    }

    impl FileSystemView for StaticView {
        fn partition_paths(&self) -> Vec<String> {
            let set: BTreeSet<String> = self.groups.iter().map(|g| g.partition_path.clone()).collect();
            set.into_iter().collect()
        }

        fn file_groups(&self, partition_path: &str) -> Vec<FileGroup> {
            self.groups
                .iter()
                .filter(|g| g.partition_path == partition_path)
                .cloned()
                .collect()
        }

        fn pending_compaction_operations(&self) -> Vec<(InstantTime, CompactionOperation)> {
            self.pending.clone()
        }
    }

    fn group(partition: &str, file_id: &str, instants: &[&str]) -> FileGroup {
        let mut group = FileGroup::new(partition, file_id);
        for ts in instants {
            let ts = InstantTime::new(*ts);
            group.slice_mut(&ts).base_file = Some(BaseFile {
                partition_path: partition.to_string(),
                file_id: file_id.to_string(),
                instant_time: ts.clone(),
                file_name: format!("{file_id}_0-0_{ts}.jsonl"),
                size: 10,
                bootstrap_source: None,
            });
        }
        group
    }

    fn commits(instants: &[&str]) -> Timeline {
        Timeline::new(
            instants
                .iter()
                .map(|ts| Instant::completed(*ts, ActionType::Commit))
                .collect(),
        )
    }

    fn config(policy: CleaningPolicy, retained: usize) -> CleanerConfig {
        CleanerConfig {
            policy,
            commits_retained: retained,
            file_versions_retained: retained,
            ..CleanerConfig::default()
        }
    }

    fn planned_paths(plan: &CleanerPlan, partition: &str) -> Vec<String> {
        plan.files_to_delete_per_partition
            .get(partition)
            .map(|files| files.iter().map(|f| f.file_path.clone()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn keep_latest_commits_retains_slices_of_the_last_commits() {
        let view = StaticView {
            groups: vec![group("p", "f1", &["001", "002", "003", "004", "005"])],
            pending: Vec::new(),
        };
        let timeline = commits(&["001", "002", "003", "004", "005"]);
        let plan = plan_clean(
            &view,
            &timeline,
            &BTreeSet::new(),
            &config(CleaningPolicy::KeepLatestCommits, 2),
        );

        assert_eq!(plan.earliest_instant_to_retain, Some(InstantTime::new("003")));
        assert_eq!(
            planned_paths(&plan, "p"),
            vec!["p/f1_0-0_001.jsonl".to_string(), "p/f1_0-0_002.jsonl".to_string()]
        );
    }

    #[test]
    fn keep_latest_commits_with_short_history_plans_nothing() {
        let view = StaticView {
            groups: vec![group("p", "f1", &["001", "002"])],
            pending: Vec::new(),
        };
        let plan = plan_clean(
            &view,
            &commits(&["001", "002"]),
            &BTreeSet::new(),
            &config(CleaningPolicy::KeepLatestCommits, 2),
        );
        assert!(plan.is_empty());
        assert_eq!(plan.earliest_instant_to_retain, None);
    }

    #[test]
    fn latest_slice_and_savepoints_are_never_cleaned() {
        let view = StaticView {
            groups: vec![
                group("p", "f1", &["001", "002", "005"]),
                group("p", "f2", &["001"]),
            ],
            pending: Vec::new(),
        };
        let savepointed: BTreeSet<String> = ["f1_0-0_001.jsonl".to_string()].into();
        let plan = plan_clean(
            &view,
            &commits(&["001", "002", "003", "004", "005"]),
            &savepointed,
            &config(CleaningPolicy::KeepLatestCommits, 1),
        );
        assert_eq!(planned_paths(&plan, "p"), vec!["p/f1_0-0_002.jsonl".to_string()]);
    }

    #[test]
    fn slices_under_pending_compaction_are_kept() {
        let view = StaticView {
            groups: vec![group("p", "f1", &["001", "002", "003", "004"])],
            pending: vec![(
                InstantTime::new("006"),
                CompactionOperation {
                    partition_path: "p".to_string(),
                    file_id: "f1".to_string(),
                    base_instant_time: InstantTime::new("001"),
                    base_file: None,
                    log_files: Vec::new(),
                },
            )],
        };
        let plan = plan_clean(
            &view,
            &commits(&["001", "002", "003", "004"]),
            &BTreeSet::new(),
            &config(CleaningPolicy::KeepLatestCommits, 1),
        );
        assert_eq!(planned_paths(&plan, "p"), vec!["p/f1_0-0_002.jsonl".to_string()]);
    }

    #[test]
    fn keep_latest_file_versions_ignores_savepointed_slices_when_counting() {
        let view = StaticView {
            groups: vec![group("p", "f1", &["001", "002", "003", "004"])],
            pending: Vec::new(),
        };
        let savepointed: BTreeSet<String> = ["f1_0-0_003.jsonl".to_string()].into();
        let plan = plan_clean(
            &view,
            &commits(&["001", "002", "003", "004"]),
            &savepointed,
            &config(CleaningPolicy::KeepLatestFileVersions, 2),
        );
        assert_eq!(plan.earliest_instant_to_retain, None);
        assert_eq!(planned_paths(&plan, "p"), vec!["p/f1_0-0_001.jsonl".to_string()]);
    }

    #[test]
    fn bootstrap_sources_of_cleaned_slices_are_planned_by_full_path() {
        let mut f1 = group("p", "f1", &["001", "002", "003"]);
        let skeleton = f1.slice_mut(&InstantTime::new("001"));
        if let Some(base) = skeleton.base_file.as_mut() {
            base.bootstrap_source = Some("/source/p/part-0001.jsonl".to_string());
        }
        let view = StaticView {
            groups: vec![f1],
            pending: Vec::new(),
        };
        let plan = plan_clean(
            &view,
            &commits(&["001", "002", "003"]),
            &BTreeSet::new(),
            &config(CleaningPolicy::KeepLatestFileVersions, 2),
        );

        assert_eq!(
            plan.files_to_delete_per_partition["p"],
            vec![
                CleanFileInfo {
                    file_path: "p/f1_0-0_001.jsonl".to_string(),
                    is_bootstrap_base_file: false,
                },
                CleanFileInfo {
                    file_path: "/source/p/part-0001.jsonl".to_string(),
                    is_bootstrap_base_file: true,
                },
            ]
        );
    }

    #[test]
    fn planning_is_deterministic() {
        let view = StaticView {
            groups: vec![
                group("b", "f2", &["001", "002", "003"]),
                group("a", "f1", &["001", "002", "003"]),
            ],
            pending: Vec::new(),
        };
        let timeline = commits(&["001", "002", "003"]);
        let cfg = config(CleaningPolicy::KeepLatestFileVersions, 1);
        let first = plan_clean(&view, &timeline, &BTreeSet::new(), &cfg);
        let second = plan_clean(&view, &timeline, &BTreeSet::new(), &cfg);
        assert_eq!(first, second);
        assert_eq!(
            first.files_to_delete_per_partition.keys().cloned().collect::<Vec<_>>(),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}

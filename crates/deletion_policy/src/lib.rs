//! DeletionPolicy (SPEC_FULL §4.4): a thin, pure coordinator over commit
//! retention and translog generation retention. Deliberately decoupled
//! from [`segment_store::SegmentStore`] and [`translog::Translog`] — it
//! only consumes [`segment_store::CommitInfo`] and a caller-supplied set of
//! view-pinned generations, and returns a decision; `engine` is the one
//! that turns the decision into actual `delete_commit`/
//! `trim_unreferenced_generations` calls. That separation is what makes
//! the retention algorithm itself property-testable without any I/O.

use std::collections::BTreeMap;

use common::types::SeqNo;
use parking_lot::Mutex;
use segment_store::{
    CommitId,
    CommitInfo,
};

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RetentionDecision {
    /// Commit ids to keep, newest-first.
    pub keep: Vec<CommitId>,
    /// Commit ids safe to physically delete.
    pub delete: Vec<CommitId>,
    /// `MG` (SPEC_FULL §4.4): every translog generation `< this` may be
    /// deleted.
    pub min_translog_generation_for_recovery: u64,
}

/// Tracks commits pinned by a higher-level snapshot flow (SPEC_FULL §4.4
/// "Snapshot hook") in addition to the ordinary commit-retention rule.
#[derive(Default)]
pub struct DeletionPolicy {
    snapshotted: Mutex<BTreeMap<CommitId, u32>>,
}

impl DeletionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `id` so it survives [`DeletionPolicy::on_commit`] even once an
    /// ordinary retention pass would otherwise delete it. Refcounted: call
    /// [`DeletionPolicy::release_snapshot`] an equal number of times.
    pub fn snapshot_commit(&self, id: CommitId) {
        *self.snapshotted.lock().entry(id).or_insert(0) += 1;
    }

    pub fn release_snapshot(&self, id: CommitId) {
        let mut snapshotted = self.snapshotted.lock();
        if let Some(count) = snapshotted.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                snapshotted.remove(&id);
            }
        }
    }

    pub fn is_snapshotted(&self, id: CommitId) -> bool {
        self.snapshotted.lock().contains_key(&id)
    }

    /// Decide which commits to keep given the store's commit list
    /// (newest-first, as returned by
    /// [`segment_store::SegmentStore::list_commits`]) and the shard's
    /// current global checkpoint, then fold in `pinned_translog_generations`
    /// (outstanding [`translog::View`] pins, supplied by the caller) to
    /// compute the translog retention floor.
    ///
    /// Commit retention: "keep the latest commit whose localCheckpoint <=
    /// globalCheckpoint, and keep all subsequent commits" (SPEC_FULL §4.4)
    /// — iterating newest-first, the first commit meeting the bound, and
    /// everything newer than it, are kept. If the global checkpoint is
    /// unknown or no commit meets the bound yet, the newest commit is
    /// always kept so the shard is never left with zero durable commits.
    pub fn on_commit(
        &self,
        commits: &[CommitInfo],
        global_checkpoint: Option<SeqNo>,
        pinned_translog_generations: &[u64],
    ) -> RetentionDecision {
        let snapshotted = self.snapshotted.lock();
        let mut keep = Vec::new();
        let mut delete = Vec::new();
        let mut floor_found = false;
        for commit in commits {
            let meets_floor = commit
                .metadata
                .local_checkpoint
                .zip(global_checkpoint)
                .is_some_and(|(lcp, gcp)| lcp <= gcp);
            if meets_floor {
                floor_found = true;
            }
            if floor_found || snapshotted.contains_key(&commit.id) {
                keep.push(commit.id);
            } else {
                delete.push(commit.id);
            }
        }
        if keep.is_empty() {
            if let Some(newest) = commits.first() {
                delete.retain(|id| *id != newest.id);
                keep.push(newest.id);
            }
        }

        let min_translog_generation_for_recovery = keep
            .iter()
            .filter_map(|id| commits.iter().find(|c| c.id == *id))
            .map(|c| c.metadata.translog_generation)
            .chain(pinned_translog_generations.iter().copied())
            .min()
            .unwrap_or(0);

        RetentionDecision {
            keep,
            delete,
            min_translog_generation_for_recovery,
        }
    }
}

#[cfg(test)]
mod tests {
    use segment_store::{
        uuid_stub::Uuid,
        CommitMetadata,
    };

    use super::*;

    fn commit(id: CommitId, generation: u64, local_checkpoint: Option<u64>) -> CommitInfo {
        CommitInfo {
            id,
            metadata: CommitMetadata {
                translog_uuid: Uuid(1),
                translog_generation: generation,
                local_checkpoint: local_checkpoint.map(SeqNo),
                max_seq_no: local_checkpoint.map(SeqNo),
                history_uuid: Uuid(2),
                min_retained_seq_no: None,
            },
        }
    }

    #[test]
    fn steady_state_collapses_to_keeping_only_the_latest_commit() {
        let policy = DeletionPolicy::new();
        let commits = vec![commit(2, 5, Some(10)), commit(1, 3, Some(6)), commit(0, 0, Some(0))];
        let decision = policy.on_commit(&commits, Some(SeqNo(10)), &[]);
        assert_eq!(decision.keep, vec![2]);
        assert_eq!(decision.delete, vec![1, 0]);
        assert_eq!(decision.min_translog_generation_for_recovery, 5);
    }

    #[test]
    fn keeps_newest_commit_meeting_the_floor_and_everything_newer() {
        let policy = DeletionPolicy::new();
        // global checkpoint is behind the newest commit's local checkpoint,
        // so both the newest commit and the one that satisfies the bound
        // must be retained.
        let commits = vec![commit(2, 7, Some(20)), commit(1, 4, Some(5)), commit(0, 1, Some(0))];
        let decision = policy.on_commit(&commits, Some(SeqNo(5)), &[]);
        assert_eq!(decision.keep, vec![2, 1]);
        assert_eq!(decision.delete, vec![0]);
        assert_eq!(decision.min_translog_generation_for_recovery, 4);
    }

    #[test]
    fn never_deletes_every_commit_when_none_meet_the_floor() {
        let policy = DeletionPolicy::new();
        let commits = vec![commit(1, 2, Some(100)), commit(0, 1, Some(50))];
        let decision = policy.on_commit(&commits, Some(SeqNo(0)), &[]);
        assert_eq!(decision.keep, vec![1]);
        assert_eq!(decision.delete, vec![0]);
    }

    #[test]
    fn snapshot_pinned_commit_survives_even_when_older_than_the_floor() {
        let policy = DeletionPolicy::new();
        let commits = vec![commit(1, 5, Some(10)), commit(0, 1, Some(1))];
        policy.snapshot_commit(0);
        let decision = policy.on_commit(&commits, Some(SeqNo(10)), &[]);
        assert!(decision.keep.contains(&0));
        assert!(!decision.delete.contains(&0));

        policy.release_snapshot(0);
        let decision = policy.on_commit(&commits, Some(SeqNo(10)), &[]);
        assert!(!decision.keep.contains(&0));
    }

    #[test]
    fn pinned_translog_generation_widens_retention_below_the_kept_commit() {
        let policy = DeletionPolicy::new();
        let commits = vec![commit(0, 7, Some(10))];
        let decision = policy.on_commit(&commits, Some(SeqNo(10)), &[3]);
        assert_eq!(decision.min_translog_generation_for_recovery, 3);
    }

    #[test]
    fn no_commits_yields_zero_floor() {
        let policy = DeletionPolicy::new();
        let decision = policy.on_commit(&[], None, &[]);
        assert!(decision.keep.is_empty());
        assert_eq!(decision.min_translog_generation_for_recovery, 0);
    }
}

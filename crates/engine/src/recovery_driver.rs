//! Peer recovery (SPEC_FULL §4.6 "RecoveryDriver"): ships a source shard
//! copy's durable state to a target so the target can become a replica (or
//! take over as primary) without replaying the source's entire translog
//! history from generation zero.
//!
//! Phase 1 snapshots the source's newest commit; phase 2 replays the
//! source's translog from that commit's local checkpoint onward through the
//! target's ordinary write path, which is what makes phase 2 safely
//! resumable — a retried op is just another idempotent replay (SPEC_FULL
//! §4.5 "Write path"). Streaming the actual segment-file bytes for phase 1
//! is a [`segment_store::SegmentStore`] concern and out of scope here
//! (SPEC_FULL §6); [`Phase1Result`] carries only the commit handle and a
//! coarse manifest.

use common::{
    runtime::Runtime,
    types::SeqNo,
};
use segment_store::{
    CommitId,
    CommitMetadata,
    SnapshotHandle,
};
use translog::View;

use crate::{
    operation_as_delete_request,
    operation_as_index_request,
    Engine,
    ShardEngine,
};

/// What phase 1 hands the target: the pinned commit to copy segments from,
/// plus enough metadata to know where phase 2 must resume.
pub struct Phase1Result {
    pub commit_id: CommitId,
    pub metadata: CommitMetadata,
    pub doc_count: usize,
    /// Keeps the commit's segments alive against [`segment_store::SegmentStore::delete_commit`]
    /// until the caller releases it (drop or explicit release).
    pub snapshot: SnapshotHandle,
    /// Keeps the translog generation the commit was cut against alive
    /// against [`translog::Translog::trim_unreferenced_generations`] until
    /// phase 2 has read everything it needs from it.
    pub translog_view: View,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Phase2Result {
    pub ops_sent: usize,
    pub from_seq_no: SeqNo,
    /// The highest seqNo actually replayed; equals `from_seq_no` unchanged
    /// when nothing was sent.
    pub to_seq_no: SeqNo,
}

/// Drives recovery of one target shard copy from one source [`Engine`].
pub struct RecoveryDriver<R: Runtime> {
    source: std::sync::Arc<Engine<R>>,
}

impl<R: Runtime> RecoveryDriver<R> {
    pub fn new(source: std::sync::Arc<Engine<R>>) -> Self {
        Self { source }
    }

    /// Snapshot the source's newest commit and pin the translog generation
    /// it was cut against (SPEC_FULL §4.6 "Phase 1"). Returns `None` if the
    /// source has never flushed.
    pub fn phase1(&self) -> anyhow::Result<Option<Phase1Result>> {
        let commits = self.source.store.list_commits();
        let Some(commit) = commits.first() else {
            return Ok(None);
        };
        let snapshot = self.source.store.snapshot_commit(commit.id)?;
        let translog_view = self.source.translog.acquire_view(commit.metadata.translog_generation);
        Ok(Some(Phase1Result {
            commit_id: commit.id,
            metadata: commit.metadata.clone(),
            doc_count: self.source.store.open_reader().doc_count(),
            snapshot,
            translog_view,
        }))
    }

    pub fn release_phase1(&self, result: Phase1Result) {
        self.source.store.release_snapshot(result.snapshot);
        drop(result.translog_view);
    }

    /// Replay every source operation with `seq_no >= from_seq_no` onto
    /// `target` through its ordinary write path (SPEC_FULL §4.6 "Phase 2").
    /// Safe to call more than once with an unchanged or smaller
    /// `from_seq_no` if an earlier attempt was interrupted: every op is
    /// replayed with its original stamped `(seqNo, term)`, so a duplicate
    /// is a no-op on the target (SPEC_FULL §4.5 "Write path").
    pub fn phase2(&self, target: &dyn ShardEngine, from_seq_no: SeqNo) -> anyhow::Result<Phase2Result> {
        let ops = self.source.translog.snapshot_from(from_seq_no)?;
        let mut ops_sent = 0usize;
        let mut to_seq_no = from_seq_no;
        for op in &ops {
            if let Some(req) = operation_as_index_request(op) {
                target.index(req)?;
            } else if let Some(req) = operation_as_delete_request(op) {
                target.delete(req)?;
            }
            to_seq_no = to_seq_no.max(op.seq_no());
            ops_sent += 1;
        }
        Ok(Phase2Result {
            ops_sent,
            from_seq_no,
            to_seq_no,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        sync::Arc,
    };

    use common::{
        config::EngineConfig,
        runtime::testing::TestRuntime,
        types::{
            DocId,
            IndexRequest,
            Term,
            VersionType,
        },
    };
    use segment_store::{
        memory::InMemorySegmentStore,
        SegmentStore,
    };
    use tempfile::tempdir;

    use super::*;
    use crate::ShardRole;

    fn index_req(doc: &str, body: &str) -> IndexRequest {
        IndexRequest {
            doc_id: DocId::from(doc),
            source: Arc::from(body.as_bytes()),
            routing: None,
            version_type: VersionType::Internal,
            requested_version: None,
            cas: None,
            stamped: None,
            auto_generated_id_timestamp_millis: None,
        }
    }

    fn engine(dir: &Path, store: Arc<dyn SegmentStore>, seed: u64) -> Arc<Engine<TestRuntime>> {
        Engine::create(dir, EngineConfig::default(), ShardRole::Primary, Term(0), store, TestRuntime::new(seed)).unwrap()
    }

    #[tokio::test]
    async fn phase1_returns_none_before_any_flush() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn SegmentStore> = Arc::new(InMemorySegmentStore::new());
        let source = engine(dir.path(), store, 1);
        let driver = RecoveryDriver::new(source);
        assert!(driver.phase1().unwrap().is_none());
    }

    #[tokio::test]
    async fn phase2_replays_source_ops_onto_a_fresh_target() {
        let source_dir = tempdir().unwrap();
        let target_dir = tempdir().unwrap();
        let source_store: Arc<dyn SegmentStore> = Arc::new(InMemorySegmentStore::new());
        let source = engine(source_dir.path(), source_store, 2);
        source.index(index_req("doc-1", "v1")).unwrap();
        source.index(index_req("doc-2", "v2")).unwrap();
        source.update_global_checkpoint(SeqNo(1));
        source.flush(true).unwrap();

        let driver = RecoveryDriver::new(source.clone());
        let phase1 = driver.phase1().unwrap().unwrap();
        assert_eq!(phase1.doc_count, 2);

        let target_store: Arc<dyn SegmentStore> = Arc::new(InMemorySegmentStore::new());
        let target = engine(target_dir.path(), target_store, 3);
        let result = driver.phase2(&*target, SeqNo(0)).unwrap();
        assert_eq!(result.ops_sent, 2);
        assert_eq!(result.to_seq_no, SeqNo(1));
        assert!(target.get(&DocId::from("doc-1"), true).unwrap().is_some());
        assert!(target.get(&DocId::from("doc-2"), true).unwrap().is_some());
        driver.release_phase1(phase1);
    }
}

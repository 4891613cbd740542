//! An in-memory reference [`SegmentStore`] (SPEC_FULL §4.10): enough to
//! drive the engine end-to-end in tests without a real indexing library.
//! `commit()` is synchronous and immediately durable — there is no crash
//! domain to model here, since nothing is written to disk (DESIGN.md, open
//! question "Segment store reference adapter").

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
};

use common::types::DocId;
use parking_lot::RwLock;

use crate::{
    CommitId,
    CommitInfo,
    CommitMetadata,
    SegmentReader,
    SegmentStore,
    SnapshotHandle,
    StoredFields,
};

#[derive(Clone, Default)]
struct Snapshot {
    docs: im_like::Map<DocId, StoredFields>,
}

/// A tiny structural-sharing map so `refresh()` can hand out a cheap
/// `Arc`-backed snapshot without copying every document on every call.
/// Built on a plain `BTreeMap` behind an `Arc` and copy-on-write, which is
/// adequate at reference-implementation scale.
mod im_like {
    use std::{
        collections::BTreeMap,
        sync::Arc,
    };

    #[derive(Clone)]
    pub struct Map<K: Ord + Clone, V: Clone>(Arc<BTreeMap<K, V>>);

    impl<K: Ord + Clone, V: Clone> Default for Map<K, V> {
        fn default() -> Self {
            Self(Arc::new(BTreeMap::new()))
        }
    }

    impl<K: Ord + Clone, V: Clone> Map<K, V> {
        pub fn get(&self, k: &K) -> Option<&V> {
            self.0.get(k)
        }

        pub fn insert(&mut self, k: K, v: V) {
            Arc::make_mut(&mut self.0).insert(k, v);
        }

        pub fn len(&self) -> usize {
            self.0.len()
        }
    }
}

struct SegmentReaderImpl {
    snapshot: Snapshot,
}

impl SegmentReader for SegmentReaderImpl {
    fn get(&self, doc_id: &DocId) -> Option<StoredFields> {
        self.snapshot.docs.get(doc_id).cloned()
    }

    fn doc_count(&self) -> usize {
        self.snapshot.docs.len()
    }
}

struct Inner {
    /// Documents written since the last refresh, not yet visible to readers.
    buffered: BTreeMap<DocId, Option<StoredFields>>,
    /// Visible-to-readers snapshot as of the last refresh.
    visible: Snapshot,
    commits: Vec<CommitInfo>,
    next_commit_id: AtomicU64,
    pinned: BTreeMap<CommitId, u32>,
}

/// Reference [`SegmentStore`] backing test engines. Not for production use:
/// nothing here survives a process restart.
pub struct InMemorySegmentStore {
    inner: RwLock<Inner>,
}

impl Default for InMemorySegmentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySegmentStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                buffered: BTreeMap::new(),
                visible: Snapshot::default(),
                commits: Vec::new(),
                next_commit_id: AtomicU64::new(0),
                pinned: BTreeMap::new(),
            }),
        }
    }
}

/// Fold every buffered write into `visible`, as both `refresh()` and
/// `commit()` must: a real segment writer's commit durably persists every
/// buffered document regardless of whether a reader has been reopened over
/// it yet, so `commit()` cannot skip this just because no one called
/// `refresh()` first.
fn absorb_buffered(inner: &mut Inner) -> bool {
    if inner.buffered.is_empty() {
        return false;
    }
    let buffered = std::mem::take(&mut inner.buffered);
    for (doc_id, fields) in buffered {
        match fields {
            Some(fields) => inner.visible.docs.insert(doc_id, fields),
            None => inner.visible.docs.insert(
                doc_id.clone(),
                StoredFields {
                    doc_id,
                    seq_no: common::types::SeqNo::ZERO,
                    primary_term: common::types::Term::ZERO,
                    version: common::types::Version::INITIAL,
                    source: Arc::from([]),
                    tombstone: true,
                },
            ),
        }
    }
    true
}

impl SegmentStore for InMemorySegmentStore {
    fn add_document(&self, fields: StoredFields) -> anyhow::Result<()> {
        self.inner.write().buffered.insert(fields.doc_id.clone(), Some(fields));
        Ok(())
    }

    fn soft_update_document(&self, doc_id: &DocId, fields: StoredFields) -> anyhow::Result<()> {
        debug_assert_eq!(doc_id, &fields.doc_id);
        self.inner.write().buffered.insert(fields.doc_id.clone(), Some(fields));
        Ok(())
    }

    fn delete_documents(&self, doc_id: &DocId) -> anyhow::Result<()> {
        self.inner.write().buffered.insert(doc_id.clone(), None);
        Ok(())
    }

    fn refresh(&self) -> anyhow::Result<bool> {
        Ok(absorb_buffered(&mut self.inner.write()))
    }

    fn open_reader(&self) -> Arc<dyn SegmentReader> {
        Arc::new(SegmentReaderImpl {
            snapshot: self.inner.read().visible.clone(),
        })
    }

    fn commit(&self, metadata: CommitMetadata) -> anyhow::Result<CommitId> {
        let mut inner = self.inner.write();
        absorb_buffered(&mut inner);
        let id = inner.next_commit_id.fetch_add(1, Ordering::SeqCst);
        inner.commits.push(CommitInfo { id, metadata });
        Ok(id)
    }

    fn list_commits(&self) -> Vec<CommitInfo> {
        let mut commits = self.inner.read().commits.clone();
        commits.reverse();
        commits
    }

    fn delete_commit(&self, id: CommitId) -> anyhow::Result<()> {
        let mut inner = self.inner.write();
        if inner.pinned.contains_key(&id) {
            anyhow::bail!("cannot delete snapshot-pinned commit {id}");
        }
        inner.commits.retain(|c| c.id != id);
        Ok(())
    }

    fn snapshot_commit(&self, id: CommitId) -> anyhow::Result<SnapshotHandle> {
        let mut inner = self.inner.write();
        if !inner.commits.iter().any(|c| c.id == id) {
            anyhow::bail!("cannot snapshot unknown commit {id}");
        }
        *inner.pinned.entry(id).or_insert(0) += 1;
        Ok(SnapshotHandle(id))
    }

    fn release_snapshot(&self, handle: SnapshotHandle) {
        let mut inner = self.inner.write();
        if let Some(count) = inner.pinned.get_mut(&handle.0) {
            *count -= 1;
            if *count == 0 {
                inner.pinned.remove(&handle.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use common::types::{
        SeqNo,
        Term,
        Version,
    };

    use super::*;

    fn fields(id: &str, seq_no: u64) -> StoredFields {
        StoredFields {
            doc_id: DocId::from(id),
            seq_no: SeqNo(seq_no),
            primary_term: Term(1),
            version: Version(1),
            source: Arc::from(b"{}".as_slice()),
            tombstone: false,
        }
    }

    #[test]
    fn add_then_refresh_makes_document_visible() {
        let store = InMemorySegmentStore::new();
        store.add_document(fields("a", 0)).unwrap();
        assert!(store.open_reader().get(&DocId::from("a")).is_none());
        assert!(store.refresh().unwrap());
        assert!(store.open_reader().get(&DocId::from("a")).is_some());
    }

    #[test]
    fn refresh_with_nothing_buffered_is_a_no_op() {
        let store = InMemorySegmentStore::new();
        assert!(!store.refresh().unwrap());
    }

    #[test]
    fn commit_then_list_is_newest_first() {
        let store = InMemorySegmentStore::new();
        let meta = CommitMetadata {
            translog_uuid: crate::uuid_stub::Uuid(1),
            translog_generation: 0,
            local_checkpoint: None,
            max_seq_no: None,
            history_uuid: crate::uuid_stub::Uuid(2),
            min_retained_seq_no: None,
        };
        let c0 = store.commit(meta.clone()).unwrap();
        let c1 = store.commit(meta).unwrap();
        let commits = store.list_commits();
        assert_eq!(commits[0].id, c1);
        assert_eq!(commits[1].id, c0);
    }

    #[test]
    fn snapshot_pinned_commit_cannot_be_deleted() {
        let store = InMemorySegmentStore::new();
        let meta = CommitMetadata {
            translog_uuid: crate::uuid_stub::Uuid(1),
            translog_generation: 0,
            local_checkpoint: None,
            max_seq_no: None,
            history_uuid: crate::uuid_stub::Uuid(2),
            min_retained_seq_no: None,
        };
        let id = store.commit(meta).unwrap();
        let handle = store.snapshot_commit(id).unwrap();
        assert!(store.delete_commit(id).is_err());
        store.release_snapshot(handle);
        assert!(store.delete_commit(id).is_ok());
    }
}

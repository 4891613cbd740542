//! LiveVersionMap (SPEC_FULL §4.2): a two-generation `docId -> VersionValue`
//! map, plus an independent tombstone map with TTL-based pruning.
//!
//! `current`/`old` use `imbl::HashMap` rather than a plain `std::HashMap`
//! behind a lock: `beforeRefresh()` needs to atomically hand the old
//! generation off to readers that may still be iterating it, and an
//! immutable, structurally-shared map makes that a pointer swap instead of a
//! bulk copy — the same trick the source's `SnapshotManager` uses to keep
//! multiple versions of a snapshot alive cheaply.

use std::sync::Arc;

use common::types::{
    DocId,
    SeqNo,
    Term,
    Version,
};
use parking_lot::RwLock;

/// A recently written document's version, as visible to subsequent writers
/// before a refresh makes it visible through the searcher.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionValue {
    pub seq_no: SeqNo,
    pub term: Term,
    pub version: Version,
    pub kind: VersionKind,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VersionKind {
    Live,
    /// A delete tombstone. `expire_at_millis` is when this entry becomes
    /// eligible for pruning, once the document's seqNo is also at or below
    /// the global checkpoint (see [`LiveVersionMap::prune_tombstones`]).
    Tombstone { expire_at_millis: i64 },
}

impl VersionValue {
    pub fn live(seq_no: SeqNo, term: Term, version: Version) -> Self {
        Self {
            seq_no,
            term,
            version,
            kind: VersionKind::Live,
        }
    }

    pub fn tombstone(seq_no: SeqNo, term: Term, version: Version, expire_at_millis: i64) -> Self {
        Self {
            seq_no,
            term,
            version,
            kind: VersionKind::Tombstone { expire_at_millis },
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.kind, VersionKind::Tombstone { .. })
    }
}

type Generation = imbl::HashMap<DocId, Arc<VersionValue>>;

struct Maps {
    current: Generation,
    old: Generation,
}

pub struct LiveVersionMap {
    maps: RwLock<Maps>,
    tombstones: RwLock<Generation>,
}

impl Default for LiveVersionMap {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveVersionMap {
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(Maps {
                current: Generation::new(),
                old: Generation::new(),
            }),
            tombstones: RwLock::new(Generation::new()),
        }
    }

    /// Newest known value for `doc_id`, checked in `current`, `old`, then
    /// `tombstones` priority order. `None` means the caller must fall back
    /// to a pointwise lookup against the underlying searcher.
    pub fn lookup_under_lock(&self, doc_id: &DocId) -> Option<Arc<VersionValue>> {
        let maps = self.maps.read();
        if let Some(v) = maps.current.get(doc_id) {
            return Some(v.clone());
        }
        if let Some(v) = maps.old.get(doc_id) {
            return Some(v.clone());
        }
        drop(maps);
        self.tombstones.read().get(doc_id).cloned()
    }

    /// Publish a live write. Clears any tombstone for the same docId so a
    /// resurrect is visible immediately.
    pub fn put_under_lock(&self, doc_id: DocId, value: VersionValue) {
        debug_assert!(!value.is_tombstone());
        self.tombstones.write().remove(&doc_id);
        self.maps.write().current.insert(doc_id, Arc::new(value));
    }

    /// Publish a delete. Removes the docId from both live generations so a
    /// concurrent indexer doesn't read a value this delete has superseded.
    pub fn put_tombstone_under_lock(&self, doc_id: DocId, value: VersionValue) {
        debug_assert!(value.is_tombstone());
        let mut maps = self.maps.write();
        maps.current.remove(&doc_id);
        maps.old.remove(&doc_id);
        drop(maps);
        self.tombstones.write().insert(doc_id, Arc::new(value));
    }

    /// Must be called before the underlying searcher begins its refresh.
    /// Moves `current` to `old` and starts a fresh `current`; any write that
    /// raced this call lands in the new `current` and is preserved, any
    /// write already recorded is preserved in `old` until `after_refresh`.
    pub fn before_refresh(&self) {
        let mut maps = self.maps.write();
        maps.old = std::mem::replace(&mut maps.current, Generation::new());
    }

    /// Must be called after the underlying searcher's refresh completes
    /// (successfully or not — a no-op refresh still leaves the new readers
    /// observing the union of `current` and `old`, so clearing `old` is
    /// always safe once this is called).
    pub fn after_refresh(&self, _did_refresh: bool) {
        self.maps.write().old = Generation::new();
    }

    /// Drop tombstones old enough (`expire_at_millis < now_millis`) whose
    /// seqNo is also covered by the global checkpoint — both conditions are
    /// required so a tombstone isn't reclaimed while a replica might still
    /// be catching up to the delete.
    pub fn prune_tombstones(&self, now_millis: i64, global_checkpoint: Option<SeqNo>) -> usize {
        let mut tombstones = self.tombstones.write();
        let before = tombstones.len();
        tombstones.retain(|_, v| {
            let VersionKind::Tombstone { expire_at_millis } = v.kind else {
                return true;
            };
            let covered_by_gcp = global_checkpoint.is_some_and(|gcp| v.seq_no <= gcp);
            !(expire_at_millis < now_millis && covered_by_gcp)
        });
        before - tombstones.len()
    }

    pub fn current_len(&self) -> usize {
        self.maps.read().current.len()
    }

    pub fn tombstone_len(&self) -> usize {
        self.tombstones.read().len()
    }
}

#[cfg(test)]
mod tests {
    use common::types::arb_doc_id;
    use proptest::prelude::*;

    use super::*;

    fn doc(id: &str) -> DocId {
        DocId::from(id)
    }

    #[test]
    fn put_then_lookup_round_trips() {
        let map = LiveVersionMap::new();
        map.put_under_lock(doc("a"), VersionValue::live(SeqNo(0), Term(1), Version(1)));
        let found = map.lookup_under_lock(&doc("a")).unwrap();
        assert_eq!(found.seq_no, SeqNo(0));
        assert_eq!(found.version, Version(1));
        assert!(!found.is_tombstone());
    }

    #[test]
    fn tombstone_hides_live_entry_and_survives_refresh() {
        let map = LiveVersionMap::new();
        map.put_under_lock(doc("a"), VersionValue::live(SeqNo(0), Term(1), Version(1)));
        map.put_tombstone_under_lock(doc("a"), VersionValue::tombstone(SeqNo(1), Term(1), Version(2), 1_000));
        let found = map.lookup_under_lock(&doc("a")).unwrap();
        assert!(found.is_tombstone());

        // A tombstone must remain visible across a refresh cycle.
        map.before_refresh();
        map.after_refresh(true);
        let found = map.lookup_under_lock(&doc("a")).unwrap();
        assert!(found.is_tombstone());
    }

    #[test]
    fn resurrect_after_delete_clears_tombstone() {
        let map = LiveVersionMap::new();
        map.put_tombstone_under_lock(doc("a"), VersionValue::tombstone(SeqNo(0), Term(1), Version(1), 1_000));
        map.put_under_lock(doc("a"), VersionValue::live(SeqNo(1), Term(1), Version(2)));
        let found = map.lookup_under_lock(&doc("a")).unwrap();
        assert!(!found.is_tombstone());
        assert_eq!(map.tombstone_len(), 0);
    }

    #[test]
    fn before_refresh_preserves_entries_in_old() {
        let map = LiveVersionMap::new();
        map.put_under_lock(doc("a"), VersionValue::live(SeqNo(0), Term(1), Version(1)));
        map.before_refresh();
        // Still visible via `old` even though `current` was swapped out.
        assert!(map.lookup_under_lock(&doc("a")).is_some());
        assert_eq!(map.current_len(), 0);
        map.after_refresh(true);
        assert!(map.lookup_under_lock(&doc("a")).is_none());
    }

    #[test]
    fn write_during_refresh_lands_in_new_current() {
        let map = LiveVersionMap::new();
        map.put_under_lock(doc("a"), VersionValue::live(SeqNo(0), Term(1), Version(1)));
        map.before_refresh();
        map.put_under_lock(doc("b"), VersionValue::live(SeqNo(1), Term(1), Version(1)));
        assert!(map.lookup_under_lock(&doc("a")).is_some());
        assert!(map.lookup_under_lock(&doc("b")).is_some());
        map.after_refresh(true);
        assert!(map.lookup_under_lock(&doc("a")).is_none());
        assert!(map.lookup_under_lock(&doc("b")).is_some());
    }

    #[test]
    fn prune_requires_both_age_and_global_checkpoint() {
        let map = LiveVersionMap::new();
        map.put_tombstone_under_lock(doc("a"), VersionValue::tombstone(SeqNo(5), Term(1), Version(1), 100));
        // Old enough, but seqNo not yet covered by the global checkpoint.
        assert_eq!(map.prune_tombstones(200, Some(SeqNo(3))), 0);
        assert_eq!(map.tombstone_len(), 1);
        // Covered by the checkpoint, but not old enough yet.
        assert_eq!(map.prune_tombstones(50, Some(SeqNo(10))), 0);
        assert_eq!(map.tombstone_len(), 1);
        // Both conditions satisfied.
        assert_eq!(map.prune_tombstones(200, Some(SeqNo(10))), 1);
        assert_eq!(map.tombstone_len(), 0);
    }

    #[test]
    fn prune_without_global_checkpoint_never_reclaims() {
        let map = LiveVersionMap::new();
        map.put_tombstone_under_lock(doc("a"), VersionValue::tombstone(SeqNo(5), Term(1), Version(1), 1));
        assert_eq!(map.prune_tombstones(i64::MAX, None), 0);
    }

    proptest! {
        #[test]
        fn lookup_always_reflects_most_recent_publish(
            id in arb_doc_id(),
            n in 1usize..20,
        ) {
            let map = LiveVersionMap::new();
            for i in 0..n {
                map.put_under_lock(id.clone(), VersionValue::live(SeqNo(i as u64), Term(1), Version((i + 1) as i64)));
            }
            let found = map.lookup_under_lock(&id).unwrap();
            prop_assert_eq!(found.seq_no, SeqNo((n - 1) as u64));
        }
    }
}

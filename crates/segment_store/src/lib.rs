//! The low-level segment store collaborator interface (SPEC_FULL §6): the
//! engine's view of an external full-text index. Everything below this
//! trait — merges, analysis, query execution — is out of scope (SPEC_FULL
//! §1); the engine only needs to add/update/delete documents by `_id`, read
//! a durable snapshot back, and bind commits to translog generations.
//!
//! No implementation of a real segment store ships here: SPEC_FULL §1 calls
//! it "assumed"; only the reference in-memory adapter used to drive the
//! engine in tests lives in this crate (see [`memory`], behind the
//! `testing` feature).

#[cfg(any(test, feature = "testing"))]
pub mod memory;

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use common::types::{
    DocId,
    SeqNo,
    Term,
    Version,
};

/// The stored fields the engine attaches to every document so a pointwise
/// lookup on `_id` can recover enough metadata to resume the write path
/// (SPEC_FULL §4.5 step 2, §6 "stored fields").
#[derive(Clone, Debug)]
pub struct StoredFields {
    pub doc_id: DocId,
    pub seq_no: SeqNo,
    pub primary_term: Term,
    pub version: Version,
    pub source: Arc<[u8]>,
    /// Set on the tombstone document written by a soft delete.
    pub tombstone: bool,
}

pub type CommitId = u64;

/// Commit user metadata (SPEC_FULL §3 "Commit", §6 "Commit user-data keys").
/// Binds a segment-store commit to the translog tail a recovery must replay
/// from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommitMetadata {
    pub translog_uuid: uuid_stub::Uuid,
    /// Minimum translog generation a recovery must replay from.
    pub translog_generation: u64,
    pub local_checkpoint: Option<SeqNo>,
    pub max_seq_no: Option<SeqNo>,
    pub history_uuid: uuid_stub::Uuid,
    pub min_retained_seq_no: Option<SeqNo>,
}

/// A minimal, dependency-free stand-in for a 128-bit UUID: the translog and
/// history identifiers only need equality and a stable string encoding, not
/// the full `uuid` crate surface.
pub mod uuid_stub {
    use std::fmt;

    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
    pub struct Uuid(pub u128);

    impl Uuid {
        pub fn from_rng(rng: &mut dyn rand::RngCore) -> Self {
            Self(((rng.next_u64() as u128) << 64) | rng.next_u64() as u128)
        }
    }

    impl fmt::Display for Uuid {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:032x}", self.0)
        }
    }

    impl std::str::FromStr for Uuid {
        type Err = std::num::ParseIntError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            u128::from_str_radix(s, 16).map(Uuid)
        }
    }
}

impl CommitMetadata {
    pub fn to_user_data(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("translog_uuid".to_string(), self.translog_uuid.to_string());
        map.insert("translog_generation".to_string(), self.translog_generation.to_string());
        if let Some(lcp) = self.local_checkpoint {
            map.insert("local_checkpoint".to_string(), lcp.0.to_string());
        }
        if let Some(max) = self.max_seq_no {
            map.insert("max_seq_no".to_string(), max.0.to_string());
        }
        map.insert("history_uuid".to_string(), self.history_uuid.to_string());
        if let Some(min) = self.min_retained_seq_no {
            map.insert("min_retained_seq_no".to_string(), min.0.to_string());
        }
        map
    }

    pub fn from_user_data(map: &BTreeMap<String, String>) -> anyhow::Result<Self> {
        use std::str::FromStr;
        let get = |k: &str| map.get(k).ok_or_else(|| anyhow::anyhow!("missing commit user-data key {k}"));
        Ok(Self {
            translog_uuid: uuid_stub::Uuid::from_str(get("translog_uuid")?)?,
            translog_generation: get("translog_generation")?.parse()?,
            local_checkpoint: map.get("local_checkpoint").map(|s| s.parse().map(SeqNo)).transpose()?,
            max_seq_no: map.get("max_seq_no").map(|s| s.parse().map(SeqNo)).transpose()?,
            history_uuid: uuid_stub::Uuid::from_str(get("history_uuid")?)?,
            min_retained_seq_no: map
                .get("min_retained_seq_no")
                .map(|s| s.parse().map(SeqNo))
                .transpose()?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct CommitInfo {
    pub id: CommitId,
    pub metadata: CommitMetadata,
}

/// A point-in-time reader over the store's committed + refreshed state.
pub trait SegmentReader: Send + Sync {
    /// Pointwise lookup by `_id`, used by the engine's write path (to seed
    /// the version map on a miss) and by non-realtime `get()`.
    fn get(&self, doc_id: &DocId) -> Option<StoredFields>;

    fn doc_count(&self) -> usize;
}

/// A token proving a commit is pinned against physical deletion, returned
/// by [`SegmentStore::snapshot_commit`] (SPEC_FULL §4.4 "Snapshot hook",
/// §6).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SnapshotHandle(pub CommitId);

/// The engine's adapter over an external full-text segment store (SPEC_FULL
/// §6). Implementations must be thread-safe; the engine serializes calls
/// that need it (refresh/flush mutexes) above this trait, not within it.
pub trait SegmentStore: Send + Sync {
    fn add_document(&self, fields: StoredFields) -> anyhow::Result<()>;

    /// Logically deletes the prior version of `doc_id` (if any) and appends
    /// `fields` as the new live version, in one atomic store operation.
    fn soft_update_document(&self, doc_id: &DocId, fields: StoredFields) -> anyhow::Result<()>;

    fn delete_documents(&self, doc_id: &DocId) -> anyhow::Result<()>;

    /// Reopen readers over buffered segments. Returns whether a new reader
    /// was actually produced (a refresh with nothing buffered may be a
    /// no-op).
    fn refresh(&self) -> anyhow::Result<bool>;

    fn open_reader(&self) -> Arc<dyn SegmentReader>;

    /// Cut a durable commit carrying `metadata` as user data.
    fn commit(&self, metadata: CommitMetadata) -> anyhow::Result<CommitId>;

    /// Newest-first.
    fn list_commits(&self) -> Vec<CommitInfo>;

    fn delete_commit(&self, id: CommitId) -> anyhow::Result<()>;

    /// Pin `id` against [`SegmentStore::delete_commit`] until released.
    fn snapshot_commit(&self, id: CommitId) -> anyhow::Result<SnapshotHandle>;

    fn release_snapshot(&self, handle: SnapshotHandle);
}

//! Core value types shared by every component of the indexing core:
//! sequence numbers, primary terms, document versions, and the tagged
//! [`Operation`] record that flows from the engine's write path down into
//! the translog.

use std::sync::Arc;

#[cfg(any(test, feature = "testing"))]
use proptest::prelude::*;

/// Monotonically increasing identifier assigned by the primary on accept.
/// `u64::MAX` is reserved as a sentinel for "unassigned" (see
/// [`SeqNo::UNASSIGNED`]), mirroring the source's use of `-2`/`-1` sentinels
/// for seqNo but adapted to an unsigned domain.
#[derive(Clone, Copy, Debug, derive_more::Display, Ord, PartialOrd, Eq, PartialEq, Hash)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub struct SeqNo(pub u64);

impl SeqNo {
    pub const UNASSIGNED: SeqNo = SeqNo(u64::MAX);
    pub const ZERO: SeqNo = SeqNo(0);

    pub fn next(self) -> SeqNo {
        SeqNo(self.0 + 1)
    }

    pub fn is_assigned(self) -> bool {
        self != Self::UNASSIGNED
    }
}

/// Monotonically non-decreasing identifier of the current primary. Every
/// operation is stamped with the term of the primary that originated it.
#[derive(Clone, Copy, Debug, derive_more::Display, Ord, PartialOrd, Eq, PartialEq, Hash)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }
}

/// The document-level version counter. Starts at 1 on create; internal
/// writes increment it, external writes require the caller to supply a
/// strictly greater value.
#[derive(Clone, Copy, Debug, derive_more::Display, Ord, PartialOrd, Eq, PartialEq, Hash)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub struct Version(pub i64);

impl Version {
    pub const INITIAL: Version = Version(1);

    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }
}

/// Opaque byte sequence uniquely identifying a document within a shard. Kept
/// as `Arc<[u8]>` rather than `Vec<u8>` so the version map, translog, and
/// striped-lock key can all share one allocation per write.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DocId(pub Arc<[u8]>);

impl DocId {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(bytes.into().into_boxed_slice()))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for DocId {
    fn from(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }
}

impl From<String> for DocId {
    fn from(s: String) -> Self {
        Self::from_bytes(s.into_bytes())
    }
}

impl std::fmt::Display for DocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{s}"),
            Err(_) => write!(f, "{:02x?}", &self.0),
        }
    }
}

/// Opaque payload owned by the operation until the caller acknowledges the
/// write. Reference-counted so a real-time `get()` can borrow the bytes out
/// of the translog without racing the translog's own eviction.
pub type Source = Arc<[u8]>;

/// Optimistic-concurrency policy selected by the caller for a write.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub enum VersionType {
    /// Always accept; the engine assigns `version = existing.version + 1`.
    Internal,
    /// Accept iff `requested.version > existing.version`.
    External,
    /// Accept iff `requested.version >= existing.version`.
    ExternalGte,
}

/// A compare-and-set precondition expressed in terms of the last seqNo/term
/// observed by the caller, used instead of (or alongside) [`VersionType`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SeqNoTermCas {
    pub if_seq_no: SeqNo,
    pub if_term: Term,
}

/// Where a write originated. Replicas must use the seqNo/term stamped by the
/// primary rather than assigning their own.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteOrigin {
    Primary,
    Replica,
}

/// A request to index (create or update) a document, as received by the
/// engine before seqNo/version assignment.
#[derive(Clone, Debug)]
pub struct IndexRequest {
    pub doc_id: DocId,
    pub source: Source,
    pub routing: Option<Arc<[u8]>>,
    pub version_type: VersionType,
    pub requested_version: Option<Version>,
    pub cas: Option<SeqNoTermCas>,
    /// Present for replica/recovery writes, where the seqNo/term were
    /// already assigned by the primary.
    pub stamped: Option<(SeqNo, Term)>,
    pub auto_generated_id_timestamp_millis: Option<i64>,
}

/// A request to delete a document, mirroring [`IndexRequest`].
#[derive(Clone, Debug)]
pub struct DeleteRequest {
    pub doc_id: DocId,
    pub version_type: VersionType,
    pub requested_version: Option<Version>,
    pub cas: Option<SeqNoTermCas>,
    pub stamped: Option<(SeqNo, Term)>,
}

/// The durable, tagged record written to the translog and replayed on
/// recovery. Unlike [`IndexRequest`]/[`DeleteRequest`], every field here has
/// already been assigned.
#[derive(Clone, Debug)]
pub enum Operation {
    Index {
        doc_id: DocId,
        source: Source,
        routing: Option<Arc<[u8]>>,
        seq_no: SeqNo,
        term: Term,
        version: Version,
        version_type: VersionType,
        auto_generated_id_timestamp_millis: Option<i64>,
    },
    Delete {
        doc_id: DocId,
        seq_no: SeqNo,
        term: Term,
        version: Version,
        version_type: VersionType,
    },
    NoOp {
        seq_no: SeqNo,
        term: Term,
        reason: Arc<str>,
    },
}

impl Operation {
    pub fn seq_no(&self) -> SeqNo {
        match self {
            Operation::Index { seq_no, .. }
            | Operation::Delete { seq_no, .. }
            | Operation::NoOp { seq_no, .. } => *seq_no,
        }
    }

    pub fn term(&self) -> Term {
        match self {
            Operation::Index { term, .. } | Operation::Delete { term, .. } | Operation::NoOp { term, .. } => {
                *term
            },
        }
    }

    pub fn doc_id(&self) -> Option<&DocId> {
        match self {
            Operation::Index { doc_id, .. } | Operation::Delete { doc_id, .. } => Some(doc_id),
            Operation::NoOp { .. } => None,
        }
    }
}

/// A pointer into the translog returned by `append()`: which generation, at
/// what byte offset, and how many bytes the entry occupies. `sync(location)`
/// guarantees durability of every append with a location `<= location`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Location {
    pub generation: u64,
    pub offset: u64,
    pub size: u64,
}

impl Location {
    pub fn end_offset(&self) -> u64 {
        self.offset + self.size
    }
}

/// Outcome of a successful write through the engine's write path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IndexResult {
    pub seq_no: SeqNo,
    pub term: Term,
    pub version: Version,
    /// True if this write created the document (as opposed to updating an
    /// existing one).
    pub created: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeleteResult {
    pub seq_no: SeqNo,
    pub term: Term,
    pub version: Version,
    pub found: bool,
}

/// Per-request durability policy, selected by the engine (or caller) for an
/// individual write.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Durability {
    /// Block the caller until the translog generation is fsynced.
    Request,
    /// Durability is provided by a background task on an interval.
    Async,
}

#[cfg(any(test, feature = "testing"))]
pub fn arb_doc_id() -> impl Strategy<Value = DocId> {
    proptest::collection::vec(any::<u8>(), 1..16).prop_map(DocId::from_bytes)
}

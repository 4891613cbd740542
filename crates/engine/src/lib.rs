//! The per-shard indexing and durability core (SPEC_FULL §4.5 "Engine"):
//! the orchestrator that ties [`seqno::SeqNoService`],
//! [`version_map::LiveVersionMap`], [`translog::Translog`],
//! [`deletion_policy::DeletionPolicy`], and an injected
//! [`segment_store::SegmentStore`] into a single write/read/refresh/flush/
//! recovery lifecycle for one shard copy.

mod background;
mod capability;
mod instrumentation;
mod recovery_driver;

use std::{
    path::Path,
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    time::{
        Duration,
        Instant,
    },
};

pub use capability::{
    NoOpEngine,
    ShardEngine,
    ShardEngineHandle,
};
use common::{
    config::EngineConfig,
    runtime::{
        Runtime,
        SpawnHandle,
    },
    sync::StripedLock,
    types::{
        DeleteRequest,
        DeleteResult,
        DocId,
        IndexRequest,
        IndexResult,
        Operation,
        SeqNo,
        SeqNoTermCas,
        Source,
        Term,
        Version,
        VersionType,
    },
};
use deletion_policy::DeletionPolicy;
use errors::{
    ErrorMetadata,
    FatalEngineError,
};
use metrics::StatusTimer;
use parking_lot::{
    Mutex,
    RwLock,
};
pub use recovery_driver::{
    Phase1Result,
    Phase2Result,
    RecoveryDriver,
};
use segment_store::{
    uuid_stub::Uuid,
    CommitId,
    CommitMetadata,
    SegmentReader,
    SegmentStore,
    StoredFields,
};
pub use seqno::ShardRole;
use seqno::SeqNoService;
use translog::{
    RecoveredOperation,
    Translog,
};
use version_map::{
    LiveVersionMap,
    VersionValue,
};

/// Outcome of a real-time or non-real-time `get()` (SPEC_FULL §4.5 "Get").
#[derive(Clone, Debug)]
pub struct GetResult {
    pub source: Source,
    pub seq_no: SeqNo,
    pub version: Version,
}

/// Outcome of [`Engine::flush`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushOutcome {
    /// `force` was false and there was nothing uncommitted to flush.
    NoOp,
    Flushed { commit_id: CommitId },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum EngineLifecycle {
    /// Replaying recovered operations through the write path; not yet
    /// handed out to callers, but internal writes are permitted.
    Recovering,
    Writable,
    Closing,
    Closed,
    Failed,
}

/// A document's most recently observed version, from either the
/// [`LiveVersionMap`] or a pointwise fallback lookup against the current
/// reader (SPEC_FULL §4.5 step 2).
struct ObservedVersion {
    seq_no: SeqNo,
    term: Term,
    version: Version,
    tombstone: bool,
}

/// One shard copy's indexing and durability core. Cheap to hold behind an
/// `Arc`; every method takes `&self` so concurrent writers to distinct
/// docIds proceed without contending on anything but the striped lock.
pub struct Engine<R: Runtime> {
    config: EngineConfig,
    seq_no_service: SeqNoService,
    version_map: LiveVersionMap,
    translog: Translog,
    store: Arc<dyn SegmentStore>,
    deletion_policy: DeletionPolicy,
    doc_lock: StripedLock<256>,
    refresh_mutex: Mutex<()>,
    flush_mutex: Mutex<()>,
    state: RwLock<EngineLifecycle>,
    last_failure: Mutex<Option<FatalEngineError>>,
    history_uuid: Uuid,
    dirty_since_flush: AtomicBool,
    in_flight_writes: AtomicUsize,
    runtime: R,
    reader: RwLock<Arc<dyn SegmentReader>>,
    background: Mutex<Vec<Box<dyn SpawnHandle>>>,
}

/// Tracks one write through [`Engine::close`]'s drain wait; decremented on
/// every exit path, including an early return or a `?`-propagated error.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<R: Runtime> Engine<R> {
    /// Start a brand-new shard copy with no prior history.
    pub fn create(dir: &Path, config: EngineConfig, role: ShardRole, term: Term, store: Arc<dyn SegmentStore>, runtime: R) -> anyhow::Result<Arc<Self>> {
        let config = config.validated()?;
        let mut rng = runtime.rng();
        let translog_uuid = Uuid::from_rng(&mut *rng);
        let history_uuid = Uuid::from_rng(&mut *rng);
        drop(rng);
        let translog = Translog::create(dir, config.translog, translog_uuid, None)?;
        let reader = store.open_reader();
        let engine = Arc::new(Self {
            config,
            seq_no_service: SeqNoService::new(role, term),
            version_map: LiveVersionMap::new(),
            translog,
            store,
            deletion_policy: DeletionPolicy::new(),
            doc_lock: StripedLock::new(),
            refresh_mutex: Mutex::new(()),
            flush_mutex: Mutex::new(()),
            state: RwLock::new(EngineLifecycle::Writable),
            last_failure: Mutex::new(None),
            history_uuid,
            dirty_since_flush: AtomicBool::new(false),
            in_flight_writes: AtomicUsize::new(0),
            runtime,
            reader: RwLock::new(reader),
            background: Mutex::new(Vec::new()),
        });
        background::start_background_tasks(&engine);
        Ok(engine)
    }

    /// Recover a shard copy from its newest durable commit plus whatever
    /// translog it left behind, replaying through the normal write path
    /// (SPEC_FULL §4.5 "Recovery"): a replayed op with a seqNo already
    /// covered by a doc's committed version is a no-op, which is what makes
    /// replay idempotent without a separate recovery code path.
    pub fn open(dir: &Path, config: EngineConfig, role: ShardRole, term: Term, store: Arc<dyn SegmentStore>, runtime: R) -> anyhow::Result<Arc<Self>> {
        let config = config.validated()?;
        let commits = store.list_commits();
        let (translog, recovered, history_uuid, persisted_checkpoint, max_seq_no_seen) = match commits.first() {
            Some(latest) => {
                let meta = latest.metadata.clone();
                let (translog, recovered) = Translog::open(dir, config.translog, meta.translog_uuid, meta.translog_generation, None)?;
                let max_seen = recovered
                    .iter()
                    .map(|r| r.operation.seq_no())
                    .chain(meta.max_seq_no)
                    .max();
                (translog, recovered, meta.history_uuid, meta.local_checkpoint, max_seen)
            },
            None => {
                let mut rng = runtime.rng();
                let translog_uuid = Uuid::from_rng(&mut *rng);
                let history_uuid = Uuid::from_rng(&mut *rng);
                drop(rng);
                let translog = Translog::create(dir, config.translog, translog_uuid, None)?;
                (translog, Vec::new(), history_uuid, None, None)
            },
        };
        let seq_no_service = SeqNoService::restore(role, term, persisted_checkpoint, max_seq_no_seen);
        let reader = store.open_reader();
        let engine = Arc::new(Self {
            config,
            seq_no_service,
            version_map: LiveVersionMap::new(),
            translog,
            store,
            deletion_policy: DeletionPolicy::new(),
            doc_lock: StripedLock::new(),
            refresh_mutex: Mutex::new(()),
            flush_mutex: Mutex::new(()),
            state: RwLock::new(EngineLifecycle::Recovering),
            last_failure: Mutex::new(None),
            history_uuid,
            dirty_since_flush: AtomicBool::new(false),
            in_flight_writes: AtomicUsize::new(0),
            runtime,
            reader: RwLock::new(reader),
            background: Mutex::new(Vec::new()),
        });
        engine.replay(recovered)?;
        *engine.state.write() = EngineLifecycle::Writable;
        background::start_background_tasks(&engine);
        Ok(engine)
    }

    fn replay(&self, ops: Vec<RecoveredOperation>) -> anyhow::Result<()> {
        for recovered in ops {
            if let Some(req) = operation_as_index_request(&recovered.operation) {
                self.index(req)?;
            } else if let Some(req) = operation_as_delete_request(&recovered.operation) {
                self.delete(req)?;
            } else if let Operation::NoOp { seq_no, .. } = recovered.operation {
                self.seq_no_service.mark_seq_no_as_processed(seq_no);
            }
        }
        Ok(())
    }

    fn ensure_writable(&self) -> anyhow::Result<()> {
        match *self.state.read() {
            EngineLifecycle::Writable | EngineLifecycle::Recovering => Ok(()),
            EngineLifecycle::Failed => Err(anyhow::anyhow!(ErrorMetadata::engine_closed("engine has failed and must be recovered"))),
            EngineLifecycle::Closing | EngineLifecycle::Closed => Err(anyhow::anyhow!(ErrorMetadata::engine_closed("engine is closed"))),
        }
    }

    fn ensure_readable(&self) -> anyhow::Result<()> {
        match *self.state.read() {
            EngineLifecycle::Failed | EngineLifecycle::Closing | EngineLifecycle::Closed => {
                Err(anyhow::anyhow!(ErrorMetadata::engine_closed("engine is not readable")))
            },
            EngineLifecycle::Writable | EngineLifecycle::Recovering => Ok(()),
        }
    }

    /// Transition to `Failed`, cache `err` behind [`Engine::last_failure`],
    /// and return it as the per-call error (SPEC_FULL §7 "Failure
    /// semantics"). Every subsequent call observes `EngineClosed` until the
    /// shard is recovered into a fresh `Engine`.
    fn fail(&self, err: FatalEngineError) -> anyhow::Error {
        *self.state.write() = EngineLifecycle::Failed;
        *self.last_failure.lock() = Some(err.clone());
        instrumentation::FATAL_FAILURES_TOTAL.inc();
        tracing::error!(error = %err, "engine transitioned to Failed");
        anyhow::Error::from(err)
    }

    fn observe_under_lock(&self, doc_id: &DocId) -> Option<ObservedVersion> {
        if let Some(v) = self.version_map.lookup_under_lock(doc_id) {
            return Some(ObservedVersion {
                seq_no: v.seq_no,
                term: v.term,
                version: v.version,
                tombstone: v.is_tombstone(),
            });
        }
        self.reader.read().get(doc_id).map(|fields| ObservedVersion {
            seq_no: fields.seq_no,
            term: fields.primary_term,
            version: fields.version,
            tombstone: fields.tombstone,
        })
    }

    /// A replayed/replica write is a duplicate, and so a no-op, if either:
    /// the doc already carries an equal-or-newer `(seqNo, term)` (this holds
    /// independent of the local checkpoint, which is what keeps out-of-order
    /// replica retries idempotent even before the checkpoint catches up to
    /// them — SPEC_FULL §8 "Idempotence"); or the incoming seqNo is already
    /// covered by the local checkpoint, meaning it was durably applied at
    /// some point even if the version map no longer shows it (e.g. a later
    /// write superseded the doc entry). Applying either again would be
    /// incorrect (it could resurrect a value a later write already
    /// superseded), so both are treated as no-ops (SPEC_FULL §4.5
    /// "Write path").
    fn is_stale_replay(&self, existing: Option<&ObservedVersion>, seq_no: SeqNo, term: Term) -> bool {
        if existing.is_some_and(|e| (e.seq_no, e.term) >= (seq_no, term)) {
            return true;
        }
        self.seq_no_service.local_checkpoint().is_some_and(|local_checkpoint| seq_no <= local_checkpoint)
    }

    fn resolve_version(existing: Option<&ObservedVersion>, version_type: VersionType, requested: Option<Version>) -> anyhow::Result<Version> {
        let existing_version = existing.filter(|e| !e.tombstone).map(|e| e.version);
        match version_type {
            VersionType::Internal => Ok(existing_version.map_or(Version::INITIAL, Version::next)),
            VersionType::External => {
                let requested = requested
                    .ok_or_else(|| anyhow::anyhow!(ErrorMetadata::mapping_or_parse("VersionType::External requires an explicit version")))?;
                if let Some(existing_version) = existing_version {
                    if requested <= existing_version {
                        instrumentation::VERSION_CONFLICTS_TOTAL.inc();
                        anyhow::bail!(ErrorMetadata::version_conflict(format!(
                            "version {requested} is not strictly greater than current version {existing_version}"
                        )));
                    }
                }
                Ok(requested)
            },
            VersionType::ExternalGte => {
                let requested = requested
                    .ok_or_else(|| anyhow::anyhow!(ErrorMetadata::mapping_or_parse("VersionType::ExternalGte requires an explicit version")))?;
                if let Some(existing_version) = existing_version {
                    if requested < existing_version {
                        instrumentation::VERSION_CONFLICTS_TOTAL.inc();
                        anyhow::bail!(ErrorMetadata::version_conflict(format!(
                            "version {requested} is less than current version {existing_version}"
                        )));
                    }
                }
                Ok(requested)
            },
        }
    }

    fn check_cas(existing: Option<&ObservedVersion>, cas: Option<SeqNoTermCas>) -> anyhow::Result<()> {
        let Some(cas) = cas else {
            return Ok(());
        };
        let satisfied = existing
            .filter(|e| !e.tombstone)
            .is_some_and(|e| e.seq_no == cas.if_seq_no && e.term == cas.if_term);
        if !satisfied {
            instrumentation::VERSION_CONFLICTS_TOTAL.inc();
            anyhow::bail!(ErrorMetadata::version_conflict(format!(
                "compare-and-set failed: expected seqNo {} term {}",
                cas.if_seq_no, cas.if_term
            )));
        }
        Ok(())
    }

    /// Index (create or update) one document (SPEC_FULL §4.5 "Write path").
    pub fn index(&self, req: IndexRequest) -> anyhow::Result<IndexResult> {
        let _timer = StatusTimer::new(&instrumentation::INDEX_SECONDS);
        self.ensure_writable()?;
        let _in_flight = InFlightGuard::enter(&self.in_flight_writes);
        let _doc_guard = self.doc_lock.lock(&req.doc_id);
        let existing = self.observe_under_lock(&req.doc_id);
        if let Some((seq_no, term)) = req.stamped {
            if self.is_stale_replay(existing.as_ref(), seq_no, term) {
                instrumentation::STALE_REPLAYS_TOTAL.inc();
                let version = existing.map_or(Version::INITIAL, |e| e.version);
                return Ok(IndexResult {
                    seq_no,
                    term,
                    version,
                    created: false,
                });
            }
        }
        Self::check_cas(existing.as_ref(), req.cas)?;
        let version = Self::resolve_version(existing.as_ref(), req.version_type, req.requested_version)?;
        let created = existing.as_ref().map_or(true, |e| e.tombstone);

        // Only allocated once the version/CAS checks have passed: a primary
        // write that bails here never burns a seqNo, so the local checkpoint
        // keeps advancing contiguously (SPEC_FULL §4.5 step order).
        let (seq_no, term) = match req.stamped {
            Some(stamped) => stamped,
            None => {
                let term = self.seq_no_service.current_term();
                (self.seq_no_service.generate(term)?, term)
            },
        };

        self.version_map.put_under_lock(req.doc_id.clone(), VersionValue::live(seq_no, term, version));
        let fields = StoredFields {
            doc_id: req.doc_id.clone(),
            seq_no,
            primary_term: term,
            version,
            source: req.source.clone(),
            tombstone: false,
        };
        let store_result = if created {
            self.store.add_document(fields)
        } else {
            self.store.soft_update_document(&req.doc_id, fields)
        };
        store_result.map_err(|e| {
            self.fail(FatalEngineError::IoError {
                during: "segment store write",
                detail: e.to_string(),
            })
        })?;

        let op = Operation::Index {
            doc_id: req.doc_id.clone(),
            source: req.source,
            routing: req.routing,
            seq_no,
            term,
            version,
            version_type: req.version_type,
            auto_generated_id_timestamp_millis: req.auto_generated_id_timestamp_millis,
        };
        let location = self.translog.append(&op).map_err(|e| {
            self.fail(FatalEngineError::IoError {
                during: "translog append",
                detail: e.to_string(),
            })
        })?;
        self.translog.maybe_sync(location, self.config.translog.durability).map_err(|e| {
            self.fail(FatalEngineError::IoError {
                during: "translog sync",
                detail: e.to_string(),
            })
        })?;
        self.dirty_since_flush.store(true, Ordering::Release);
        self.seq_no_service.mark_seq_no_as_processed(seq_no);
        Ok(IndexResult {
            seq_no,
            term,
            version,
            created,
        })
    }

    /// Delete one document (SPEC_FULL §4.5 "Write path"): a tombstone is
    /// published immediately so the version map reflects the delete before
    /// the store's own tombstone write lands, and the tombstone's
    /// `expire_at_millis` is computed from `config.version_map`.
    pub fn delete(&self, req: DeleteRequest) -> anyhow::Result<DeleteResult> {
        let _timer = StatusTimer::new(&instrumentation::DELETE_SECONDS);
        self.ensure_writable()?;
        let _in_flight = InFlightGuard::enter(&self.in_flight_writes);
        let _doc_guard = self.doc_lock.lock(&req.doc_id);
        let existing = self.observe_under_lock(&req.doc_id);
        if let Some((seq_no, term)) = req.stamped {
            if self.is_stale_replay(existing.as_ref(), seq_no, term) {
                instrumentation::STALE_REPLAYS_TOTAL.inc();
                let version = existing.map_or(Version::INITIAL, |e| e.version);
                return Ok(DeleteResult {
                    seq_no,
                    term,
                    version,
                    found: false,
                });
            }
        }
        Self::check_cas(existing.as_ref(), req.cas)?;
        let version = Self::resolve_version(existing.as_ref(), req.version_type, req.requested_version)?;
        let found = existing.as_ref().is_some_and(|e| !e.tombstone);

        // Allocated only after the version/CAS checks pass, same reasoning
        // as `index`: a rejected primary delete must not burn a seqNo.
        let (seq_no, term) = match req.stamped {
            Some(stamped) => stamped,
            None => {
                let term = self.seq_no_service.current_term();
                (self.seq_no_service.generate(term)?, term)
            },
        };

        let expire_at_millis =
            self.runtime.unix_timestamp_millis() + self.config.version_map.tombstone_gc_interval.as_millis() as i64;
        self.version_map
            .put_tombstone_under_lock(req.doc_id.clone(), VersionValue::tombstone(seq_no, term, version, expire_at_millis));
        self.store.delete_documents(&req.doc_id).map_err(|e| {
            self.fail(FatalEngineError::IoError {
                during: "segment store delete",
                detail: e.to_string(),
            })
        })?;

        let op = Operation::Delete {
            doc_id: req.doc_id.clone(),
            seq_no,
            term,
            version,
            version_type: req.version_type,
        };
        let location = self.translog.append(&op).map_err(|e| {
            self.fail(FatalEngineError::IoError {
                during: "translog append",
                detail: e.to_string(),
            })
        })?;
        self.translog.maybe_sync(location, self.config.translog.durability).map_err(|e| {
            self.fail(FatalEngineError::IoError {
                during: "translog sync",
                detail: e.to_string(),
            })
        })?;
        self.dirty_since_flush.store(true, Ordering::Release);
        self.seq_no_service.mark_seq_no_as_processed(seq_no);
        Ok(DeleteResult {
            seq_no,
            term,
            version,
            found,
        })
    }

    /// Read a document by `_id` (SPEC_FULL §4.5 "Get"). `realtime` consults
    /// the live version map and, if necessary, the translog, so a write is
    /// visible to a `get()` before the next refresh; a non-realtime `get`
    /// only sees what the last refresh published.
    pub fn get(&self, doc_id: &DocId, realtime: bool) -> anyhow::Result<Option<GetResult>> {
        self.ensure_readable()?;
        if realtime {
            let _doc_guard = self.doc_lock.lock(doc_id);
            if let Some(v) = self.version_map.lookup_under_lock(doc_id) {
                if v.is_tombstone() {
                    return Ok(None);
                }
                if let Some(fields) = self.reader.read().get(doc_id) {
                    if fields.seq_no == v.seq_no && !fields.tombstone {
                        return Ok(Some(GetResult {
                            source: fields.source,
                            seq_no: fields.seq_no,
                            version: fields.version,
                        }));
                    }
                }
                for op in self.translog.snapshot_from(v.seq_no)? {
                    if op.seq_no() != v.seq_no {
                        continue;
                    }
                    if let Operation::Index { source, .. } = op {
                        return Ok(Some(GetResult {
                            source,
                            seq_no: v.seq_no,
                            version: v.version,
                        }));
                    }
                }
                return Ok(None);
            }
        }
        Ok(self.reader.read().get(doc_id).filter(|f| !f.tombstone).map(|f| GetResult {
            source: f.source,
            seq_no: f.seq_no,
            version: f.version,
        }))
    }

    /// Publish buffered writes to the reader (SPEC_FULL §4.5 "Refresh").
    /// Serialized against concurrent refreshes by `refresh_mutex`; never
    /// blocks an in-flight write, since the version map's
    /// `before_refresh`/`after_refresh` pair is what makes a racing write
    /// safe to observe mid-refresh.
    pub fn refresh(&self) -> anyhow::Result<()> {
        let _timer = StatusTimer::new(&instrumentation::REFRESH_SECONDS);
        self.ensure_readable()?;
        let _refresh_guard = self.refresh_mutex.lock();
        self.version_map.before_refresh();
        let did_refresh = self.store.refresh().map_err(|e| {
            self.fail(FatalEngineError::IoError {
                during: "segment store refresh",
                detail: e.to_string(),
            })
        })?;
        self.version_map.after_refresh(did_refresh);
        if did_refresh {
            *self.reader.write() = self.store.open_reader();
        }
        let now_millis = self.runtime.unix_timestamp_millis();
        self.version_map.prune_tombstones(now_millis, self.seq_no_service.global_checkpoint());
        Ok(())
    }

    /// Seal the active translog generation into a durable commit, then
    /// coordinate retention (SPEC_FULL §4.5 "Flush", §4.4). Serialized
    /// against concurrent flushes by `flush_mutex`, independent of
    /// `refresh_mutex` so a flush never blocks behind a refresh.
    pub fn flush(&self, force: bool) -> anyhow::Result<FlushOutcome> {
        let _timer = StatusTimer::new(&instrumentation::FLUSH_SECONDS);
        self.ensure_writable()?;
        let _flush_guard = self.flush_mutex.lock();
        if !force && !self.dirty_since_flush.load(Ordering::Acquire) {
            return Ok(FlushOutcome::NoOp);
        }
        let new_generation = self.translog.roll_generation().map_err(|e| {
            self.fail(FatalEngineError::IoError {
                during: "translog roll",
                detail: e.to_string(),
            })
        })?;
        let metadata = CommitMetadata {
            translog_uuid: self.translog.uuid(),
            translog_generation: new_generation,
            local_checkpoint: self.seq_no_service.local_checkpoint(),
            max_seq_no: self.seq_no_service.max_seq_no(),
            history_uuid: self.history_uuid,
            min_retained_seq_no: None,
        };
        let commit_id = self
            .store
            .commit(metadata)
            .map_err(|e| self.fail(FatalEngineError::CommitFailure(e.to_string())))?;
        instrumentation::COMMITS_TOTAL.inc();
        self.dirty_since_flush.store(false, Ordering::Release);

        let commits = self.store.list_commits();
        let decision = self.deletion_policy.on_commit(&commits, self.seq_no_service.global_checkpoint(), &[]);
        for id in &decision.delete {
            if let Err(err) = self.store.delete_commit(*id) {
                tracing::warn!(commit = id, error = %err, "failed to delete superseded commit");
            }
        }
        self.translog.set_min_generation_for_recovery(decision.min_translog_generation_for_recovery);
        self.translog.trim_unreferenced_generations().map_err(|e| {
            self.fail(FatalEngineError::IoError {
                during: "translog trim",
                detail: e.to_string(),
            })
        })?;
        Ok(FlushOutcome::Flushed { commit_id })
    }

    /// Wait for in-flight writes to drain, signal background tasks to stop,
    /// and mark the engine unusable (SPEC_FULL §5 "Cancellation & timeouts"):
    /// a write already past `ensure_writable()` is allowed to finish, but
    /// `close()` won't wait longer than `config.close_drain_timeout` for it —
    /// past that, the engine is left `Failed` rather than `Closed`, since a
    /// write that outlives the drain window means something is stuck, not
    /// just slow.
    ///
    /// Background tasks are signalled but not joined here, since joining
    /// requires `.await` and every other `Engine` method is deliberately
    /// synchronous; a caller that needs a clean join can drain the handles
    /// itself via `common::runtime::shutdown_and_join`.
    pub fn close(&self) -> anyhow::Result<()> {
        *self.state.write() = EngineLifecycle::Closing;
        let deadline = Instant::now() + self.config.close_drain_timeout;
        while self.in_flight_writes.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        if self.in_flight_writes.load(Ordering::Acquire) > 0 {
            *self.state.write() = EngineLifecycle::Failed;
            anyhow::bail!(ErrorMetadata::engine_closed(
                "close timed out waiting for in-flight writes to drain"
            ));
        }
        for mut handle in self.background.lock().drain(..) {
            handle.shutdown();
        }
        *self.state.write() = EngineLifecycle::Closed;
        Ok(())
    }

    pub fn update_global_checkpoint(&self, gcp: SeqNo) {
        self.seq_no_service.update_global_checkpoint(gcp);
        self.translog.update_global_checkpoint(gcp);
    }

    pub fn local_checkpoint(&self) -> Option<SeqNo> {
        self.seq_no_service.local_checkpoint()
    }

    pub fn max_seq_no(&self) -> Option<SeqNo> {
        self.seq_no_service.max_seq_no()
    }

    pub fn global_checkpoint(&self) -> Option<SeqNo> {
        self.seq_no_service.global_checkpoint()
    }

    pub fn current_term(&self) -> Term {
        self.seq_no_service.current_term()
    }

    pub fn bump_term(&self, new_term: Term) -> anyhow::Result<()> {
        self.seq_no_service.bump_term(new_term)
    }

    pub fn last_failure(&self) -> Option<FatalEngineError> {
        self.last_failure.lock().clone()
    }

    pub fn is_failed(&self) -> bool {
        *self.state.read() == EngineLifecycle::Failed
    }
}

fn operation_as_index_request(op: &Operation) -> Option<IndexRequest> {
    let Operation::Index {
        doc_id,
        source,
        routing,
        seq_no,
        term,
        version,
        version_type,
        auto_generated_id_timestamp_millis,
    } = op
    else {
        return None;
    };
    Some(IndexRequest {
        doc_id: doc_id.clone(),
        source: source.clone(),
        routing: routing.clone(),
        version_type: *version_type,
        requested_version: Some(*version),
        cas: None,
        stamped: Some((*seq_no, *term)),
        auto_generated_id_timestamp_millis: *auto_generated_id_timestamp_millis,
    })
}

fn operation_as_delete_request(op: &Operation) -> Option<DeleteRequest> {
    let Operation::Delete {
        doc_id,
        seq_no,
        term,
        version,
        version_type,
    } = op
    else {
        return None;
    };
    Some(DeleteRequest {
        doc_id: doc_id.clone(),
        version_type: *version_type,
        requested_version: Some(*version),
        cas: None,
        stamped: Some((*seq_no, *term)),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc as StdArc;

    use common::{
        config::EngineConfig,
        runtime::testing::TestRuntime,
        types::{
            DeleteRequest,
            IndexRequest,
            SeqNoTermCas,
            VersionType,
        },
    };
    use errors::ErrorMetadataAnyhowExt;
    use segment_store::memory::InMemorySegmentStore;
    use tempfile::tempdir;

    use super::*;

    fn index_req(doc: &str, body: &str) -> IndexRequest {
        IndexRequest {
            doc_id: DocId::from(doc),
            source: StdArc::from(body.as_bytes()),
            routing: None,
            version_type: VersionType::Internal,
            requested_version: None,
            cas: None,
            stamped: None,
            auto_generated_id_timestamp_millis: None,
        }
    }

    async fn new_engine(dir: &Path, store: Arc<dyn SegmentStore>) -> Arc<Engine<TestRuntime>> {
        Engine::create(dir, EngineConfig::default(), ShardRole::Primary, Term(0), store, TestRuntime::new(1)).unwrap()
    }

    #[tokio::test]
    async fn index_then_realtime_and_refreshed_get_round_trip() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn SegmentStore> = Arc::new(InMemorySegmentStore::new());
        let engine = new_engine(dir.path(), store).await;

        let result = engine.index(index_req("doc-1", "{\"a\":1}")).unwrap();
        assert!(result.created);
        assert_eq!(result.seq_no, SeqNo(0));

        let found = engine.get(&DocId::from("doc-1"), true).unwrap().unwrap();
        assert_eq!(&*found.source, b"{\"a\":1}".as_slice());

        assert!(engine.get(&DocId::from("doc-1"), false).unwrap().is_none());
        engine.refresh().unwrap();
        let found = engine.get(&DocId::from("doc-1"), false).unwrap().unwrap();
        assert_eq!(&*found.source, b"{\"a\":1}".as_slice());
    }

    #[tokio::test]
    async fn external_version_conflict_is_rejected() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn SegmentStore> = Arc::new(InMemorySegmentStore::new());
        let engine = new_engine(dir.path(), store).await;

        let mut req = index_req("doc-1", "v1");
        req.version_type = VersionType::External;
        req.requested_version = Some(Version(5));
        engine.index(req).unwrap();

        let mut stale = index_req("doc-1", "v2");
        stale.version_type = VersionType::External;
        stale.requested_version = Some(Version(5));
        let err = engine.index(stale).unwrap_err();
        assert!(err.is_version_conflict());
    }

    #[tokio::test]
    async fn seq_no_term_cas_rejects_mismatched_precondition() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn SegmentStore> = Arc::new(InMemorySegmentStore::new());
        let engine = new_engine(dir.path(), store).await;
        let result = engine.index(index_req("doc-1", "v1")).unwrap();

        let mut ok_update = index_req("doc-1", "v2");
        ok_update.cas = Some(SeqNoTermCas {
            if_seq_no: result.seq_no,
            if_term: result.term,
        });
        assert!(engine.index(ok_update).is_ok());

        let mut stale_update = index_req("doc-1", "v3");
        stale_update.cas = Some(SeqNoTermCas {
            if_seq_no: result.seq_no,
            if_term: result.term,
        });
        let err = engine.index(stale_update).unwrap_err();
        assert!(err.is_version_conflict());
    }

    #[tokio::test]
    async fn delete_then_get_observes_tombstone_realtime_and_after_refresh() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn SegmentStore> = Arc::new(InMemorySegmentStore::new());
        let engine = new_engine(dir.path(), store).await;
        engine.index(index_req("doc-1", "v1")).unwrap();
        engine.refresh().unwrap();

        let deleted = engine
            .delete(DeleteRequest {
                doc_id: DocId::from("doc-1"),
                version_type: VersionType::Internal,
                requested_version: None,
                cas: None,
                stamped: None,
            })
            .unwrap();
        assert!(deleted.found);
        assert!(engine.get(&DocId::from("doc-1"), true).unwrap().is_none());
        engine.refresh().unwrap();
        assert!(engine.get(&DocId::from("doc-1"), false).unwrap().is_none());
    }

    #[tokio::test]
    async fn recovery_replays_writes_that_were_never_flushed() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn SegmentStore> = Arc::new(InMemorySegmentStore::new());
        {
            let engine = new_engine(dir.path(), store.clone()).await;
            engine.index(index_req("doc-1", "v1")).unwrap();
            engine.index(index_req("doc-2", "v2")).unwrap();
            // No flush/commit: simulates a crash with only Request-durability
            // translog fsyncs on disk.
        }

        let recovered = Engine::open(dir.path(), EngineConfig::default(), ShardRole::Primary, Term(0), store, TestRuntime::new(2)).unwrap();
        assert_eq!(recovered.get(&DocId::from("doc-1"), true).unwrap().unwrap().seq_no, SeqNo(0));
        assert_eq!(recovered.get(&DocId::from("doc-2"), true).unwrap().unwrap().seq_no, SeqNo(1));
    }

    #[tokio::test]
    async fn recovery_replay_of_an_already_committed_write_is_a_no_op() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn SegmentStore> = Arc::new(InMemorySegmentStore::new());
        {
            let engine = new_engine(dir.path(), store.clone()).await;
            engine.index(index_req("doc-1", "v1")).unwrap();
            engine.update_global_checkpoint(SeqNo(0));
            engine.flush(true).unwrap();
        }

        let recovered = Engine::open(dir.path(), EngineConfig::default(), ShardRole::Primary, Term(0), store, TestRuntime::new(3)).unwrap();
        // The committed doc is visible via the store fallback, and its
        // local checkpoint was restored from the commit, so recovery must
        // not reissue seqNo 0 or regress its version.
        assert_eq!(recovered.local_checkpoint(), Some(SeqNo(0)));
        let found = recovered.get(&DocId::from("doc-1"), true).unwrap().unwrap();
        assert_eq!(found.version, Version(1));
    }

    #[tokio::test]
    async fn replica_applies_stamped_writes_and_ignores_a_duplicate_replay() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn SegmentStore> = Arc::new(InMemorySegmentStore::new());
        let engine = Engine::create(
            dir.path(),
            EngineConfig::default(),
            ShardRole::Replica,
            Term(0),
            store,
            TestRuntime::new(4),
        )
        .unwrap();

        let mut stamped = index_req("doc-1", "v1");
        stamped.stamped = Some((SeqNo(5), Term(0)));
        let first = engine.index(stamped.clone()).unwrap();
        assert_eq!(first.seq_no, SeqNo(5));
        // Local checkpoint never reaches 5 here: only seqNo 5 was ever
        // marked processed, so the contiguous floor stays stuck behind it.
        // The retry below must still be caught as a duplicate purely from
        // the version map already holding an equal-or-newer (seqNo, term).
        assert_eq!(engine.local_checkpoint(), None);

        // A retried replication message with the same seqNo/term must be a
        // no-op rather than bumping the document's version again.
        let mut replay = index_req("doc-1", "v1-retry");
        replay.stamped = Some((SeqNo(5), Term(0)));
        let second = engine.index(replay).unwrap();
        assert!(!second.created);
        assert_eq!(second.version, first.version);
        let found = engine.get(&DocId::from("doc-1"), true).unwrap().unwrap();
        assert_eq!(&*found.source, b"v1".as_slice());
    }

    #[tokio::test]
    async fn flush_is_a_no_op_without_force_when_nothing_is_dirty() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn SegmentStore> = Arc::new(InMemorySegmentStore::new());
        let engine = new_engine(dir.path(), store).await;
        assert_eq!(engine.flush(false).unwrap(), FlushOutcome::NoOp);
        engine.index(index_req("doc-1", "v1")).unwrap();
        assert!(matches!(engine.flush(false).unwrap(), FlushOutcome::Flushed { .. }));
        assert_eq!(engine.flush(false).unwrap(), FlushOutcome::NoOp);
    }

    #[tokio::test]
    async fn close_times_out_and_fails_when_a_write_never_drains() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn SegmentStore> = Arc::new(InMemorySegmentStore::new());
        let mut config = EngineConfig::default();
        config.close_drain_timeout = std::time::Duration::from_millis(20);
        let engine = Engine::create(dir.path(), config, ShardRole::Primary, Term(0), store, TestRuntime::new(5)).unwrap();

        let stuck_write = InFlightGuard::enter(&engine.in_flight_writes);
        let err = engine.close().unwrap_err();
        assert!(err.is_engine_closed());
        assert!(engine.is_failed());
        drop(stuck_write);
    }

    #[tokio::test]
    async fn closed_engine_rejects_further_writes() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn SegmentStore> = Arc::new(InMemorySegmentStore::new());
        let engine = new_engine(dir.path(), store).await;
        engine.close().unwrap();
        let err = engine.index(index_req("doc-1", "v1")).unwrap_err();
        assert!(err.is_engine_closed());
    }
}

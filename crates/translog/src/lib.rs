//! The translog: an append-only, generation-segmented write-ahead log
//! (SPEC_FULL §4.3). This crate owns the on-disk file format, generation
//! rollover, fsync policy, view-based retention, and crash recovery replay;
//! [`engine`](https://docs.rs/engine) drives it from the write path.

mod checkpoint;
mod entry;
mod generation;
mod header;

use std::{
    collections::BTreeMap,
    fs,
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
    time::SystemTime,
};

use common::{
    config::TranslogConfig,
    types::{
        Durability,
        Location,
        Operation,
        SeqNo,
    },
};
use errors::FatalEngineError;
use parking_lot::Mutex;
pub use segment_store::uuid_stub::Uuid;

use crate::{
    checkpoint::Checkpoint,
    generation::{
        checkpoint_path,
        data_path,
        parse_generation,
        truncate_to,
        GenerationWriter,
    },
    header::Header,
};

/// An operation recovered from disk during [`Translog::open`], in the
/// storage order the spec requires (SPEC_FULL §4.3 "Recovery": "in storage
/// order (not seqNo order)").
#[derive(Clone, Debug)]
pub struct RecoveredOperation {
    pub generation: u64,
    pub offset: u64,
    pub operation: Operation,
}

fn discover_generations(dir: &Path) -> anyhow::Result<Vec<u64>> {
    let mut generations = Vec::new();
    if !dir.exists() {
        return Ok(generations);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.strip_prefix("translog-").and_then(|s| s.strip_suffix(".tlog")) {
            if let Ok(gen) = rest.parse::<u64>() {
                generations.push(gen);
            }
        }
    }
    generations.sort_unstable();
    Ok(generations)
}

fn read_checkpoint(dir: &Path, generation: u64) -> Option<Checkpoint> {
    Checkpoint::read(&checkpoint_path(dir, generation)).ok()
}

struct Inner {
    dir: PathBuf,
    config: TranslogConfig,
    uuid: Uuid,
    writer: Mutex<GenerationWriter>,
    /// Generations pinned by an outstanding [`View`], refcounted
    /// (SPEC_FULL §4.3 "Retention": "`View` is a reference count per
    /// generation").
    pinned: Mutex<BTreeMap<u64, u32>>,
    /// The floor set by the last flush's commit (SPEC_FULL §4.4): a
    /// generation below this may be deleted unless pinned.
    min_generation_for_recovery: Mutex<u64>,
    trimmed_above_seq_no: Mutex<Option<SeqNo>>,
    global_checkpoint: Mutex<Option<SeqNo>>,
}

/// Handle to the append-only log for one shard. Cheap to clone; all state
/// lives behind an `Arc`.
#[derive(Clone)]
pub struct Translog {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Translog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Translog").finish_non_exhaustive()
    }
}

/// RAII pin on a generation, acquired via [`Translog::acquire_view`].
/// Releases the pin on drop (SPEC_FULL §4.4 `releaseTranslogGenView`).
pub struct View {
    inner: Arc<Inner>,
    generation: u64,
}

impl View {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for View {
    fn drop(&mut self) {
        let mut pinned = self.inner.pinned.lock();
        if let Some(count) = pinned.get_mut(&self.generation) {
            *count -= 1;
            if *count == 0 {
                pinned.remove(&self.generation);
            }
        }
    }
}

impl Translog {
    /// Create a brand-new translog (fresh shard, no prior history).
    pub fn create(dir: &Path, config: TranslogConfig, uuid: Uuid, initial_global_checkpoint: Option<SeqNo>) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)?;
        let header = Header {
            uuid,
            initial_global_checkpoint: initial_global_checkpoint.map_or(-1, |s| s.0 as i64),
            min_translog_generation_for_recovery: 0,
        };
        let writer = GenerationWriter::create(dir, 0, header)?;
        Ok(Self {
            inner: Arc::new(Inner {
                dir: dir.to_path_buf(),
                config,
                uuid,
                writer: Mutex::new(writer),
                pinned: Mutex::new(BTreeMap::new()),
                min_generation_for_recovery: Mutex::new(0),
                trimmed_above_seq_no: Mutex::new(None),
                global_checkpoint: Mutex::new(initial_global_checkpoint),
            }),
        })
    }

    /// Discover every generation `>= min_generation_for_recovery` on disk,
    /// replay them in storage order, repair a corrupt tail in place, then
    /// open a fresh generation above the highest one found as the new
    /// active writer. Returns the translog plus the ops a caller should
    /// replay through the engine's write path.
    pub fn open(
        dir: &Path,
        config: TranslogConfig,
        expected_uuid: Uuid,
        min_generation_for_recovery: u64,
        upper_seq_no: Option<SeqNo>,
    ) -> anyhow::Result<(Self, Vec<RecoveredOperation>)> {
        let generations: Vec<u64> = discover_generations(dir)?
            .into_iter()
            .filter(|g| *g >= min_generation_for_recovery)
            .collect();
        anyhow::ensure!(
            !generations.is_empty(),
            FatalEngineError::TranslogMissing {
                expected: expected_uuid.to_string(),
                found: "<no generations on disk>".to_string(),
            }
        );

        let mut recovered = Vec::new();
        for &generation in &generations {
            let path = data_path(dir, generation);
            let bytes = fs::read(&path)?;
            let parsed = parse_generation(&bytes)?;
            if parsed.header.uuid != expected_uuid {
                anyhow::bail!(FatalEngineError::TranslogMissing {
                    expected: expected_uuid.to_string(),
                    found: parsed.header.uuid.to_string(),
                });
            }
            if parsed.corrupted {
                tracing::warn!(generation, "translog generation has a corrupt tail, repairing by truncation");
                truncate_to(&path, parsed.valid_length)?;
            }
            let trimmed_above = read_checkpoint(dir, generation).and_then(|c| c.trimmed_above_seq_no);
            for (offset, op) in parsed.entries {
                if trimmed_above.is_some_and(|trim| op.seq_no() > trim) {
                    continue;
                }
                if upper_seq_no.is_some_and(|upper| op.seq_no() > upper) {
                    continue;
                }
                recovered.push(RecoveredOperation {
                    generation,
                    offset,
                    operation: op,
                });
            }
        }

        let next_generation = generations.last().expect("checked non-empty above") + 1;
        let header = Header {
            uuid: expected_uuid,
            initial_global_checkpoint: -1,
            min_translog_generation_for_recovery: min_generation_for_recovery as i64,
        };
        let writer = GenerationWriter::create(dir, next_generation, header)?;
        let translog = Self {
            inner: Arc::new(Inner {
                dir: dir.to_path_buf(),
                config,
                uuid: expected_uuid,
                writer: Mutex::new(writer),
                pinned: Mutex::new(BTreeMap::new()),
                min_generation_for_recovery: Mutex::new(min_generation_for_recovery),
                trimmed_above_seq_no: Mutex::new(None),
                global_checkpoint: Mutex::new(None),
            }),
        };
        Ok((translog, recovered))
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    pub fn current_generation(&self) -> u64 {
        self.inner.writer.lock().generation
    }

    /// Append `op` to the active generation. Thread-safe: the writer lock
    /// is held only for the duration of the write, not for the subsequent
    /// fsync (SPEC_FULL §5).
    pub fn append(&self, op: &Operation) -> anyhow::Result<Location> {
        self.inner.writer.lock().append(op)
    }

    /// Block until every append with a location `<= location` is fsynced.
    /// A no-op if `location`'s generation has already been sealed (sealing
    /// always fsyncs first).
    pub fn sync(&self, location: Location) -> anyhow::Result<()> {
        let mut writer = self.inner.writer.lock();
        if writer.generation != location.generation {
            // A sealed generation was already fsynced before rollover.
            return Ok(());
        }
        if writer.covers(&location) {
            return Ok(());
        }
        let gcp = *self.inner.global_checkpoint.lock();
        let min_gen = *self.inner.min_generation_for_recovery.lock();
        let trimmed = *self.inner.trimmed_above_seq_no.lock();
        writer.fsync(gcp, min_gen, trimmed)
    }

    /// Apply the engine's chosen per-write durability policy.
    pub fn maybe_sync(&self, location: Location, durability: Durability) -> anyhow::Result<()> {
        match durability {
            Durability::Request => self.sync(location),
            Durability::Async => Ok(()),
        }
    }

    /// Fsync the active generation unconditionally; driven by the async
    /// fsync background task on `sync_interval` cadence.
    pub fn fsync_current_generation(&self) -> anyhow::Result<()> {
        let mut writer = self.inner.writer.lock();
        let gcp = *self.inner.global_checkpoint.lock();
        let min_gen = *self.inner.min_generation_for_recovery.lock();
        let trimmed = *self.inner.trimmed_above_seq_no.lock();
        writer.fsync(gcp, min_gen, trimmed)
    }

    pub fn update_global_checkpoint(&self, gcp: SeqNo) {
        let mut current = self.inner.global_checkpoint.lock();
        *current = Some(match *current {
            Some(cur) if cur >= gcp => cur,
            _ => gcp,
        });
    }

    pub fn size_bytes(&self) -> u64 {
        self.inner.writer.lock().size_bytes()
    }

    /// Roll to a new generation: seal the current one (fsync + final
    /// checkpoint) and open the next. Atomic with respect to readers: a
    /// concurrent `sync`/append either observes the old generation sealed
    /// or the new one open, never a half-rolled state, since both happen
    /// under the same writer lock (SPEC_FULL §4.3 "Rollover").
    pub fn roll_generation(&self) -> anyhow::Result<u64> {
        let mut writer = self.inner.writer.lock();
        let gcp = *self.inner.global_checkpoint.lock();
        let min_gen = *self.inner.min_generation_for_recovery.lock();
        let trimmed = *self.inner.trimmed_above_seq_no.lock();
        writer.fsync(gcp, min_gen, trimmed)?;
        let next_generation = writer.generation + 1;
        let header = Header {
            uuid: self.inner.uuid,
            initial_global_checkpoint: gcp.map_or(-1, |s| s.0 as i64),
            min_translog_generation_for_recovery: min_gen as i64,
        };
        *writer = GenerationWriter::create(&self.inner.dir, next_generation, header)?;
        Ok(next_generation)
    }

    pub fn roll_if_over_threshold(&self) -> anyhow::Result<Option<u64>> {
        if self.size_bytes() >= self.inner.config.generation_threshold_bytes {
            Ok(Some(self.roll_generation()?))
        } else {
            Ok(None)
        }
    }

    /// On primary promotion: mark entries with seqNo greater than `n` as
    /// invalid for replay. Rewrites the checkpoint of every retained
    /// generation (including the active one on its next fsync) so a
    /// subsequent recovery skips them (SPEC_FULL §4.3 "Trim above").
    pub fn trim_above_seq_no(&self, n: SeqNo) -> anyhow::Result<()> {
        *self.inner.trimmed_above_seq_no.lock() = Some(n);
        let floor = self.retained_min_generation();
        for generation in discover_generations(&self.inner.dir)?.into_iter().filter(|g| *g >= floor) {
            let Some(existing) = read_checkpoint(&self.inner.dir, generation) else {
                continue;
            };
            let rewritten = Checkpoint {
                trimmed_above_seq_no: Some(n),
                ..existing
            };
            rewritten.write_atomic(&checkpoint_path(&self.inner.dir, generation))?;
        }
        let mut writer = self.inner.writer.lock();
        let gcp = *self.inner.global_checkpoint.lock();
        let min_gen = *self.inner.min_generation_for_recovery.lock();
        writer.fsync(gcp, min_gen, Some(n))
    }

    /// Pin `generation` against deletion until the returned [`View`] drops.
    pub fn acquire_view(&self, generation: u64) -> View {
        *self.inner.pinned.lock().entry(generation).or_insert(0) += 1;
        View {
            inner: self.inner.clone(),
            generation,
        }
    }

    /// Set the floor below which generations may be reclaimed, per the
    /// last flush's commit metadata (SPEC_FULL §4.4).
    pub fn set_min_generation_for_recovery(&self, generation: u64) {
        let mut floor = self.inner.min_generation_for_recovery.lock();
        *floor = (*floor).max(generation);
    }

    pub fn min_generation_for_recovery(&self) -> u64 {
        *self.inner.min_generation_for_recovery.lock()
    }

    fn retained_min_generation(&self) -> u64 {
        let base = *self.inner.min_generation_for_recovery.lock();
        let pinned_min = self.inner.pinned.lock().keys().next().copied();
        let mut floor = pinned_min.map_or(base, |p| base.min(p));
        floor = self.extend_for_secondary_retention(floor);
        floor
    }

    /// `retention_age`/`retention_size_bytes` only ever widen the retained
    /// window (retain generations a commit/view no longer needs, to give
    /// peer recovery more history to pull from), never narrow it.
    fn extend_for_secondary_retention(&self, floor: u64) -> u64 {
        let current = self.inner.writer.lock().generation;
        let mut extended = floor;
        if self.inner.config.retention_age.is_none() && self.inner.config.retention_size_bytes.is_none() {
            return extended;
        }
        let mut cumulative_bytes = 0u64;
        let now = SystemTime::now();
        for generation in (0..floor).rev() {
            if generation >= current {
                continue;
            }
            let path = data_path(&self.inner.dir, generation);
            let Ok(metadata) = fs::metadata(&path) else {
                break;
            };
            let mut keep = false;
            if let Some(max_age) = self.inner.config.retention_age {
                if let Ok(modified) = metadata.modified() {
                    if now.duration_since(modified).unwrap_or_default() < max_age {
                        keep = true;
                    }
                }
            }
            if let Some(budget) = self.inner.config.retention_size_bytes {
                if cumulative_bytes < budget {
                    keep = true;
                }
            }
            if !keep {
                break;
            }
            cumulative_bytes += metadata.len();
            extended = generation;
        }
        extended
    }

    /// Delete every sealed generation strictly below the retained floor.
    /// Called after a flush commits and updates the floor (SPEC_FULL §4.4).
    pub fn trim_unreferenced_generations(&self) -> anyhow::Result<Vec<u64>> {
        let floor = self.retained_min_generation();
        let current = self.inner.writer.lock().generation;
        let mut deleted = Vec::new();
        for generation in discover_generations(&self.inner.dir)? {
            if generation >= floor || generation == current {
                continue;
            }
            let _ = fs::remove_file(data_path(&self.inner.dir, generation));
            let _ = fs::remove_file(checkpoint_path(&self.inner.dir, generation));
            deleted.push(generation);
        }
        Ok(deleted)
    }

    /// A consistent read over every retained generation plus the active
    /// writer, for operations with `seq_no >= from` (SPEC_FULL §4.3
    /// "Contract": `snapshotFrom`).
    pub fn snapshot_from(&self, from: SeqNo) -> anyhow::Result<Vec<Operation>> {
        let floor = self.retained_min_generation();
        let current = self.inner.writer.lock().generation;
        let mut ops = Vec::new();
        for generation in discover_generations(&self.inner.dir)?.into_iter().filter(|g| *g >= floor) {
            let bytes = fs::read(data_path(&self.inner.dir, generation))?;
            let parsed = parse_generation(&bytes)?;
            let trimmed_above = read_checkpoint(&self.inner.dir, generation).and_then(|c| c.trimmed_above_seq_no);
            for (_offset, op) in parsed.entries {
                if op.seq_no() < from {
                    continue;
                }
                if trimmed_above.is_some_and(|trim| op.seq_no() > trim) {
                    continue;
                }
                ops.push(op);
            }
            if generation == current {
                break;
            }
        }
        Ok(ops)
    }

    pub fn stats(&self) -> TranslogStats {
        let writer = self.inner.writer.lock();
        let (num_ops, min_seq_no, max_seq_no) = writer.stats();
        TranslogStats {
            current_generation: writer.generation,
            num_ops_in_current_generation: num_ops,
            min_seq_no_in_current_generation: min_seq_no,
            max_seq_no_in_current_generation: max_seq_no,
            size_bytes: writer.size_bytes(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TranslogStats {
    pub current_generation: u64,
    pub num_ops_in_current_generation: u64,
    pub min_seq_no_in_current_generation: Option<SeqNo>,
    pub max_seq_no_in_current_generation: Option<SeqNo>,
    pub size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc as StdArc;

    use common::types::{
        DocId,
        Term,
        Version,
        VersionType,
    };

    use super::*;

    fn index_op(seq_no: u64) -> Operation {
        Operation::Index {
            doc_id: DocId::from(format!("doc-{seq_no}")),
            source: StdArc::from(b"{}".as_slice()),
            routing: None,
            seq_no: SeqNo(seq_no),
            term: Term(1),
            version: Version(1),
            version_type: VersionType::Internal,
            auto_generated_id_timestamp_millis: None,
        }
    }

    #[test]
    fn append_and_sync_round_trips_through_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid(1);
        let translog = Translog::create(dir.path(), TranslogConfig::default(), uuid, None).unwrap();
        let loc0 = translog.append(&index_op(0)).unwrap();
        translog.sync(loc0).unwrap();
        translog.append(&index_op(1)).unwrap();
        translog.roll_generation().unwrap();
        translog.append(&index_op(2)).unwrap();
        translog.fsync_current_generation().unwrap();

        let (_reopened, recovered) = Translog::open(dir.path(), TranslogConfig::default(), uuid, 0, None).unwrap();
        let seq_nos: Vec<_> = recovered.iter().map(|r| r.operation.seq_no()).collect();
        assert_eq!(seq_nos, vec![SeqNo(0), SeqNo(1), SeqNo(2)]);
    }

    #[test]
    fn open_rejects_uuid_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let translog = Translog::create(dir.path(), TranslogConfig::default(), Uuid(1), None).unwrap();
        translog.append(&index_op(0)).unwrap();
        translog.fsync_current_generation().unwrap();
        let err = Translog::open(dir.path(), TranslogConfig::default(), Uuid(2), 0, None).unwrap_err();
        assert!(format!("{err:#}").contains("uuid"));
    }

    #[test]
    fn pinned_view_blocks_trim_below_its_generation() {
        let dir = tempfile::tempdir().unwrap();
        let translog = Translog::create(dir.path(), TranslogConfig::default(), Uuid(1), None).unwrap();
        translog.append(&index_op(0)).unwrap();
        translog.roll_generation().unwrap(); // gen 1
        let view = translog.acquire_view(0);
        translog.append(&index_op(1)).unwrap();
        translog.roll_generation().unwrap(); // gen 2
        translog.set_min_generation_for_recovery(2);

        let deleted = translog.trim_unreferenced_generations().unwrap();
        assert!(!deleted.contains(&0), "pinned generation 0 must survive trim");
        assert!(data_path(dir.path(), 0).exists());

        drop(view);
        let deleted = translog.trim_unreferenced_generations().unwrap();
        assert!(deleted.contains(&0));
        assert!(!data_path(dir.path(), 0).exists());
    }

    #[test]
    fn snapshot_from_filters_by_seq_no() {
        let dir = tempfile::tempdir().unwrap();
        let translog = Translog::create(dir.path(), TranslogConfig::default(), Uuid(1), None).unwrap();
        for s in 0..5 {
            translog.append(&index_op(s)).unwrap();
        }
        translog.fsync_current_generation().unwrap();
        let ops = translog.snapshot_from(SeqNo(2)).unwrap();
        assert_eq!(ops.len(), 3);
        assert!(ops.iter().all(|op| op.seq_no() >= SeqNo(2)));
    }

    #[test]
    fn trim_above_seq_no_excludes_higher_entries_from_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid(7);
        let translog = Translog::create(dir.path(), TranslogConfig::default(), uuid, None).unwrap();
        for s in 0..3 {
            translog.append(&index_op(s)).unwrap();
        }
        translog.fsync_current_generation().unwrap();
        translog.trim_above_seq_no(SeqNo(0)).unwrap();

        let (_reopened, recovered) = Translog::open(dir.path(), TranslogConfig::default(), uuid, 0, None).unwrap();
        let seq_nos: Vec<_> = recovered.iter().map(|r| r.operation.seq_no()).collect();
        assert_eq!(seq_nos, vec![SeqNo(0)]);
    }
}

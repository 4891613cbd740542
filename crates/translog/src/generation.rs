//! A single translog generation: a `.tlog` data file plus its `.ckp`
//! checkpoint footer (SPEC_FULL §4.3, §6). [`GenerationWriter`] is the
//! active, appendable generation; [`parse_generation`] reads a sealed
//! (or active, for a consistent snapshot) generation back for recovery.

use std::{
    fs::{
        File,
        OpenOptions,
    },
    io::Write,
    path::{
        Path,
        PathBuf,
    },
};

use byteorder::{
    ReadBytesExt,
    WriteBytesExt,
    LE,
};
use common::types::{
    Location,
    Operation,
    SeqNo,
};

use crate::{
    checkpoint::Checkpoint,
    entry::{
        decode_body,
        encode_body,
    },
    header::{
        Header,
        HEADER_LEN,
    },
};

pub fn data_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("translog-{generation}.tlog"))
}

pub fn checkpoint_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("translog-{generation}.ckp"))
}

/// The active, appendable generation. A single writer lock (held by
/// [`crate::Translog`]) serializes `append`; `fsync` happens outside that
/// lock per SPEC_FULL §5.
pub struct GenerationWriter {
    pub generation: u64,
    data_path: PathBuf,
    checkpoint_path: PathBuf,
    file: File,
    offset: u64,
    synced_offset: u64,
    num_ops: u64,
    min_seq_no: Option<SeqNo>,
    max_seq_no: Option<SeqNo>,
}

impl GenerationWriter {
    pub fn create(dir: &Path, generation: u64, header: Header) -> anyhow::Result<Self> {
        let data_path = data_path(dir, generation);
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .read(true)
            .open(&data_path)?;
        file.write_all(&header.encode())?;
        file.flush()?;
        Ok(Self {
            generation,
            checkpoint_path: checkpoint_path(dir, generation),
            data_path,
            file,
            offset: HEADER_LEN,
            synced_offset: 0,
            num_ops: 0,
            min_seq_no: None,
            max_seq_no: None,
        })
    }

    pub fn append(&mut self, op: &Operation) -> anyhow::Result<Location> {
        let body = encode_body(op)?;
        let checksum = crc32fast::hash(&body);
        let mut entry = Vec::with_capacity(4 + body.len() + 4);
        entry.write_u32::<LE>(body.len() as u32)?;
        entry.extend_from_slice(&body);
        entry.write_u32::<LE>(checksum)?;

        let location = Location {
            generation: self.generation,
            offset: self.offset,
            size: entry.len() as u64,
        };
        self.file.write_all(&entry)?;
        self.offset += entry.len() as u64;
        self.num_ops += 1;
        let seq_no = op.seq_no();
        self.min_seq_no = Some(self.min_seq_no.map_or(seq_no, |m| if seq_no < m { seq_no } else { m }));
        self.max_seq_no = Some(self.max_seq_no.map_or(seq_no, |m| if seq_no > m { seq_no } else { m }));
        Ok(location)
    }

    pub fn size_bytes(&self) -> u64 {
        self.offset
    }

    pub fn covers(&self, location: &Location) -> bool {
        self.synced_offset >= location.end_offset()
    }

    /// `fsync` of an empty generation (nothing appended since the last
    /// sync) is a no-op and does not rewrite the checkpoint (SPEC_FULL §8
    /// boundary behavior).
    pub fn fsync(
        &mut self,
        global_checkpoint: Option<SeqNo>,
        min_translog_generation_for_recovery: u64,
        trimmed_above_seq_no: Option<SeqNo>,
    ) -> anyhow::Result<()> {
        if self.offset == self.synced_offset {
            return Ok(());
        }
        self.file.sync_all()?;
        self.synced_offset = self.offset;
        let checkpoint = Checkpoint {
            generation: self.generation,
            num_ops: self.num_ops,
            min_seq_no: self.min_seq_no,
            max_seq_no: self.max_seq_no,
            global_checkpoint,
            min_translog_generation_for_recovery,
            trimmed_above_seq_no,
        };
        checkpoint.write_atomic(&self.checkpoint_path)?;
        Ok(())
    }

    pub fn stats(&self) -> (u64, Option<SeqNo>, Option<SeqNo>) {
        (self.num_ops, self.min_seq_no, self.max_seq_no)
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }
}

/// The result of reading a generation's data file back for recovery or a
/// consistent snapshot.
pub struct ParsedGeneration {
    pub header: Header,
    /// `(byte offset of entry start, decoded op)`, in storage order.
    pub entries: Vec<(u64, Operation)>,
    /// Byte offset immediately after the last successfully parsed entry.
    /// Less than the file length iff the tail is corrupt.
    pub valid_length: u64,
    pub corrupted: bool,
}

/// Parse a generation's raw bytes, stopping at the first checksum mismatch
/// or truncated entry rather than failing the whole read (SPEC_FULL §4.3
/// `CorruptedEntry`): "recovery halts at the last good offset."
pub fn parse_generation(bytes: &[u8]) -> anyhow::Result<ParsedGeneration> {
    anyhow::ensure!(bytes.len() as u64 >= HEADER_LEN, "generation shorter than its own header");
    let header = Header::decode(bytes)?;
    let mut offset = HEADER_LEN;
    let mut entries = Vec::new();
    let mut corrupted = false;
    loop {
        if offset + 4 > bytes.len() as u64 {
            break;
        }
        let len_start = offset as usize;
        let body_len = (&bytes[len_start..len_start + 4]).read_u32::<LE>()? as u64;
        let entry_total = 4 + body_len + 4;
        if offset + entry_total > bytes.len() as u64 {
            corrupted = true;
            break;
        }
        let body_start = len_start + 4;
        let body_end = body_start + body_len as usize;
        let body = &bytes[body_start..body_end];
        let stored_checksum = (&bytes[body_end..body_end + 4]).read_u32::<LE>()?;
        if crc32fast::hash(body) != stored_checksum {
            corrupted = true;
            break;
        }
        let op = decode_body(body)?;
        entries.push((offset, op));
        offset += entry_total;
    }
    Ok(ParsedGeneration {
        header,
        entries,
        valid_length: offset,
        corrupted,
    })
}

/// Truncate `path` to `valid_length`, discarding a corrupt tail
/// (SPEC_FULL §4.3: "the tail of the generation is truncated on repair").
pub fn truncate_to(path: &Path, valid_length: u64) -> anyhow::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(valid_length)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::types::{
        DocId,
        Term,
        Version,
        VersionType,
    };
    use segment_store::uuid_stub::Uuid;
    use tempfile::tempdir;

    use super::*;

    fn index_op(seq_no: u64) -> Operation {
        Operation::Index {
            doc_id: DocId::from("doc"),
            source: Arc::from(b"{}".as_slice()),
            routing: None,
            seq_no: SeqNo(seq_no),
            term: Term(1),
            version: Version(1),
            version_type: VersionType::Internal,
            auto_generated_id_timestamp_millis: None,
        }
    }

    fn header() -> Header {
        Header {
            uuid: Uuid(1),
            initial_global_checkpoint: -1,
            min_translog_generation_for_recovery: 0,
        }
    }

    #[test]
    fn append_then_parse_round_trips() {
        let dir = tempdir().unwrap();
        let mut writer = GenerationWriter::create(dir.path(), 0, header()).unwrap();
        writer.append(&index_op(0)).unwrap();
        writer.append(&index_op(1)).unwrap();
        writer.fsync(None, 0, None).unwrap();

        let bytes = std::fs::read(data_path(dir.path(), 0)).unwrap();
        let parsed = parse_generation(&bytes).unwrap();
        assert!(!parsed.corrupted);
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.entries[1].1.seq_no(), SeqNo(1));
    }

    #[test]
    fn fsync_of_empty_generation_is_a_no_op() {
        let dir = tempdir().unwrap();
        let mut writer = GenerationWriter::create(dir.path(), 0, header()).unwrap();
        writer.fsync(None, 0, None).unwrap();
        assert!(!checkpoint_path(dir.path(), 0).exists());
    }

    #[test]
    fn corrupted_tail_is_detected_and_truncatable() {
        let dir = tempdir().unwrap();
        let mut writer = GenerationWriter::create(dir.path(), 0, header()).unwrap();
        writer.append(&index_op(0)).unwrap();
        writer.fsync(None, 0, None).unwrap();
        drop(writer);

        let path = data_path(dir.path(), 0);
        let mut bytes = std::fs::read(&path).unwrap();
        // Flip a byte inside the first entry's body to corrupt its checksum.
        let corrupt_at = HEADER_LEN as usize + 6;
        bytes[corrupt_at] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let parsed = parse_generation(&bytes).unwrap();
        assert!(parsed.corrupted);
        assert_eq!(parsed.entries.len(), 0);
        assert_eq!(parsed.valid_length, HEADER_LEN);

        truncate_to(&path, parsed.valid_length).unwrap();
        let repaired = std::fs::read(&path).unwrap();
        assert_eq!(repaired.len() as u64, HEADER_LEN);
    }
}

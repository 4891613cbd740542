//! The `.ckp` checkpoint footer (SPEC_FULL §4.3), written atomically
//! (`write tmp, fsync, rename`) after every fsync of a generation's data
//! file.

use std::{
    fs,
    io::Write,
    path::Path,
};

use byteorder::{
    ReadBytesExt,
    WriteBytesExt,
    LE,
};
use common::types::SeqNo;

const NO_SEQ_NO: i64 = -1;

fn seq_no_to_i64(seq_no: Option<SeqNo>) -> i64 {
    seq_no.map_or(NO_SEQ_NO, |s| s.0 as i64)
}

fn seq_no_from_i64(raw: i64) -> Option<SeqNo> {
    if raw == NO_SEQ_NO {
        None
    } else {
        Some(SeqNo(raw as u64))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub generation: u64,
    pub num_ops: u64,
    pub min_seq_no: Option<SeqNo>,
    pub max_seq_no: Option<SeqNo>,
    pub global_checkpoint: Option<SeqNo>,
    pub min_translog_generation_for_recovery: u64,
    pub trimmed_above_seq_no: Option<SeqNo>,
}

impl Checkpoint {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u64::<LE>(self.generation).unwrap();
        buf.write_u64::<LE>(self.num_ops).unwrap();
        buf.write_i64::<LE>(seq_no_to_i64(self.min_seq_no)).unwrap();
        buf.write_i64::<LE>(seq_no_to_i64(self.max_seq_no)).unwrap();
        buf.write_i64::<LE>(seq_no_to_i64(self.global_checkpoint)).unwrap();
        buf.write_u64::<LE>(self.min_translog_generation_for_recovery).unwrap();
        buf.write_i64::<LE>(seq_no_to_i64(self.trimmed_above_seq_no)).unwrap();
        buf
    }

    fn decode(mut bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            generation: bytes.read_u64::<LE>()?,
            num_ops: bytes.read_u64::<LE>()?,
            min_seq_no: seq_no_from_i64(bytes.read_i64::<LE>()?),
            max_seq_no: seq_no_from_i64(bytes.read_i64::<LE>()?),
            global_checkpoint: seq_no_from_i64(bytes.read_i64::<LE>()?),
            min_translog_generation_for_recovery: bytes.read_u64::<LE>()?,
            trimmed_above_seq_no: seq_no_from_i64(bytes.read_i64::<LE>()?),
        })
    }

    /// Write to `path` via a sibling `.tmp` file, fsync it, then rename over
    /// `path` — the rename is atomic, so a reader never observes a
    /// partially written checkpoint (SPEC_FULL §6, `translog.ckp.tmp`).
    pub fn write_atomic(&self, path: &Path) -> anyhow::Result<()> {
        let tmp_path = path.with_extension("ckp.tmp");
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&self.encode())?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let bytes = fs::read(path)?;
        Self::decode(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn checkpoint_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("translog-0.ckp");
        let checkpoint = Checkpoint {
            generation: 0,
            num_ops: 3,
            min_seq_no: Some(SeqNo(0)),
            max_seq_no: Some(SeqNo(2)),
            global_checkpoint: None,
            min_translog_generation_for_recovery: 0,
            trimmed_above_seq_no: None,
        };
        checkpoint.write_atomic(&path).unwrap();
        assert_eq!(Checkpoint::read(&path).unwrap(), checkpoint);
        assert!(!path.with_extension("ckp.tmp").exists());
    }

    #[test]
    fn empty_checkpoint_has_no_seq_nos() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("translog-0.ckp");
        let checkpoint = Checkpoint {
            generation: 0,
            num_ops: 0,
            min_seq_no: None,
            max_seq_no: None,
            global_checkpoint: None,
            min_translog_generation_for_recovery: 0,
            trimmed_above_seq_no: None,
        };
        checkpoint.write_atomic(&path).unwrap();
        let read_back = Checkpoint::read(&path).unwrap();
        assert_eq!(read_back.min_seq_no, None);
        assert_eq!(read_back.max_seq_no, None);
    }
}

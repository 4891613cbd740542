//! Per-generation header (SPEC_FULL §4.3): magic, format version, the
//! translog UUID binding this translog to its segment store, and the
//! initial global checkpoint / min-generation-for-recovery in effect when
//! the generation was created.

use byteorder::{
    ReadBytesExt,
    WriteBytesExt,
    LE,
};
use segment_store::uuid_stub::Uuid;

pub const MAGIC: u32 = 0xE50F_C0DE;
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_LEN: u64 = 4 + 4 + 16 + 8 + 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    pub uuid: Uuid,
    pub initial_global_checkpoint: i64,
    pub min_translog_generation_for_recovery: i64,
}

impl Header {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN as usize);
        buf.write_u32::<LE>(MAGIC).unwrap();
        buf.write_u32::<LE>(FORMAT_VERSION).unwrap();
        buf.write_u128::<LE>(self.uuid.0).unwrap();
        buf.write_i64::<LE>(self.initial_global_checkpoint).unwrap();
        buf.write_i64::<LE>(self.min_translog_generation_for_recovery)
            .unwrap();
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> anyhow::Result<Self> {
        anyhow::ensure!(bytes.len() as u64 >= HEADER_LEN, "truncated translog header");
        let magic = bytes.read_u32::<LE>()?;
        anyhow::ensure!(magic == MAGIC, "bad translog magic {magic:#x}, expected {MAGIC:#x}");
        let version = bytes.read_u32::<LE>()?;
        anyhow::ensure!(version == FORMAT_VERSION, "unsupported translog format version {version}");
        let uuid = Uuid(bytes.read_u128::<LE>()?);
        let initial_global_checkpoint = bytes.read_i64::<LE>()?;
        let min_translog_generation_for_recovery = bytes.read_i64::<LE>()?;
        Ok(Self {
            uuid,
            initial_global_checkpoint,
            min_translog_generation_for_recovery,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = Header {
            uuid: Uuid(42),
            initial_global_checkpoint: 7,
            min_translog_generation_for_recovery: 1,
        };
        let encoded = header.encode();
        assert_eq!(encoded.len() as u64, HEADER_LEN);
        assert_eq!(Header::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut encoded = Header {
            uuid: Uuid(1),
            initial_global_checkpoint: 0,
            min_translog_generation_for_recovery: 0,
        }
        .encode();
        encoded[0] = 0;
        assert!(Header::decode(&encoded).is_err());
    }
}

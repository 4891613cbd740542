//! Binary encoding of a translog entry body (SPEC_FULL §4.3, §6): `term:
//! u64, seqNo: u64, opType: u8, op-specific payload`. The length prefix and
//! checksum that wrap this body live in [`crate::generation`].

use std::sync::Arc;

use byteorder::{
    ReadBytesExt,
    WriteBytesExt,
    LE,
};
use common::types::{
    DocId,
    Operation,
    SeqNo,
    Term,
    Version,
    VersionType,
};

const OP_INDEX: u8 = 0;
const OP_DELETE: u8 = 1;
const OP_NOOP: u8 = 2;

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> anyhow::Result<()> {
    buf.write_u32::<LE>(bytes.len() as u32)?;
    buf.extend_from_slice(bytes);
    Ok(())
}

fn read_bytes(cursor: &mut &[u8]) -> anyhow::Result<Vec<u8>> {
    let len = cursor.read_u32::<LE>()? as usize;
    anyhow::ensure!(cursor.len() >= len, "truncated length-prefixed field");
    let (bytes, rest) = cursor.split_at(len);
    *cursor = rest;
    Ok(bytes.to_vec())
}

fn version_type_tag(vt: VersionType) -> u8 {
    match vt {
        VersionType::Internal => 0,
        VersionType::External => 1,
        VersionType::ExternalGte => 2,
    }
}

fn version_type_from_tag(tag: u8) -> anyhow::Result<VersionType> {
    match tag {
        0 => Ok(VersionType::Internal),
        1 => Ok(VersionType::External),
        2 => Ok(VersionType::ExternalGte),
        other => anyhow::bail!("unknown version type tag {other}"),
    }
}

/// Encode `op`'s body (everything after the length prefix, before the
/// checksum).
pub fn encode_body(op: &Operation) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.write_u64::<LE>(op.term().0)?;
    buf.write_u64::<LE>(op.seq_no().0)?;
    match op {
        Operation::Index {
            doc_id,
            source,
            routing,
            version,
            version_type,
            auto_generated_id_timestamp_millis,
            ..
        } => {
            buf.write_u8(OP_INDEX)?;
            write_bytes(&mut buf, doc_id.as_slice())?;
            write_bytes(&mut buf, source)?;
            match routing {
                Some(r) => {
                    buf.write_u8(1)?;
                    write_bytes(&mut buf, r)?;
                },
                None => buf.write_u8(0)?,
            }
            buf.write_i64::<LE>(version.0)?;
            buf.write_u8(version_type_tag(*version_type))?;
            match auto_generated_id_timestamp_millis {
                Some(ts) => {
                    buf.write_u8(1)?;
                    buf.write_i64::<LE>(*ts)?;
                },
                None => buf.write_u8(0)?,
            }
        },
        Operation::Delete {
            doc_id,
            version,
            version_type,
            ..
        } => {
            buf.write_u8(OP_DELETE)?;
            write_bytes(&mut buf, doc_id.as_slice())?;
            buf.write_i64::<LE>(version.0)?;
            buf.write_u8(version_type_tag(*version_type))?;
        },
        Operation::NoOp { reason, .. } => {
            buf.write_u8(OP_NOOP)?;
            write_bytes(&mut buf, reason.as_bytes())?;
        },
    }
    Ok(buf)
}

/// Decode a body produced by [`encode_body`]. `term`/`seq_no` are re-derived
/// from the stamped fields inside the body, matching what was written.
pub fn decode_body(mut body: &[u8]) -> anyhow::Result<Operation> {
    let term = Term(body.read_u64::<LE>()?);
    let seq_no = SeqNo(body.read_u64::<LE>()?);
    let op_type = body.read_u8()?;
    let op = match op_type {
        OP_INDEX => {
            let doc_id = DocId::from_bytes(read_bytes(&mut body)?);
            let source: Arc<[u8]> = Arc::from(read_bytes(&mut body)?.into_boxed_slice());
            let routing = match body.read_u8()? {
                1 => Some(Arc::<[u8]>::from(read_bytes(&mut body)?.into_boxed_slice())),
                _ => None,
            };
            let version = Version(body.read_i64::<LE>()?);
            let version_type = version_type_from_tag(body.read_u8()?)?;
            let auto_generated_id_timestamp_millis = match body.read_u8()? {
                1 => Some(body.read_i64::<LE>()?),
                _ => None,
            };
            Operation::Index {
                doc_id,
                source,
                routing,
                seq_no,
                term,
                version,
                version_type,
                auto_generated_id_timestamp_millis,
            }
        },
        OP_DELETE => {
            let doc_id = DocId::from_bytes(read_bytes(&mut body)?);
            let version = Version(body.read_i64::<LE>()?);
            let version_type = version_type_from_tag(body.read_u8()?)?;
            Operation::Delete {
                doc_id,
                seq_no,
                term,
                version,
                version_type,
            }
        },
        OP_NOOP => {
            let reason = String::from_utf8(read_bytes(&mut body)?)?;
            Operation::NoOp {
                seq_no,
                term,
                reason: Arc::from(reason),
            }
        },
        other => anyhow::bail!("unknown translog op type {other}"),
    };
    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_op(seq_no: u64) -> Operation {
        Operation::Index {
            doc_id: DocId::from("doc"),
            source: Arc::from(b"{\"n\":1}".as_slice()),
            routing: None,
            seq_no: SeqNo(seq_no),
            term: Term(1),
            version: Version(1),
            version_type: VersionType::Internal,
            auto_generated_id_timestamp_millis: None,
        }
    }

    #[test]
    fn index_op_round_trips() {
        let op = index_op(5);
        let body = encode_body(&op).unwrap();
        let decoded = decode_body(&body).unwrap();
        assert_eq!(decoded.seq_no(), SeqNo(5));
        match decoded {
            Operation::Index { doc_id, source, .. } => {
                assert_eq!(doc_id, DocId::from("doc"));
                assert_eq!(&*source, b"{\"n\":1}".as_slice());
            },
            _ => panic!("expected Index"),
        }
    }

    #[test]
    fn delete_op_round_trips() {
        let op = Operation::Delete {
            doc_id: DocId::from("doc"),
            seq_no: SeqNo(1),
            term: Term(2),
            version: Version(3),
            version_type: VersionType::External,
        };
        let body = encode_body(&op).unwrap();
        let decoded = decode_body(&body).unwrap();
        assert_eq!(decoded.term(), Term(2));
        assert!(matches!(decoded, Operation::Delete { .. }));
    }

    #[test]
    fn noop_round_trips() {
        let op = Operation::NoOp {
            seq_no: SeqNo(9),
            term: Term(1),
            reason: Arc::from("promotion gap"),
        };
        let body = encode_body(&op).unwrap();
        let decoded = decode_body(&body).unwrap();
        match decoded {
            Operation::NoOp { reason, .. } => assert_eq!(&*reason, "promotion gap"),
            _ => panic!("expected NoOp"),
        }
    }

    #[test]
    fn index_op_with_routing_and_auto_generated_id_round_trips() {
        let op = Operation::Index {
            doc_id: DocId::from("doc"),
            source: Arc::from(b"{}".as_slice()),
            routing: Some(Arc::from(b"shard-key".as_slice())),
            seq_no: SeqNo(0),
            term: Term(1),
            version: Version(1),
            version_type: VersionType::Internal,
            auto_generated_id_timestamp_millis: Some(123),
        };
        let body = encode_body(&op).unwrap();
        match decode_body(&body).unwrap() {
            Operation::Index {
                routing,
                auto_generated_id_timestamp_millis,
                ..
            } => {
                assert_eq!(routing.as_deref(), Some(b"shard-key".as_slice()));
                assert_eq!(auto_generated_id_timestamp_millis, Some(123));
            },
            _ => panic!("expected Index"),
        }
    }
}

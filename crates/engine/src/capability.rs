//! The capability surface every shard copy exposes regardless of lifecycle
//! state (SPEC_FULL §9 "Inheritance"): a real, writable [`Engine`] and a
//! [`NoOpEngine`] that keeps a shard addressable (for stats, `lastFailure`,
//! checkpoints) while its real engine is `Failed` and awaiting recovery.
//! [`ShardEngineHandle`] is the tagged enum a shard holds; callers generally
//! only need the trait.

use std::sync::Arc;

use common::{
    runtime::Runtime,
    types::{
        DeleteRequest,
        IndexRequest,
        SeqNo,
    },
};
use errors::{
    ErrorMetadata,
    FatalEngineError,
};

use crate::{
    Engine,
    FlushOutcome,
    GetResult,
};

/// Operations common to every shard-copy capability, independent of whether
/// a real engine backs it right now.
pub trait ShardEngine: Send + Sync {
    fn index(&self, req: IndexRequest) -> anyhow::Result<common::types::IndexResult>;
    fn delete(&self, req: DeleteRequest) -> anyhow::Result<common::types::DeleteResult>;
    fn get(&self, doc_id: &common::types::DocId, realtime: bool) -> anyhow::Result<Option<GetResult>>;
    fn refresh(&self) -> anyhow::Result<()>;
    fn flush(&self, force: bool) -> anyhow::Result<FlushOutcome>;
    fn close(&self) -> anyhow::Result<()>;
    fn local_checkpoint(&self) -> Option<SeqNo>;
    fn max_seq_no(&self) -> Option<SeqNo>;
    fn last_failure(&self) -> Option<FatalEngineError>;
}

impl<R: Runtime> ShardEngine for Engine<R> {
    fn index(&self, req: IndexRequest) -> anyhow::Result<common::types::IndexResult> {
        Engine::index(self, req)
    }

    fn delete(&self, req: DeleteRequest) -> anyhow::Result<common::types::DeleteResult> {
        Engine::delete(self, req)
    }

    fn get(&self, doc_id: &common::types::DocId, realtime: bool) -> anyhow::Result<Option<GetResult>> {
        Engine::get(self, doc_id, realtime)
    }

    fn refresh(&self) -> anyhow::Result<()> {
        Engine::refresh(self)
    }

    fn flush(&self, force: bool) -> anyhow::Result<FlushOutcome> {
        Engine::flush(self, force)
    }

    fn close(&self) -> anyhow::Result<()> {
        Engine::close(self)
    }

    fn local_checkpoint(&self) -> Option<SeqNo> {
        Engine::local_checkpoint(self)
    }

    fn max_seq_no(&self) -> Option<SeqNo> {
        Engine::max_seq_no(self)
    }

    fn last_failure(&self) -> Option<FatalEngineError> {
        Engine::last_failure(self)
    }
}

/// Stands in for a shard's real engine once it has failed, so the shard
/// stays addressable (observable checkpoints, `lastFailure`) while recovery
/// is pending, without resurrecting a half-broken `Engine` (SPEC_FULL §9).
pub struct NoOpEngine {
    local_checkpoint: Option<SeqNo>,
    max_seq_no: Option<SeqNo>,
    last_failure: Option<FatalEngineError>,
}

impl NoOpEngine {
    pub fn new(local_checkpoint: Option<SeqNo>, max_seq_no: Option<SeqNo>, last_failure: Option<FatalEngineError>) -> Self {
        Self {
            local_checkpoint,
            max_seq_no,
            last_failure,
        }
    }

    fn closed_err(&self) -> anyhow::Error {
        anyhow::anyhow!(ErrorMetadata::engine_closed(
            "engine has failed and is waiting on recovery; no writes or refresh are possible"
        ))
    }
}

impl ShardEngine for NoOpEngine {
    fn index(&self, _req: IndexRequest) -> anyhow::Result<common::types::IndexResult> {
        Err(self.closed_err())
    }

    fn delete(&self, _req: DeleteRequest) -> anyhow::Result<common::types::DeleteResult> {
        Err(self.closed_err())
    }

    fn get(&self, _doc_id: &common::types::DocId, _realtime: bool) -> anyhow::Result<Option<GetResult>> {
        Err(self.closed_err())
    }

    fn refresh(&self) -> anyhow::Result<()> {
        Err(self.closed_err())
    }

    fn flush(&self, _force: bool) -> anyhow::Result<FlushOutcome> {
        Err(self.closed_err())
    }

    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn local_checkpoint(&self) -> Option<SeqNo> {
        self.local_checkpoint
    }

    fn max_seq_no(&self) -> Option<SeqNo> {
        self.max_seq_no
    }

    fn last_failure(&self) -> Option<FatalEngineError> {
        self.last_failure.clone()
    }
}

/// Tagged capability set a shard copy hands out to callers: either a real,
/// [`Engine::open`]ed engine, or a [`NoOpEngine`] left behind after a fatal
/// failure.
pub enum ShardEngineHandle<R: Runtime> {
    Internal(Arc<Engine<R>>),
    NoOp(NoOpEngine),
}

impl<R: Runtime> ShardEngine for ShardEngineHandle<R> {
    fn index(&self, req: IndexRequest) -> anyhow::Result<common::types::IndexResult> {
        match self {
            Self::Internal(e) => e.index(req),
            Self::NoOp(e) => e.index(req),
        }
    }

    fn delete(&self, req: DeleteRequest) -> anyhow::Result<common::types::DeleteResult> {
        match self {
            Self::Internal(e) => e.delete(req),
            Self::NoOp(e) => e.delete(req),
        }
    }

    fn get(&self, doc_id: &common::types::DocId, realtime: bool) -> anyhow::Result<Option<GetResult>> {
        match self {
            Self::Internal(e) => e.get(doc_id, realtime),
            Self::NoOp(e) => e.get(doc_id, realtime),
        }
    }

    fn refresh(&self) -> anyhow::Result<()> {
        match self {
            Self::Internal(e) => e.refresh(),
            Self::NoOp(e) => e.refresh(),
        }
    }

    fn flush(&self, force: bool) -> anyhow::Result<FlushOutcome> {
        match self {
            Self::Internal(e) => e.flush(force),
            Self::NoOp(e) => e.flush(force),
        }
    }

    fn close(&self) -> anyhow::Result<()> {
        match self {
            Self::Internal(e) => e.close(),
            Self::NoOp(e) => e.close(),
        }
    }

    fn local_checkpoint(&self) -> Option<SeqNo> {
        match self {
            Self::Internal(e) => e.local_checkpoint(),
            Self::NoOp(e) => e.local_checkpoint(),
        }
    }

    fn max_seq_no(&self) -> Option<SeqNo> {
        match self {
            Self::Internal(e) => e.max_seq_no(),
            Self::NoOp(e) => e.max_seq_no(),
        }
    }

    fn last_failure(&self) -> Option<FatalEngineError> {
        match self {
            Self::Internal(e) => e.last_failure(),
            Self::NoOp(e) => e.last_failure(),
        }
    }
}

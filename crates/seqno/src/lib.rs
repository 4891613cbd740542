//! SeqNoService (SPEC_FULL §4.1): allocates sequence numbers on the primary,
//! tracks local/global checkpoints, and records the current primary term.

mod checkpoint_tracker;

use checkpoint_tracker::CheckpointTracker;
use common::types::{
    SeqNo,
    Term,
};
use errors::ErrorMetadata;
use parking_lot::Mutex;

/// Which role this shard copy currently holds. Only a primary may `generate`
/// new seqNos; a replica only records seqNos stamped by its primary.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShardRole {
    Primary,
    Replica,
}

struct State {
    role: ShardRole,
    term: Term,
    next_seq_no: u64,
    global_checkpoint: Option<SeqNo>,
    tracker: CheckpointTracker,
}

/// Single point of sequence-number and checkpoint bookkeeping for one shard.
/// All mutation happens under one internal lock; the critical sections are
/// short (a handful of integer comparisons), so contention is not a concern
/// even though writes to distinct docIds otherwise proceed fully in
/// parallel through the rest of the engine.
pub struct SeqNoService {
    state: Mutex<State>,
}

impl SeqNoService {
    pub fn new(role: ShardRole, term: Term) -> Self {
        Self {
            state: Mutex::new(State {
                role,
                term,
                next_seq_no: 0,
                global_checkpoint: None,
                tracker: CheckpointTracker::new(),
            }),
        }
    }

    /// Rebuild state after recovery: `next_seq_no` resumes one past the
    /// highest seqNo seen in the translog, and the checkpoint starts at the
    /// commit's persisted local checkpoint.
    pub fn restore(role: ShardRole, term: Term, persisted_checkpoint: Option<SeqNo>, max_seq_no_seen: Option<SeqNo>) -> Self {
        let next_seq_no = max_seq_no_seen.map_or(0, |s| s.0 + 1);
        Self {
            state: Mutex::new(State {
                role,
                term,
                next_seq_no,
                global_checkpoint: None,
                tracker: CheckpointTracker::restore(persisted_checkpoint),
            }),
        }
    }

    /// Allocate the next seqNo. Primary-only; `caller_term` must be at least
    /// the shard's current term or this returns `StalePrimary`.
    pub fn generate(&self, caller_term: Term) -> anyhow::Result<SeqNo> {
        let mut state = self.state.lock();
        if state.role != ShardRole::Primary {
            anyhow::bail!(ErrorMetadata::stale_primary(
                "generate() called on a non-primary shard"
            ));
        }
        if caller_term.0 < state.term.0 {
            anyhow::bail!(ErrorMetadata::stale_primary(format!(
                "write term {} is older than current term {}",
                caller_term.0, state.term.0
            )));
        }
        let seq_no = SeqNo(state.next_seq_no);
        state.next_seq_no += 1;
        Ok(seq_no)
    }

    /// Record that `seq_no`'s effects are durable/resident, advancing the
    /// local checkpoint as far as contiguity allows. Never fails — marking
    /// is idempotent and commutative by design (SPEC_FULL §4.1).
    pub fn mark_seq_no_as_processed(&self, seq_no: SeqNo) {
        self.state.lock().tracker.mark_processed(seq_no);
    }

    pub fn local_checkpoint(&self) -> Option<SeqNo> {
        self.state.lock().tracker.local_checkpoint()
    }

    pub fn max_seq_no(&self) -> Option<SeqNo> {
        self.state.lock().tracker.max_seq_no()
    }

    /// Monotonic: a smaller or equal value is silently ignored rather than
    /// rejected, since the coordinator may resend the same or a stale
    /// global checkpoint.
    pub fn update_global_checkpoint(&self, gcp: SeqNo) {
        let mut state = self.state.lock();
        state.global_checkpoint = Some(match state.global_checkpoint {
            Some(cur) if cur >= gcp => cur,
            _ => gcp,
        });
    }

    pub fn global_checkpoint(&self) -> Option<SeqNo> {
        self.state.lock().global_checkpoint
    }

    pub fn current_term(&self) -> Term {
        self.state.lock().term
    }

    pub fn role(&self) -> ShardRole {
        self.state.lock().role
    }

    /// Bump to a strictly greater term. Used on primary promotion or when a
    /// replica learns of a new primary.
    pub fn bump_term(&self, new_term: Term) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if new_term.0 <= state.term.0 {
            anyhow::bail!(ErrorMetadata::stale_primary(format!(
                "bump_term({}) is not strictly greater than current term {}",
                new_term.0, state.term.0
            )));
        }
        state.term = new_term;
        Ok(())
    }

    /// Fast-forward `next_seq_no` past the highest seqNo this shard has
    /// seen, called once after a promotion to primary so the new primary
    /// never reissues a seqNo a former primary may have already assigned.
    pub fn reset_after_promotion(&self) {
        let mut state = self.state.lock();
        state.role = ShardRole::Primary;
        if let Some(max) = state.tracker.max_seq_no() {
            state.next_seq_no = state.next_seq_no.max(max.0 + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use common::types::{
        SeqNo,
        Term,
    };

    use super::*;

    #[test]
    fn generate_assigns_increasing_seq_nos() {
        let svc = SeqNoService::new(ShardRole::Primary, Term(1));
        assert_eq!(svc.generate(Term(1)).unwrap(), SeqNo(0));
        assert_eq!(svc.generate(Term(1)).unwrap(), SeqNo(1));
        assert_eq!(svc.generate(Term(1)).unwrap(), SeqNo(2));
    }

    #[test]
    fn generate_rejects_stale_term() {
        let svc = SeqNoService::new(ShardRole::Primary, Term(5));
        let err = svc.generate(Term(4)).unwrap_err();
        assert!(format!("{err:#}").contains("older than current term"));
    }

    #[test]
    fn generate_rejects_on_replica() {
        let svc = SeqNoService::new(ShardRole::Replica, Term(1));
        assert!(svc.generate(Term(1)).is_err());
    }

    #[test]
    fn local_checkpoint_advances_on_mark() {
        let svc = SeqNoService::new(ShardRole::Primary, Term(1));
        svc.mark_seq_no_as_processed(SeqNo(0));
        svc.mark_seq_no_as_processed(SeqNo(1));
        assert_eq!(svc.local_checkpoint(), Some(SeqNo(1)));
    }

    #[test]
    fn global_checkpoint_is_monotonic() {
        let svc = SeqNoService::new(ShardRole::Primary, Term(1));
        svc.update_global_checkpoint(SeqNo(5));
        svc.update_global_checkpoint(SeqNo(3));
        assert_eq!(svc.global_checkpoint(), Some(SeqNo(5)));
        svc.update_global_checkpoint(SeqNo(9));
        assert_eq!(svc.global_checkpoint(), Some(SeqNo(9)));
    }

    #[test]
    fn bump_term_requires_strictly_greater() {
        let svc = SeqNoService::new(ShardRole::Primary, Term(3));
        assert!(svc.bump_term(Term(3)).is_err());
        assert!(svc.bump_term(Term(2)).is_err());
        svc.bump_term(Term(4)).unwrap();
        assert_eq!(svc.current_term(), Term(4));
    }

    #[test]
    fn reset_after_promotion_skips_past_max_seen() {
        let svc = SeqNoService::new(ShardRole::Replica, Term(1));
        svc.mark_seq_no_as_processed(SeqNo(0));
        svc.mark_seq_no_as_processed(SeqNo(7));
        svc.reset_after_promotion();
        assert_eq!(svc.role(), ShardRole::Primary);
        assert_eq!(svc.generate(Term(1)).unwrap(), SeqNo(8));
    }

    #[test]
    fn restore_resumes_past_highest_seen_seq_no() {
        let svc = SeqNoService::restore(ShardRole::Primary, Term(2), Some(SeqNo(10)), Some(SeqNo(15)));
        assert_eq!(svc.local_checkpoint(), Some(SeqNo(10)));
        assert_eq!(svc.generate(Term(2)).unwrap(), SeqNo(16));
    }
}

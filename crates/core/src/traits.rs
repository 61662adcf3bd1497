//! Traits at the seams of the node core.

use crate::{Action, Event};
use conclave_types::{Endpoint, Pool, Sequence};

/// The composed node state machine.
///
/// Implementations are synchronous and deterministic: they mutate themselves
/// and return actions, but perform no I/O. The runtime guarantees `handle`
/// is only ever called from its single consumer task.
pub trait StateMachine {
    fn handle(&mut self, event: Event) -> Vec<Action>;
}

/// Outcome of handing a pool to the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreResult {
    Stored,
    Duplicate,
    Invalid,
}

/// The on-disk block store. An external collaborator; the core only reads
/// the tip and appends.
pub trait BlockChain: Send + Sync {
    /// The highest stored sequence, 0 for an empty chain.
    fn last_sequence(&self) -> Sequence;

    fn store_block(&self, pool: Pool) -> StoreResult;

    fn get_block(&self, sequence: Sequence) -> Option<Pool>;
}

/// The datagram transport. An external collaborator; delivery is best-effort
/// and failures surface as strikes on the peer.
pub trait Transport: Send + Sync {
    fn send(&self, endpoint: Endpoint, bytes: &[u8]);
}

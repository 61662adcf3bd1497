//! Aggregates exchanged between nodes as whole units.
//!
//! The node core treats these as opaque: it needs `sequence()`, `hash()` and
//! byte-level equality, nothing more. Their inner layout belongs to the
//! ledger, not to the sync/consensus machinery.

use crate::{Hash, PublicKey, RoundNumber, Sequence, Signature};

/// A candidate or finalized block body.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct Pool {
    sequence: Sequence,
    payload: Vec<u8>,
}

impl Pool {
    pub fn new(sequence: Sequence, payload: Vec<u8>) -> Self {
        Self { sequence, payload }
    }

    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn hash(&self) -> Hash {
        let mut data = Vec::with_capacity(8 + self.payload.len());
        data.extend_from_slice(&self.sequence.to_le_bytes());
        data.extend_from_slice(&self.payload);
        Hash::digest(&data)
    }
}

/// A batch of transactions flushed by a node during a round.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct TransactionsPacket {
    payload: Vec<u8>,
}

impl TransactionsPacket {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn hash(&self) -> Hash {
        Hash::digest(&self.payload)
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A trusted node's per-round hash contribution.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct HashVector {
    pub round: RoundNumber,
    pub sender: PublicKey,
    pub hash: Hash,
    pub signature: Signature,
}

/// A trusted node's view of every confidant's vector for the round.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct HashMatrix {
    pub round: RoundNumber,
    pub sender: PublicKey,
    pub vectors: Vec<HashVector>,
}

/// Announces a round: its number, the writer, and the trusted set.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct RoundTable {
    pub round: RoundNumber,
    pub writer: PublicKey,
    pub confidants: Vec<PublicKey>,
}

impl RoundTable {
    pub fn is_confidant(&self, key: &PublicKey) -> bool {
        self.confidants.contains(key)
    }
}

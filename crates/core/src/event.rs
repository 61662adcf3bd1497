//! Event types for the deterministic state machine.

use crate::TimerId;
use conclave_types::{HashMatrix, HashVector, Pool, PublicKey, RoundTable, Sequence,
    TransactionsPacket};

/// Priority levels for event ordering within the same timestamp.
///
/// Lower values = higher priority (processed first). Internal events are
/// consequences of prior event processing and are handled before new
/// external inputs, preserving causality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: consequences of prior event processing.
    Internal = 0,

    /// Timer events: scheduled by the node itself.
    Timer = 1,

    /// Network events: external inputs from other nodes.
    Network = 2,
}

/// All possible events the node core can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// A timer owned by the core fired.
    Timer(TimerId),

    // ═══════════════════════════════════════════════════════════════════════
    // Network Messages - Consensus (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// A round table announcing a new round, its writer and confidants.
    RoundTableReceived { table: RoundTable },

    /// A trusted node's hash vector for the current round.
    VectorReceived { vector: HashVector },

    /// A trusted node's hash matrix for the current round.
    MatrixReceived { matrix: HashMatrix },

    /// A flushed transaction batch.
    TransactionListReceived { pack: TransactionsPacket },

    /// A block broadcast by the round's writer.
    BlockReceived { pool: Pool, sender: PublicKey },

    // ═══════════════════════════════════════════════════════════════════════
    // Network Messages - Sync (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// A batch of pools answering one of our block requests.
    BlockRepliesReceived { pools: Vec<Pool>, packet_id: u64 },

    /// A peer advertised its tip sequence in a ping.
    PingReceived { key: PublicKey, sequence: Sequence },

    // ═══════════════════════════════════════════════════════════════════════
    // Neighbourhood membership (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// A peer joined the active neighbour set.
    NeighbourAdded { key: PublicKey, sequence: Sequence },

    /// A peer left the active neighbour set (disconnect or black-list).
    NeighbourRemoved { key: PublicKey },

    // ═══════════════════════════════════════════════════════════════════════
    // Storage callbacks (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════════
    /// The chain stored a block.
    BlockStored { sequence: Sequence },

    /// The chain removed a block (rollback).
    BlockRemoved { sequence: Sequence },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal Events (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════════
    /// The consensus machine detected it is behind and wants a sync pass.
    SyncNeeded { round: u64 },

    /// The synchronizer drained its requested set at the target tip.
    SyncFinished { sequence: Sequence },
}

impl Event {
    /// Get the priority for this event type.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::BlockStored { .. }
            | Event::BlockRemoved { .. }
            | Event::SyncNeeded { .. }
            | Event::SyncFinished { .. } => EventPriority::Internal,

            Event::Timer(_) => EventPriority::Timer,

            Event::RoundTableReceived { .. }
            | Event::VectorReceived { .. }
            | Event::MatrixReceived { .. }
            | Event::TransactionListReceived { .. }
            | Event::BlockReceived { .. }
            | Event::BlockRepliesReceived { .. }
            | Event::PingReceived { .. }
            | Event::NeighbourAdded { .. }
            | Event::NeighbourRemoved { .. } => EventPriority::Network,
        }
    }

    /// Check if this is an internal event (consequence of prior processing).
    pub fn is_internal(&self) -> bool {
        self.priority() == EventPriority::Internal
    }

    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Timer(_) => "Timer",
            Event::RoundTableReceived { .. } => "RoundTableReceived",
            Event::VectorReceived { .. } => "VectorReceived",
            Event::MatrixReceived { .. } => "MatrixReceived",
            Event::TransactionListReceived { .. } => "TransactionListReceived",
            Event::BlockReceived { .. } => "BlockReceived",
            Event::BlockRepliesReceived { .. } => "BlockRepliesReceived",
            Event::PingReceived { .. } => "PingReceived",
            Event::NeighbourAdded { .. } => "NeighbourAdded",
            Event::NeighbourRemoved { .. } => "NeighbourRemoved",
            Event::BlockStored { .. } => "BlockStored",
            Event::BlockRemoved { .. } => "BlockRemoved",
            Event::SyncNeeded { .. } => "SyncNeeded",
            Event::SyncFinished { .. } => "SyncFinished",
        }
    }
}

//! Outbound message types for network communication.

use conclave_types::{HashMatrix, HashVector, Pool, RoundTable, Sequence, TransactionsPacket};

/// Outbound network messages.
///
/// These are the messages a node can send to other nodes. The runtime frames
/// them into packets and hands them to the Neighbourhood for delivery.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Round table announcement (writer only).
    RoundTable(RoundTable),

    /// Per-round hash vector (trusted nodes).
    Vector(HashVector),

    /// Per-round hash matrix (trusted nodes).
    Matrix(HashMatrix),

    /// Flushed transaction batch.
    TransactionList(TransactionsPacket),

    /// A composed block.
    Block(Pool),

    /// A batch of pools answering a block request.
    BlockReply { packet_id: u64, pools: Vec<Pool> },

    /// Tip advertisement.
    Ping { sequence: Sequence },
}

impl OutboundMessage {
    /// Get a human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::RoundTable(_) => "RoundTable",
            OutboundMessage::Vector(_) => "Vector",
            OutboundMessage::Matrix(_) => "Matrix",
            OutboundMessage::TransactionList(_) => "TransactionList",
            OutboundMessage::Block(_) => "Block",
            OutboundMessage::BlockReply { .. } => "BlockReply",
            OutboundMessage::Ping { .. } => "Ping",
        }
    }

    /// Check if this is a consensus message (round-scoped).
    pub fn is_consensus(&self) -> bool {
        matches!(
            self,
            OutboundMessage::RoundTable(_)
                | OutboundMessage::Vector(_)
                | OutboundMessage::Matrix(_)
        )
    }
}

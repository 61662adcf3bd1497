//! Action types for the deterministic state machine.

use crate::{message::OutboundMessage, Event, TimerId};
use conclave_types::{Pool, PublicKey, Sequence};
use std::time::Duration;

/// Actions the state machine wants to perform.
///
/// Actions are **commands** - they describe something to do.
/// The runtime executes actions and may convert results back into events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Broadcast a message to every current neighbour that has not yet
    /// acknowledged it.
    BroadcastToNeighbours { message: OutboundMessage },

    /// Directed send to each confidant of the current round.
    SendToConfidants { message: OutboundMessage },

    /// Directed send to a single peer.
    SendTo {
        target: PublicKey,
        message: OutboundMessage,
    },

    /// Ask `target` for the given block sequences. The transport layer
    /// serializes this into a block request packet.
    SendBlockRequest {
        target: PublicKey,
        sequences: Vec<Sequence>,
        packet_id: u64,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Set a timer to fire after a duration. Periodic timers repeat until
    /// cancelled.
    SetTimer {
        id: TimerId,
        duration: Duration,
        periodic: bool,
    },

    /// Cancel a previously set timer.
    CancelTimer { id: TimerId },

    /// Drop and re-pick the neighbour roster. Issued when sync makes no
    /// progress for the stall threshold.
    ReselectNeighbours,

    // ═══════════════════════════════════════════════════════════════════════
    // Storage
    // ═══════════════════════════════════════════════════════════════════════
    /// Hand a pool to the chain. The runtime answers with
    /// [`Event::BlockStored`] on success.
    StoreBlock { pool: Pool },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (fed back as events with Internal priority)
    // ═══════════════════════════════════════════════════════════════════════
    /// Enqueue an internal event for processing before new external input.
    EnqueueInternal { event: Event },
}

impl Action {
    /// Check if this action performs network I/O.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Action::BroadcastToNeighbours { .. }
                | Action::SendToConfidants { .. }
                | Action::SendTo { .. }
                | Action::SendBlockRequest { .. }
        )
    }

    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::BroadcastToNeighbours { .. } => "BroadcastToNeighbours",
            Action::SendToConfidants { .. } => "SendToConfidants",
            Action::SendTo { .. } => "SendTo",
            Action::SendBlockRequest { .. } => "SendBlockRequest",
            Action::ReselectNeighbours => "ReselectNeighbours",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::StoreBlock { .. } => "StoreBlock",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
        }
    }
}

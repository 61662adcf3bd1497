//! Role states and their handlers.

use crate::state::RoundContext;
use conclave_core::{Action, OutboundMessage, TimerId};
use conclave_types::{HashMatrix, HashVector, Hash, Pool, PublicKey, RoundNumber, Signature,
    TransactionsPacket};
use tracing::{debug, trace};

/// Result of a role handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Keep the current state.
    Continue,
    /// The state is done; consult the transition table.
    Finish,
    /// Drop the event.
    Ignore,
    /// The state failed; consult the transition table.
    Failure,
}

/// Discriminant of the role states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleKind {
    Normal,
    Trusted,
    Writer,
    Collect,
    WriteTx,
    Syncing,
}

/// Common capability set of the role states.
///
/// Only states for which a handler is meaningful override it; the defaults
/// ignore the event.
pub trait RoleBehavior {
    fn name(&self) -> &'static str;

    fn on_enter(&mut self, _ctx: &mut RoundContext) {}

    fn on_exit(&mut self, _ctx: &mut RoundContext) {}

    fn on_round_end(&mut self, _ctx: &mut RoundContext) {}

    fn on_round_table(&mut self, _ctx: &mut RoundContext, _round: RoundNumber) -> Outcome {
        Outcome::Ignore
    }

    fn on_block(&mut self, _ctx: &mut RoundContext, _pool: &Pool, _sender: &PublicKey) -> Outcome {
        Outcome::Ignore
    }

    fn on_vector(&mut self, _ctx: &mut RoundContext, _vector: &HashVector) -> Outcome {
        Outcome::Ignore
    }

    fn on_matrix(&mut self, _ctx: &mut RoundContext, _matrix: &HashMatrix) -> Outcome {
        Outcome::Ignore
    }

    fn on_transaction_list(&mut self, _ctx: &mut RoundContext, _pack: &TransactionsPacket) -> Outcome {
        Outcome::Ignore
    }

    fn on_timeout(&mut self, _ctx: &mut RoundContext, _timer: TimerId) -> Outcome {
        Outcome::Ignore
    }
}

fn store_if_contiguous(ctx: &mut RoundContext, pool: &Pool) -> bool {
    if pool.sequence() == ctx.last_stored + 1 {
        ctx.emit(Action::StoreBlock { pool: pool.clone() });
        true
    } else {
        false
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Normal
// ═══════════════════════════════════════════════════════════════════════════

/// A normal node. Flushes its collected transactions periodically; when the
/// spam generator is enabled it also injects synthetic load.
#[derive(Debug, Default)]
pub struct NormalRole {
    spam_index: u64,
}

impl RoleBehavior for NormalRole {
    fn name(&self) -> &'static str {
        "Normal"
    }

    fn on_enter(&mut self, ctx: &mut RoundContext) {
        ctx.flushed_counter = 0;
        ctx.emit(Action::SetTimer {
            id: TimerId::Flush,
            duration: ctx.config.flush_interval,
            periodic: true,
        });
        if ctx.config.spam_enabled {
            ctx.emit(Action::SetTimer {
                id: TimerId::Spam,
                duration: ctx.config.spam_interval,
                periodic: true,
            });
        }
    }

    fn on_exit(&mut self, ctx: &mut RoundContext) {
        ctx.emit(Action::CancelTimer { id: TimerId::Flush });
        if ctx.config.spam_enabled {
            ctx.emit(Action::CancelTimer { id: TimerId::Spam });
        }
    }

    fn on_round_table(&mut self, _ctx: &mut RoundContext, _round: RoundNumber) -> Outcome {
        Outcome::Finish
    }

    fn on_block(&mut self, ctx: &mut RoundContext, pool: &Pool, _sender: &PublicKey) -> Outcome {
        store_if_contiguous(ctx, pool);
        Outcome::Continue
    }

    fn on_timeout(&mut self, ctx: &mut RoundContext, timer: TimerId) -> Outcome {
        match timer {
            TimerId::Flush => {
                if let Some(pack) = ctx.take_flush() {
                    trace!(counter = ctx.flushed_counter, "Flushing transactions");
                    ctx.emit(Action::BroadcastToNeighbours {
                        message: OutboundMessage::TransactionList(pack),
                    });
                }
                Outcome::Continue
            }
            TimerId::Spam => {
                if !ctx.config.spam_enabled {
                    return Outcome::Ignore;
                }
                // every node spams a target set distinct from every other's
                let mut payload = ctx.own_key.as_bytes().to_vec();
                payload.extend_from_slice(&self.spam_index.to_le_bytes());
                payload.extend_from_slice(&(ctx.config.count_target_wallets as u64).to_le_bytes());
                payload.resize(payload.len() + ctx.config.count_trans_in_round, 0);
                self.spam_index += 1;
                ctx.emit(Action::BroadcastToNeighbours {
                    message: OutboundMessage::TransactionList(TransactionsPacket::new(payload)),
                });
                Outcome::Continue
            }
            _ => Outcome::Ignore,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Trusted
// ═══════════════════════════════════════════════════════════════════════════

/// A trusted node of the current round.
///
/// Accumulates hash vectors and matrices from the confidants. The two
/// completion flags replace the `TrustedM`/`TrustedV`/`TrustedVM`
/// combinations: each is set independently, and the state finishes when both
/// hold.
#[derive(Debug, Default)]
pub struct TrustedRole {
    pub vectors_done: bool,
    pub matrices_done: bool,
    sent_matrix: bool,
}

impl TrustedRole {
    fn completion(&mut self, ctx: &mut RoundContext) -> Outcome {
        if ctx.vectors_completed() {
            self.vectors_done = true;
            if !self.sent_matrix {
                self.sent_matrix = true;
                let matrix = HashMatrix {
                    round: ctx.round,
                    sender: ctx.own_key,
                    vectors: ctx.vectors().cloned().collect(),
                };
                ctx.add_matrix(matrix.clone());
                ctx.emit(Action::SendToConfidants {
                    message: OutboundMessage::Matrix(matrix),
                });
            }
        }
        if ctx.matrices_completed() {
            self.matrices_done = true;
        }
        if self.vectors_done && self.matrices_done {
            debug!(round = ctx.round, "Trusted stage complete");
            Outcome::Finish
        } else {
            Outcome::Continue
        }
    }
}

impl RoleBehavior for TrustedRole {
    fn name(&self) -> &'static str {
        "Trusted"
    }

    fn on_enter(&mut self, ctx: &mut RoundContext) {
        self.vectors_done = false;
        self.matrices_done = false;
        self.sent_matrix = false;

        // our own contribution counts toward completion like any other
        let mut seed = ctx.last_stored.to_le_bytes().to_vec();
        seed.extend_from_slice(&ctx.round.to_le_bytes());
        let vector = HashVector {
            round: ctx.round,
            sender: ctx.own_key,
            hash: Hash::digest(&seed),
            signature: Signature::zero(),
        };
        ctx.add_vector(vector.clone());
        ctx.emit(Action::SendToConfidants {
            message: OutboundMessage::Vector(vector),
        });
    }

    fn on_round_table(&mut self, _ctx: &mut RoundContext, _round: RoundNumber) -> Outcome {
        Outcome::Finish
    }

    fn on_vector(&mut self, ctx: &mut RoundContext, vector: &HashVector) -> Outcome {
        if !ctx.is_confidant(&vector.sender) {
            return Outcome::Ignore;
        }
        ctx.add_vector(vector.clone());
        self.completion(ctx)
    }

    fn on_matrix(&mut self, ctx: &mut RoundContext, matrix: &HashMatrix) -> Outcome {
        if !ctx.is_confidant(&matrix.sender) {
            return Outcome::Ignore;
        }
        ctx.add_matrix(matrix.clone());
        self.completion(ctx)
    }

    fn on_transaction_list(&mut self, ctx: &mut RoundContext, pack: &TransactionsPacket) -> Outcome {
        ctx.defer(pack.clone());
        Outcome::Continue
    }

    fn on_block(&mut self, ctx: &mut RoundContext, pool: &Pool, _sender: &PublicKey) -> Outcome {
        store_if_contiguous(ctx, pool);
        Outcome::Continue
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Writer
// ═══════════════════════════════════════════════════════════════════════════

/// The round's writer. Composes the next block, signs it, and broadcasts it.
#[derive(Debug, Default)]
pub struct WriterRole {
    composed: bool,
}

impl RoleBehavior for WriterRole {
    fn name(&self) -> &'static str {
        "Writer"
    }

    fn on_enter(&mut self, ctx: &mut RoundContext) {
        let sequence = ctx.last_stored + 1;
        let payload = ctx.take_block_payload();
        let pool = Pool::new(sequence, payload);
        debug!(round = ctx.round, sequence, "Composing block");
        self.composed = true;
        ctx.emit(Action::BroadcastToNeighbours {
            message: OutboundMessage::Block(pool.clone()),
        });
        ctx.emit(Action::StoreBlock { pool });
    }

    fn on_round_end(&mut self, _ctx: &mut RoundContext) {
        self.composed = false;
    }

    fn on_round_table(&mut self, _ctx: &mut RoundContext, _round: RoundNumber) -> Outcome {
        Outcome::Finish
    }

    fn on_transaction_list(&mut self, ctx: &mut RoundContext, pack: &TransactionsPacket) -> Outcome {
        ctx.defer(pack.clone());
        Outcome::Continue
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Collect
// ═══════════════════════════════════════════════════════════════════════════

/// A trusted node that is not the writer: waits for the writer's block.
#[derive(Debug, Default)]
pub struct CollectRole;

impl RoleBehavior for CollectRole {
    fn name(&self) -> &'static str {
        "Collect"
    }

    fn on_round_table(&mut self, _ctx: &mut RoundContext, _round: RoundNumber) -> Outcome {
        Outcome::Finish
    }

    fn on_block(&mut self, ctx: &mut RoundContext, pool: &Pool, sender: &PublicKey) -> Outcome {
        if *sender != ctx.writer {
            return Outcome::Ignore;
        }
        if store_if_contiguous(ctx, pool) {
            Outcome::Finish
        } else {
            // the writer produced a block we cannot append
            Outcome::Failure
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// WriteTx
// ═══════════════════════════════════════════════════════════════════════════

/// The writer-elect flushing the deferred transaction list before block
/// composition.
#[derive(Debug, Default)]
pub struct WriteTxRole;

impl RoleBehavior for WriteTxRole {
    fn name(&self) -> &'static str {
        "WriteTx"
    }

    fn on_enter(&mut self, ctx: &mut RoundContext) {
        if let Some(pack) = ctx.take_flush() {
            ctx.emit(Action::BroadcastToNeighbours {
                message: OutboundMessage::TransactionList(pack),
            });
        }
        // move on once the last lists arrive, or after one flush period
        ctx.emit(Action::SetTimer {
            id: TimerId::Flush,
            duration: ctx.config.flush_interval,
            periodic: false,
        });
    }

    fn on_exit(&mut self, ctx: &mut RoundContext) {
        ctx.emit(Action::CancelTimer { id: TimerId::Flush });
    }

    fn on_round_table(&mut self, _ctx: &mut RoundContext, _round: RoundNumber) -> Outcome {
        Outcome::Finish
    }

    fn on_transaction_list(&mut self, ctx: &mut RoundContext, pack: &TransactionsPacket) -> Outcome {
        ctx.defer(pack.clone());
        Outcome::Finish
    }

    fn on_timeout(&mut self, _ctx: &mut RoundContext, timer: TimerId) -> Outcome {
        if timer == TimerId::Flush {
            Outcome::Finish
        } else {
            Outcome::Ignore
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Syncing
// ═══════════════════════════════════════════════════════════════════════════

/// The node is behind and the pool synchronizer is catching it up. Consensus
/// events are ignored until the chain reaches the tip.
#[derive(Debug, Default)]
pub struct SyncingRole;

impl RoleBehavior for SyncingRole {
    fn name(&self) -> &'static str {
        "Syncing"
    }

    fn on_round_table(&mut self, _ctx: &mut RoundContext, _round: RoundNumber) -> Outcome {
        Outcome::Continue
    }

    fn on_block(&mut self, ctx: &mut RoundContext, pool: &Pool, _sender: &PublicKey) -> Outcome {
        store_if_contiguous(ctx, pool);
        Outcome::Continue
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tagged variant
// ═══════════════════════════════════════════════════════════════════════════

/// The current role, tagged.
#[derive(Debug)]
pub enum Role {
    Normal(NormalRole),
    Trusted(TrustedRole),
    Writer(WriterRole),
    Collect(CollectRole),
    WriteTx(WriteTxRole),
    Syncing(SyncingRole),
}

impl Role {
    pub fn new(kind: RoleKind) -> Self {
        match kind {
            RoleKind::Normal => Role::Normal(NormalRole::default()),
            RoleKind::Trusted => Role::Trusted(TrustedRole::default()),
            RoleKind::Writer => Role::Writer(WriterRole::default()),
            RoleKind::Collect => Role::Collect(CollectRole),
            RoleKind::WriteTx => Role::WriteTx(WriteTxRole),
            RoleKind::Syncing => Role::Syncing(SyncingRole),
        }
    }

    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Normal(_) => RoleKind::Normal,
            Role::Trusted(_) => RoleKind::Trusted,
            Role::Writer(_) => RoleKind::Writer,
            Role::Collect(_) => RoleKind::Collect,
            Role::WriteTx(_) => RoleKind::WriteTx,
            Role::Syncing(_) => RoleKind::Syncing,
        }
    }

    pub fn behavior(&mut self) -> &mut dyn RoleBehavior {
        match self {
            Role::Normal(role) => role,
            Role::Trusted(role) => role,
            Role::Writer(role) => role,
            Role::Collect(role) => role,
            Role::WriteTx(role) => role,
            Role::Syncing(role) => role,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Role::Normal(_) => "Normal",
            Role::Trusted(_) => "Trusted",
            Role::Writer(_) => "Writer",
            Role::Collect(_) => "Collect",
            Role::WriteTx(_) => "WriteTx",
            Role::Syncing(_) => "Syncing",
        }
    }
}

//! Node state machine.

use conclave_consensus::{ConsensusConfig, ConsensusState};
use conclave_core::{Action, Event, StateMachine, TimerId};
use conclave_sync::{PoolSynchronizer, SyncConfig};
use conclave_types::{PublicKey, Sequence, TransactionsPacket};
use tracing::trace;

/// Combined configuration for the node core.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub consensus: ConsensusConfig,
    pub sync: SyncConfig,
}

/// Combined node state machine.
///
/// Composes the consensus role machine and the pool synchronizer behind a
/// single [`StateMachine`] handle. Both parts are synchronous and mutate
/// only on the runtime's consumer task.
#[derive(Debug)]
pub struct NodeStateMachine {
    consensus: ConsensusState,
    sync: PoolSynchronizer,
}

impl NodeStateMachine {
    pub fn new(config: NodeConfig, own_key: PublicKey, last_stored: Sequence) -> Self {
        Self {
            consensus: ConsensusState::new(config.consensus, own_key, last_stored),
            sync: PoolSynchronizer::new(config.sync, last_stored),
        }
    }

    /// Enter the initial role and arm its timers.
    pub fn start(&mut self) -> Vec<Action> {
        self.consensus.start()
    }

    pub fn consensus(&self) -> &ConsensusState {
        &self.consensus
    }

    pub fn synchronizer(&self) -> &PoolSynchronizer {
        &self.sync
    }

    /// Queue a locally submitted transaction batch for the next flush.
    pub fn add_transaction(&mut self, pack: TransactionsPacket) {
        self.consensus.add_transaction(pack);
    }
}

impl StateMachine for NodeStateMachine {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        trace!(event = event.type_name(), "Handling event");
        match event {
            Event::Timer(TimerId::Sync) => self.sync.on_timer(),
            Event::Timer(TimerId::StoreBlock) => self.sync.on_store_block_timeout(),
            Event::Timer(id) => self.consensus.handle_timeout(id),

            Event::RoundTableReceived { table } => {
                let mut actions = self.consensus.handle_round_table(&table);
                // the synchronizer ages outstanding requests by round
                actions.extend(self.sync.sync(table.round, None));
                actions
            }
            Event::VectorReceived { vector } => self.consensus.handle_vector(&vector),
            Event::MatrixReceived { matrix } => self.consensus.handle_matrix(&matrix),
            Event::TransactionListReceived { pack } => {
                self.consensus.handle_transaction_list(&pack)
            }
            Event::BlockReceived { pool, sender } => self.consensus.handle_block(&pool, &sender),

            Event::BlockRepliesReceived { pools, packet_id } => {
                self.sync.on_block_reply(pools, packet_id)
            }
            Event::PingReceived { key, sequence } => self.sync.on_ping(&key, sequence),

            Event::NeighbourAdded { key, sequence } => self.sync.on_neighbour_added(key, sequence),
            Event::NeighbourRemoved { key } => self.sync.on_neighbour_removed(&key),

            Event::BlockStored { sequence } => {
                self.consensus.on_block_stored(sequence);
                self.sync.on_block_stored(sequence)
            }
            Event::BlockRemoved { sequence } => self.sync.on_block_removed(sequence),

            Event::SyncNeeded { round } => self.sync.sync(round, None),
            Event::SyncFinished { sequence } => {
                self.consensus.on_block_stored(sequence);
                self.consensus.on_sync_finished()
            }
        }
    }
}

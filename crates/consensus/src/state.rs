//! The consensus state machine driver.

use crate::roles::{Outcome, Role, RoleKind};
use conclave_core::{Action, Event, TimerId};
use conclave_types::{HashMatrix, HashVector, Pool, PublicKey, RoundNumber, RoundTable, Sequence,
    TransactionsPacket};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Configuration for the consensus machine.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Transaction flush period in the Normal state.
    pub flush_interval: Duration,
    /// Spam generator period, when enabled.
    pub spam_interval: Duration,
    /// Spam generator switch. Off by default.
    pub spam_enabled: bool,
    /// Upper bound of injected transactions per round per target.
    pub count_trans_in_round: usize,
    /// Distinct spam targets per node.
    pub count_target_wallets: usize,
    /// Round gap behind the table that sends the node into Syncing.
    pub sync_round_difference: u64,
    /// Bounded buffer of contributions from rounds we have not adopted yet.
    pub future_buffer: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(100),
            spam_interval: Duration::from_millis(20),
            spam_enabled: false,
            count_trans_in_round: 100,
            count_target_wallets: 1,
            sync_round_difference: 10,
            future_buffer: 64,
        }
    }
}

/// Per-round data shared by the role states, plus the action sink.
#[derive(Debug)]
pub struct RoundContext {
    pub config: ConsensusConfig,
    pub own_key: PublicKey,
    pub round: RoundNumber,
    pub writer: PublicKey,
    pub confidants: Vec<PublicKey>,
    /// The locally stored tip, mirrored from the chain.
    pub last_stored: Sequence,
    /// Flushes performed during the current round.
    pub flushed_counter: usize,

    vectors: HashMap<PublicKey, HashVector>,
    matrices: HashMap<PublicKey, HashMatrix>,
    deferred: Vec<TransactionsPacket>,
    actions: Vec<Action>,
}

impl RoundContext {
    fn new(config: ConsensusConfig, own_key: PublicKey, last_stored: Sequence) -> Self {
        Self {
            config,
            own_key,
            round: 0,
            writer: PublicKey::zero(),
            confidants: Vec::new(),
            last_stored,
            flushed_counter: 0,
            vectors: HashMap::new(),
            matrices: HashMap::new(),
            deferred: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn emit(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub fn is_writer(&self) -> bool {
        self.own_key == self.writer
    }

    pub fn is_confidant(&self, key: &PublicKey) -> bool {
        self.confidants.contains(key)
    }

    /// Record a vector contribution. Duplicate sender contributions are
    /// suppressed by key, so arrivals are commutative and idempotent.
    pub fn add_vector(&mut self, vector: HashVector) {
        self.vectors.insert(vector.sender, vector);
    }

    pub fn add_matrix(&mut self, matrix: HashMatrix) {
        self.matrices.insert(matrix.sender, matrix);
    }

    pub fn vectors(&self) -> impl Iterator<Item = &HashVector> {
        self.vectors.values()
    }

    /// True when vectors from all confidants of the current round are present.
    pub fn vectors_completed(&self) -> bool {
        !self.confidants.is_empty()
            && self
                .confidants
                .iter()
                .all(|key| self.vectors.contains_key(key))
    }

    pub fn matrices_completed(&self) -> bool {
        !self.confidants.is_empty()
            && self
                .confidants
                .iter()
                .all(|key| self.matrices.contains_key(key))
    }

    /// Queue a transaction batch for the next flush or block.
    pub fn defer(&mut self, pack: TransactionsPacket) {
        self.deferred.push(pack);
    }

    /// Drain the deferred batches into one flushable packet.
    pub fn take_flush(&mut self) -> Option<TransactionsPacket> {
        if self.deferred.is_empty() {
            return None;
        }
        let mut payload = Vec::new();
        for pack in self.deferred.drain(..) {
            payload.extend_from_slice(pack.payload());
        }
        self.flushed_counter += 1;
        Some(TransactionsPacket::new(payload))
    }

    /// Drain everything collected this round into a block body.
    pub fn take_block_payload(&mut self) -> Vec<u8> {
        let mut payload = self.round.to_le_bytes().to_vec();
        for pack in self.deferred.drain(..) {
            payload.extend_from_slice(pack.payload());
        }
        payload
    }

    fn adopt(&mut self, table: &RoundTable) {
        self.round = table.round;
        self.writer = table.writer;
        self.confidants = table.confidants.clone();
        self.vectors.clear();
        self.matrices.clear();
        self.flushed_counter = 0;
    }

    fn drain_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }
}

/// Contributions from rounds we have not adopted yet.
#[derive(Debug)]
enum Buffered {
    Vector(HashVector),
    Matrix(HashMatrix),
}

impl Buffered {
    fn round(&self) -> RoundNumber {
        match self {
            Buffered::Vector(vector) => vector.round,
            Buffered::Matrix(matrix) => matrix.round,
        }
    }
}

/// What produced a Finish/Failure outcome; the transition table
/// distinguishes round boundaries from in-round completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cause {
    RoundTable,
    Event,
}

/// Drives the node through role states and dispatches events.
#[derive(Debug)]
pub struct ConsensusState {
    role: Role,
    ctx: RoundContext,
    future: VecDeque<Buffered>,
}

impl ConsensusState {
    pub fn new(config: ConsensusConfig, own_key: PublicKey, last_stored: Sequence) -> Self {
        Self {
            role: Role::new(RoleKind::Normal),
            ctx: RoundContext::new(config, own_key, last_stored),
            future: VecDeque::new(),
        }
    }

    /// Enter the initial state and arm its timers.
    pub fn start(&mut self) -> Vec<Action> {
        self.role.behavior().on_enter(&mut self.ctx);
        self.ctx.drain_actions()
    }

    pub fn role_kind(&self) -> RoleKind {
        self.role.kind()
    }

    pub fn round(&self) -> RoundNumber {
        self.ctx.round
    }

    pub fn flushed_counter(&self) -> usize {
        self.ctx.flushed_counter
    }

    /// Queue a locally submitted transaction batch.
    pub fn add_transaction(&mut self, pack: TransactionsPacket) {
        self.ctx.defer(pack);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Event handlers
    // ═══════════════════════════════════════════════════════════════════════

    /// Round discipline: strictly newer tables are adopted (ending the
    /// current round and resetting its accumulators), equal tables are
    /// processed, strictly older tables are ignored.
    pub fn handle_round_table(&mut self, table: &RoundTable) -> Vec<Action> {
        if table.round < self.ctx.round {
            trace!(
                round = table.round,
                current = self.ctx.round,
                "Ignoring stale round table"
            );
            return vec![];
        }

        let newer = table.round > self.ctx.round || self.ctx.round == 0;
        if newer {
            self.role.behavior().on_round_end(&mut self.ctx);
            self.ctx.adopt(table);
            debug!(round = table.round, writer = ?table.writer, "Round adopted");
        }

        // falling behind the table means the chain is missing blocks
        let gap = table.round.saturating_sub(self.ctx.last_stored);
        if gap > self.ctx.config.sync_round_difference {
            warn!(
                round = table.round,
                stored = self.ctx.last_stored,
                "Behind the round table, requesting sync"
            );
            self.ctx.emit(Action::EnqueueInternal {
                event: Event::SyncNeeded { round: table.round },
            });
            if self.role.kind() != RoleKind::Syncing {
                self.switch_to(RoleKind::Syncing);
            }
            return self.ctx.drain_actions();
        }

        let outcome = self.role.behavior().on_round_table(&mut self.ctx, table.round);
        self.apply(outcome, Cause::RoundTable);

        if newer {
            self.replay_buffered();
        }
        self.ctx.drain_actions()
    }

    pub fn handle_vector(&mut self, vector: &HashVector) -> Vec<Action> {
        if vector.round < self.ctx.round {
            return vec![];
        }
        if vector.round > self.ctx.round {
            self.buffer(Buffered::Vector(vector.clone()));
            return vec![];
        }
        let outcome = self.role.behavior().on_vector(&mut self.ctx, vector);
        self.apply(outcome, Cause::Event);
        self.ctx.drain_actions()
    }

    pub fn handle_matrix(&mut self, matrix: &HashMatrix) -> Vec<Action> {
        if matrix.round < self.ctx.round {
            return vec![];
        }
        if matrix.round > self.ctx.round {
            self.buffer(Buffered::Matrix(matrix.clone()));
            return vec![];
        }
        let outcome = self.role.behavior().on_matrix(&mut self.ctx, matrix);
        self.apply(outcome, Cause::Event);
        self.ctx.drain_actions()
    }

    pub fn handle_transaction_list(&mut self, pack: &TransactionsPacket) -> Vec<Action> {
        let outcome = self.role.behavior().on_transaction_list(&mut self.ctx, pack);
        self.apply(outcome, Cause::Event);
        self.ctx.drain_actions()
    }

    pub fn handle_block(&mut self, pool: &Pool, sender: &PublicKey) -> Vec<Action> {
        let outcome = self.role.behavior().on_block(&mut self.ctx, pool, sender);
        self.apply(outcome, Cause::Event);
        self.ctx.drain_actions()
    }

    pub fn handle_timeout(&mut self, timer: TimerId) -> Vec<Action> {
        let outcome = self.role.behavior().on_timeout(&mut self.ctx, timer);
        self.apply(outcome, Cause::Event);
        self.ctx.drain_actions()
    }

    /// The chain advanced; mirror the tip.
    pub fn on_block_stored(&mut self, sequence: Sequence) {
        self.ctx.last_stored = self.ctx.last_stored.max(sequence);
    }

    /// The synchronizer reached the tip; re-join the round in the role its
    /// table assigns us.
    pub fn on_sync_finished(&mut self) -> Vec<Action> {
        if self.role.kind() == RoleKind::Syncing {
            let next = self.role_for_round();
            self.switch_to(next);
        }
        self.ctx.drain_actions()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Transitions
    // ═══════════════════════════════════════════════════════════════════════

    fn apply(&mut self, outcome: Outcome, cause: Cause) {
        match outcome {
            Outcome::Continue | Outcome::Ignore => {}
            Outcome::Failure => self.switch_to(RoleKind::Normal),
            Outcome::Finish => {
                if let Some(next) = self.next_role(cause) {
                    self.switch_to(next);
                }
            }
        }
    }

    /// The deterministic `(state, outcome) → next-state` table for Finish.
    fn next_role(&self, cause: Cause) -> Option<RoleKind> {
        if cause == Cause::RoundTable {
            return Some(self.role_for_round());
        }
        match self.role.kind() {
            RoleKind::Trusted => Some(if self.ctx.is_writer() {
                RoleKind::Writer
            } else {
                RoleKind::Collect
            }),
            RoleKind::WriteTx => Some(RoleKind::Writer),
            RoleKind::Collect | RoleKind::Writer => Some(RoleKind::Normal),
            RoleKind::Syncing => Some(self.role_for_round()),
            RoleKind::Normal => None,
        }
    }

    /// The role the current round table assigns this node.
    fn role_for_round(&self) -> RoleKind {
        if self.ctx.is_writer() {
            RoleKind::WriteTx
        } else if self.ctx.is_confidant(&self.ctx.own_key) {
            RoleKind::Trusted
        } else {
            RoleKind::Normal
        }
    }

    fn switch_to(&mut self, kind: RoleKind) {
        debug!(
            from = self.role.name(),
            to = ?kind,
            round = self.ctx.round,
            "Role transition"
        );
        self.role.behavior().on_exit(&mut self.ctx);
        self.role = Role::new(kind);
        self.role.behavior().on_enter(&mut self.ctx);
    }

    fn buffer(&mut self, item: Buffered) {
        if self.future.len() == self.ctx.config.future_buffer {
            self.future.pop_front();
        }
        self.future.push_back(item);
    }

    fn replay_buffered(&mut self) {
        let round = self.ctx.round;
        let mut ready: Vec<Buffered> = Vec::new();
        self.future.retain(|item| item.round() >= round);
        let mut index = 0;
        while index < self.future.len() {
            if self.future[index].round() == round {
                ready.push(self.future.remove(index).expect("in bounds"));
            } else {
                index += 1;
            }
        }
        for item in ready {
            let outcome = match &item {
                Buffered::Vector(vector) => {
                    self.role.behavior().on_vector(&mut self.ctx, vector)
                }
                Buffered::Matrix(matrix) => {
                    self.role.behavior().on_matrix(&mut self.ctx, matrix)
                }
            };
            self.apply(outcome, Cause::Event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_core::OutboundMessage;
    use conclave_types::{Hash, Signature};

    fn key(n: u8) -> PublicKey {
        PublicKey::from_bytes(&[n; 32])
    }

    fn vector(round: RoundNumber, sender: PublicKey) -> HashVector {
        HashVector {
            round,
            sender,
            hash: Hash::digest(sender.as_bytes()),
            signature: Signature::zero(),
        }
    }

    fn matrix(round: RoundNumber, sender: PublicKey) -> HashMatrix {
        HashMatrix {
            round,
            sender,
            vectors: vec![],
        }
    }

    fn table(round: RoundNumber, writer: PublicKey, confidants: Vec<PublicKey>) -> RoundTable {
        RoundTable {
            round,
            writer,
            confidants,
        }
    }

    fn machine(own: PublicKey) -> ConsensusState {
        ConsensusState::new(ConsensusConfig::default(), own, 0)
    }

    fn broadcasts(actions: &[Action]) -> Vec<&'static str> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::BroadcastToNeighbours { message } => Some(message.type_name()),
                Action::SendToConfidants { message } => Some(message.type_name()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn starts_normal_with_a_flush_timer() {
        let mut machine = machine(key(1));
        let actions = machine.start();
        assert_eq!(machine.role_kind(), RoleKind::Normal);
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::SetTimer {
                id: TimerId::Flush,
                periodic: true,
                ..
            }
        )));
    }

    #[test]
    fn round_table_assigns_roles() {
        let own = key(1);
        let mut machine = machine(own);
        machine.start();

        // confidant, not writer
        let actions = machine.handle_round_table(&table(1, key(2), vec![own, key(2)]));
        assert_eq!(machine.role_kind(), RoleKind::Trusted);
        assert!(broadcasts(&actions).contains(&"Vector"));

        // writer next round
        machine.handle_round_table(&table(2, own, vec![own, key(2)]));
        assert_eq!(machine.role_kind(), RoleKind::WriteTx);

        // outsider after that
        machine.handle_round_table(&table(3, key(2), vec![key(2), key(3)]));
        assert_eq!(machine.role_kind(), RoleKind::Normal);
    }

    #[test]
    fn stale_round_tables_are_ignored() {
        let own = key(1);
        let mut machine = machine(own);
        machine.start();
        machine.handle_round_table(&table(5, key(2), vec![own, key(2)]));
        assert_eq!(machine.round(), 5);

        let actions = machine.handle_round_table(&table(3, key(3), vec![key(3)]));
        assert!(actions.is_empty());
        assert_eq!(machine.round(), 5);
        assert_eq!(machine.role_kind(), RoleKind::Trusted);
    }

    #[test]
    fn trusted_completes_into_collect() {
        let own = key(1);
        let other = key(2);
        let mut machine = machine(own);
        machine.start();
        machine.handle_round_table(&table(1, other, vec![own, other]));

        // the other confidant's vector completes the vector set; our matrix
        // goes out to the confidants
        let actions = machine.handle_vector(&vector(1, other));
        assert!(broadcasts(&actions).contains(&"Matrix"));
        assert_eq!(machine.role_kind(), RoleKind::Trusted);

        // the other confidant's matrix completes the matrix set
        machine.handle_matrix(&matrix(1, other));
        assert_eq!(machine.role_kind(), RoleKind::Collect);
    }

    #[test]
    fn trusted_completes_into_writer_for_the_round_writer() {
        let own = key(1);
        let other = key(2);
        let mut machine = machine(own);
        machine.start();
        machine.handle_round_table(&table(1, own, vec![own, other]));
        assert_eq!(machine.role_kind(), RoleKind::WriteTx);

        // flush times out, the writer-elect becomes the writer and composes
        let actions = machine.handle_timeout(TimerId::Flush);
        assert_eq!(machine.role_kind(), RoleKind::Writer);
        assert!(broadcasts(&actions).contains(&"Block"));
        assert!(actions
            .iter()
            .any(|action| matches!(action, Action::StoreBlock { pool } if pool.sequence() == 1)));
    }

    #[test]
    fn duplicate_vectors_are_idempotent() {
        let own = key(1);
        let other = key(2);
        let third = key(3);
        let mut machine = machine(own);
        machine.start();
        machine.handle_round_table(&table(1, other, vec![own, other, third]));

        machine.handle_vector(&vector(1, other));
        let actions = machine.handle_vector(&vector(1, other));
        // still waiting for the third confidant; no matrix yet
        assert!(!broadcasts(&actions).contains(&"Matrix"));
        assert_eq!(machine.role_kind(), RoleKind::Trusted);
    }

    #[test]
    fn round_skip_re_enters_trusted_with_clean_accumulators() {
        let own = key(1);
        let other = key(2);
        let mut machine = machine(own);
        machine.start();
        machine.handle_round_table(&table(1, other, vec![own, other]));
        machine.handle_vector(&vector(1, other));

        // skip ahead two rounds; the machine adopts and re-enters Trusted
        let actions = machine.handle_round_table(&table(3, other, vec![own, other]));
        assert_eq!(machine.round(), 3);
        assert_eq!(machine.role_kind(), RoleKind::Trusted);
        // the prior round's vectors are gone: our fresh vector goes out and
        // the set is incomplete again
        assert!(broadcasts(&actions).contains(&"Vector"));
        let after = machine.handle_vector(&vector(3, other));
        assert!(broadcasts(&after).contains(&"Matrix"));
    }

    #[test]
    fn future_round_contributions_are_buffered() {
        let own = key(1);
        let other = key(2);
        let mut machine = machine(own);
        machine.start();
        machine.handle_round_table(&table(1, other, vec![own, other]));

        // a vector for round 2 arrives before its table
        assert!(machine.handle_vector(&vector(2, other)).is_empty());

        // adopting round 2 replays it: the set completes immediately
        let actions = machine.handle_round_table(&table(2, other, vec![own, other]));
        assert!(broadcasts(&actions).contains(&"Matrix"));
    }

    #[test]
    fn far_ahead_round_table_triggers_sync() {
        let own = key(1);
        let mut machine = machine(own);
        machine.start();

        let actions = machine.handle_round_table(&table(20, key(2), vec![key(2), key(3)]));
        assert_eq!(machine.role_kind(), RoleKind::Syncing);
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::EnqueueInternal {
                event: Event::SyncNeeded { round: 20 }
            }
        )));

        // consensus chatter is ignored while syncing
        assert!(machine.handle_vector(&vector(20, key(2))).is_empty());

        // once the chain catches up, the node re-joins its round role
        machine.on_block_stored(20);
        machine.on_sync_finished();
        assert_eq!(machine.role_kind(), RoleKind::Normal);
    }

    #[test]
    fn collect_stores_the_writers_block() {
        let own = key(1);
        let writer = key(2);
        let mut machine = machine(own);
        machine.start();
        machine.handle_round_table(&table(1, writer, vec![own, writer]));
        machine.handle_vector(&vector(1, writer));
        machine.handle_matrix(&matrix(1, writer));
        assert_eq!(machine.role_kind(), RoleKind::Collect);

        // a block from someone else is not the writer's block
        let ignored = machine.handle_block(&Pool::new(1, vec![1]), &key(9));
        assert!(ignored.is_empty());
        assert_eq!(machine.role_kind(), RoleKind::Collect);

        let actions = machine.handle_block(&Pool::new(1, vec![1]), &writer);
        assert!(actions
            .iter()
            .any(|action| matches!(action, Action::StoreBlock { .. })));
        assert_eq!(machine.role_kind(), RoleKind::Normal);
    }

    #[test]
    fn non_contiguous_writer_block_fails_the_collect_state() {
        let own = key(1);
        let writer = key(2);
        let mut machine = machine(own);
        machine.start();
        machine.handle_round_table(&table(1, writer, vec![own, writer]));
        machine.handle_vector(&vector(1, writer));
        machine.handle_matrix(&matrix(1, writer));
        assert_eq!(machine.role_kind(), RoleKind::Collect);

        // a block that skips ahead cannot be appended
        let actions = machine.handle_block(&Pool::new(5, vec![5]), &writer);
        assert!(!actions
            .iter()
            .any(|action| matches!(action, Action::StoreBlock { .. })));
        assert_eq!(machine.role_kind(), RoleKind::Normal);
    }

    #[test]
    fn normal_flush_broadcasts_collected_transactions() {
        let own = key(1);
        let mut machine = machine(own);
        machine.start();
        machine.add_transaction(TransactionsPacket::new(vec![1, 2, 3]));

        let actions = machine.handle_timeout(TimerId::Flush);
        assert!(broadcasts(&actions).contains(&"TransactionList"));
        assert_eq!(machine.flushed_counter(), 1);

        // nothing left: the next flush is silent
        let actions = machine.handle_timeout(TimerId::Flush);
        assert!(broadcasts(&actions).is_empty());
    }

    #[test]
    fn spam_generator_stays_off_by_default() {
        let own = key(1);
        let mut machine = machine(own);
        let actions = machine.start();
        assert!(!actions.iter().any(|action| matches!(
            action,
            Action::SetTimer {
                id: TimerId::Spam,
                ..
            }
        )));
    }
}

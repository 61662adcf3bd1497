//! Synchronizer state machine implementation.

use conclave_core::{Action, Event, TimerId};
use conclave_types::{BitHeap, Pool, PublicKey, RoundNumber, Sequence};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Configuration for the synchronizer.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum outstanding sequences in total.
    pub blocks_to_sync: u64,
    /// Total failures for one sequence before it is dropped from the window
    /// and re-considered at the next refill.
    pub max_sync_attempts: u32,
    /// A request older than this many rounds is reassigned to another
    /// neighbour.
    pub warns_before_refill: u64,
    /// Round gap that triggers synchronization; the retained meta-storage
    /// window of the chain.
    pub round_difference_for_sync: u64,
    /// Timer fires without progress before neighbours are re-selected.
    pub stall_threshold: u32,
    /// Retry timer period.
    pub request_timer: Duration,
    /// Watchdog period for the chain writer while sequences remain.
    pub store_watchdog: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            blocks_to_sync: 16,
            max_sync_attempts: 8,
            warns_before_refill: 8,
            round_difference_for_sync: 10,
            stall_threshold: 8,
            request_timer: Duration::from_millis(90),
            store_watchdog: Duration::from_millis(900),
        }
    }
}

/// How a sequence is matched when removed from a neighbour's queue.
/// All modes preserve sorted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceRemovalAccuracy {
    /// Remove a single value.
    Exact,
    /// Remove all values at or below.
    LowerBound,
    /// Remove all values at or above.
    UpperBound,
}

/// One neighbour as the synchronizer sees it.
#[derive(Debug)]
struct NeighbourSlot {
    key: PublicKey,
    /// The tip this neighbour last advertised.
    max_sequence: Sequence,
    /// Sequences currently assigned to this neighbour. Strictly sorted.
    sequences: Vec<Sequence>,
    /// Everything ever requested from this neighbour; rejects late or
    /// spurious replies in O(1).
    history: BitHeap,
}

impl NeighbourSlot {
    fn new(key: PublicKey, max_sequence: Sequence) -> Self {
        Self {
            key,
            max_sequence,
            sequences: Vec::new(),
            history: BitHeap::new(),
        }
    }

    fn assign(&mut self, sequence: Sequence) {
        if let Err(pos) = self.sequences.binary_search(&sequence) {
            self.sequences.insert(pos, sequence);
        }
        self.history.push(sequence);
    }

    fn remove(&mut self, sequence: Sequence, accuracy: SequenceRemovalAccuracy) -> bool {
        if self.sequences.is_empty() {
            return false;
        }
        match accuracy {
            SequenceRemovalAccuracy::Exact => match self.sequences.binary_search(&sequence) {
                Ok(pos) => {
                    self.sequences.remove(pos);
                    true
                }
                Err(_) => false,
            },
            SequenceRemovalAccuracy::LowerBound => {
                let upper = self.sequences.partition_point(|s| *s <= sequence);
                if upper == 0 {
                    return false;
                }
                self.sequences.drain(..upper);
                true
            }
            SequenceRemovalAccuracy::UpperBound => {
                let lower = self.sequences.partition_point(|s| *s < sequence);
                if lower == self.sequences.len() {
                    return false;
                }
                self.sequences.truncate(lower);
                true
            }
        }
    }
}

/// Bookkeeping for one outstanding sequence.
#[derive(Debug, Clone, Copy)]
struct RequestMeta {
    /// Round at which the request was last issued.
    round: RoundNumber,
    /// Total failures so far.
    attempts: u32,
}

/// Detects sync need, splits the missing-sequence range across neighbours,
/// requests, tracks, and reconciles replies.
#[derive(Debug)]
pub struct PoolSynchronizer {
    config: SyncConfig,

    started: bool,
    round: RoundNumber,

    /// The locally stored tip, mirrored from the chain via `BlockStored`.
    last_stored: Sequence,
    /// The tip we are syncing toward.
    target: Sequence,

    /// Where this sync pass started, for progress accounting.
    start_sequence: Sequence,
    last_percent: u64,
    stall_counter: u32,
    progressed: bool,

    /// Outstanding sequences and the round each was last issued at.
    requested: BTreeMap<Sequence, RequestMeta>,
    /// Accepted replies handed to the chain but not yet confirmed stored.
    pending_store: BTreeSet<Sequence>,
    neighbours: Vec<NeighbourSlot>,

    packet_counter: u64,
}

impl PoolSynchronizer {
    pub fn new(config: SyncConfig, last_stored: Sequence) -> Self {
        Self {
            config,
            started: false,
            round: 0,
            last_stored,
            target: last_stored,
            start_sequence: last_stored,
            last_percent: 0,
            stall_counter: 0,
            progressed: false,
            requested: BTreeMap::new(),
            pending_store: BTreeSet::new(),
            neighbours: Vec::new(),
            packet_counter: 0,
        }
    }

    pub fn is_syncro_started(&self) -> bool {
        self.started
    }

    pub fn last_stored(&self) -> Sequence {
        self.last_stored
    }

    pub fn target(&self) -> Sequence {
        self.target
    }

    pub fn outstanding(&self) -> usize {
        self.requested.len()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Initiation
    // ═══════════════════════════════════════════════════════════════════════

    /// Start synchronization if the round is far enough ahead of the stored
    /// chain. `difference` defaults to the retained meta-storage window.
    pub fn sync(&mut self, round: RoundNumber, difference: Option<u64>) -> Vec<Action> {
        self.round = self.round.max(round);

        if self.started {
            return self.refill();
        }

        let threshold = difference.unwrap_or(self.config.round_difference_for_sync);
        if round.saturating_sub(self.last_stored) <= threshold {
            return vec![];
        }

        self.start_pass(round)
    }

    /// Begin a pass toward the best advertised tip. `trigger` is whatever
    /// revealed the gap (a round number or an advertised sequence), for the
    /// log only.
    fn start_pass(&mut self, trigger: u64) -> Vec<Action> {
        let Some(best) = self.best_advertised() else {
            trace!(trigger, "Sync needed but no neighbour is ahead");
            return vec![];
        };

        self.begin(best);
        info!(
            trigger,
            target = self.target,
            stored = self.last_stored,
            "Starting synchronization"
        );
        let mut actions = self.start_timers();
        actions.extend(self.refill());
        actions
    }

    /// Request exactly one trailing sequence.
    pub fn sync_last_pool(&mut self) -> Vec<Action> {
        if self.started {
            return vec![];
        }
        let wanted = self.last_stored + 1;
        let Some(slot) = self
            .neighbours
            .iter_mut()
            .filter(|slot| slot.max_sequence >= wanted)
            .max_by_key(|slot| slot.max_sequence)
        else {
            return vec![];
        };

        let key = slot.key;
        slot.assign(wanted);
        self.started = true;
        self.target = wanted;
        self.start_sequence = self.last_stored;
        self.last_percent = 0;
        self.requested.insert(
            wanted,
            RequestMeta {
                round: self.round,
                attempts: 0,
            },
        );
        self.packet_counter += 1;
        debug!(sequence = wanted, ?key, "Requesting trailing pool");

        let mut actions = self.start_timers();
        actions.push(Action::SendBlockRequest {
            target: key,
            sequences: vec![wanted],
            packet_id: self.packet_counter,
        });
        actions
    }

    fn begin(&mut self, target: Sequence) {
        self.started = true;
        self.target = target;
        self.start_sequence = self.last_stored;
        self.last_percent = 0;
        self.stall_counter = 0;
        self.progressed = false;
    }

    fn start_timers(&self) -> Vec<Action> {
        vec![
            Action::SetTimer {
                id: TimerId::Sync,
                duration: self.config.request_timer,
                periodic: true,
            },
            Action::SetTimer {
                id: TimerId::StoreBlock,
                duration: self.config.store_watchdog,
                periodic: true,
            },
        ]
    }

    fn best_advertised(&self) -> Option<Sequence> {
        self.neighbours
            .iter()
            .map(|slot| slot.max_sequence)
            .filter(|max| *max > self.last_stored)
            .max()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Window refill and partitioning
    // ═══════════════════════════════════════════════════════════════════════

    /// Fill the outstanding window with the next missing sequences and
    /// partition them among neighbours by descending advertised tip.
    fn refill(&mut self) -> Vec<Action> {
        if !self.started {
            return vec![];
        }

        let mut room = self
            .config
            .blocks_to_sync
            .saturating_sub(self.requested.len() as u64);
        if room == 0 {
            return vec![];
        }

        let mut needed: Vec<Sequence> = Vec::new();
        let mut candidate = self.last_stored + 1;
        while room > 0 && candidate <= self.target {
            if !self.requested.contains_key(&candidate) && !self.pending_store.contains(&candidate)
            {
                needed.push(candidate);
                room -= 1;
            }
            candidate += 1;
        }
        if needed.is_empty() {
            return vec![];
        }

        self.partition(needed)
    }

    /// Assign `needed` (ascending) across eligible neighbours. Each
    /// neighbour receives a contiguous sub-range bounded by its advertised
    /// tip.
    fn partition(&mut self, needed: Vec<Sequence>) -> Vec<Action> {
        let mut order: Vec<usize> = (0..self.neighbours.len())
            .filter(|i| self.neighbours[*i].max_sequence > self.last_stored)
            .collect();
        if order.is_empty() {
            return vec![];
        }
        order.sort_by(|a, b| {
            self.neighbours[*b]
                .max_sequence
                .cmp(&self.neighbours[*a].max_sequence)
        });

        let chunk = (self.config.blocks_to_sync / order.len() as u64).max(1) as usize;
        let round = self.round;
        let mut actions = Vec::new();
        let mut cursor = needed.into_iter().peekable();

        for index in order {
            let slot = &mut self.neighbours[index];
            let mut assigned = Vec::new();
            while assigned.len() < chunk {
                match cursor.peek() {
                    Some(sequence) if *sequence <= slot.max_sequence => {
                        let sequence = cursor.next().expect("peeked");
                        slot.assign(sequence);
                        self.requested
                            .entry(sequence)
                            .or_insert(RequestMeta { round, attempts: 0 })
                            .round = round;
                        assigned.push(sequence);
                    }
                    _ => break,
                }
            }
            if assigned.is_empty() {
                continue;
            }
            self.packet_counter += 1;
            debug!(?assigned, key = ?slot.key, "Requesting pools");
            actions.push(Action::SendBlockRequest {
                target: slot.key,
                sequences: assigned,
                packet_id: self.packet_counter,
            });
            if cursor.peek().is_none() {
                break;
            }
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Timer: retry, reassignment, stall detection
    // ═══════════════════════════════════════════════════════════════════════

    /// Periodic retry pass.
    pub fn on_timer(&mut self) -> Vec<Action> {
        if !self.started {
            return vec![];
        }

        let mut actions = Vec::new();

        // stall accounting: no block stored since the last fire
        if self.progressed {
            self.stall_counter = 0;
        } else {
            self.stall_counter += 1;
            if self.stall_counter >= self.config.stall_threshold {
                warn!(
                    stored = self.last_stored,
                    target = self.target,
                    "Sync has stalled, re-selecting neighbours"
                );
                self.stall_counter = 0;
                actions.push(Action::ReselectNeighbours);
            }
        }
        self.progressed = false;

        // reassign requests that aged past the refill warning, drop requests
        // that exhausted their attempts
        let warns = self.config.warns_before_refill;
        let round = self.round;
        let aged: Vec<Sequence> = self
            .requested
            .iter()
            .filter(|(sequence, meta)| {
                round.saturating_sub(meta.round) > warns || !self.is_owned(**sequence)
            })
            .map(|(sequence, _)| *sequence)
            .collect();

        let mut reassigned: BTreeMap<PublicKey, Vec<Sequence>> = BTreeMap::new();
        for sequence in aged {
            let attempts = {
                let meta = self.requested.get_mut(&sequence).expect("present");
                meta.attempts += 1;
                meta.round = round;
                meta.attempts
            };
            if attempts >= self.config.max_sync_attempts {
                debug!(sequence, "Sequence exhausted its attempts, dropping");
                self.requested.remove(&sequence);
                for slot in &mut self.neighbours {
                    slot.remove(sequence, SequenceRemovalAccuracy::Exact);
                }
                continue;
            }

            let owner = self.owner_of(sequence);
            let Some(next) = self.pick_other_neighbour(sequence, owner) else {
                continue;
            };
            if let Some(owner) = owner {
                self.neighbours[owner].remove(sequence, SequenceRemovalAccuracy::Exact);
            }
            self.neighbours[next].assign(sequence);
            reassigned
                .entry(self.neighbours[next].key)
                .or_default()
                .push(sequence);
        }

        for (target, sequences) in reassigned {
            self.packet_counter += 1;
            debug!(?sequences, ?target, "Reassigning pool requests");
            actions.push(Action::SendBlockRequest {
                target,
                sequences,
                packet_id: self.packet_counter,
            });
        }

        actions.extend(self.refill());
        actions
    }

    /// The chain writer stalled while sequences remain outstanding:
    /// re-request every current assignment.
    pub fn on_store_block_timeout(&mut self) -> Vec<Action> {
        if !self.started {
            return vec![];
        }
        // whatever we handed to the chain did not land; re-fetch it
        let stored = self.last_stored;
        self.pending_store.retain(|pending| *pending <= stored);
        if self.requested.is_empty() {
            return self.refill();
        }
        let mut actions = Vec::new();
        for index in 0..self.neighbours.len() {
            if self.neighbours[index].sequences.is_empty() {
                continue;
            }
            self.packet_counter += 1;
            actions.push(Action::SendBlockRequest {
                target: self.neighbours[index].key,
                sequences: self.neighbours[index].sequences.clone(),
                packet_id: self.packet_counter,
            });
        }
        actions
    }

    fn owner_of(&self, sequence: Sequence) -> Option<usize> {
        self.neighbours
            .iter()
            .position(|slot| slot.sequences.binary_search(&sequence).is_ok())
    }

    fn is_owned(&self, sequence: Sequence) -> bool {
        self.owner_of(sequence).is_some()
    }

    fn pick_other_neighbour(&self, sequence: Sequence, owner: Option<usize>) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (index, slot) in self.neighbours.iter().enumerate() {
            if Some(index) == owner || slot.max_sequence < sequence {
                continue;
            }
            best = match best {
                Some(current)
                    if self.neighbours[current].max_sequence >= slot.max_sequence =>
                {
                    Some(current)
                }
                _ => Some(index),
            };
        }
        // fall back to the current owner rather than dropping the request
        best.or(owner)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Replies
    // ═══════════════════════════════════════════════════════════════════════

    /// Apply a batch of pools answering one of our requests.
    pub fn on_block_reply(&mut self, pools: Vec<Pool>, packet_id: u64) -> Vec<Action> {
        trace!(packet_id, count = pools.len(), "Block reply");
        let mut actions = Vec::new();

        for pool in pools {
            let sequence = pool.sequence();
            if self.requested.remove(&sequence).is_some() {
                for slot in &mut self.neighbours {
                    slot.remove(sequence, SequenceRemovalAccuracy::Exact);
                }
                self.pending_store.insert(sequence);
                actions.push(Action::StoreBlock { pool });
            } else if sequence == self.last_stored + 1 && !self.pending_store.contains(&sequence) {
                // unknown but contiguous with the chain: accept
                self.pending_store.insert(sequence);
                actions.push(Action::StoreBlock { pool });
            } else if self
                .neighbours
                .iter()
                .any(|slot| slot.history.contains(sequence))
            {
                trace!(sequence, "Late reply for an already settled sequence");
            } else {
                debug!(sequence, "Spurious reply, discarding");
            }
        }
        actions
    }

    /// The chain advanced. Clears implied assignments, reports progress, and
    /// finishes or refills the window.
    pub fn on_block_stored(&mut self, sequence: Sequence) -> Vec<Action> {
        self.last_stored = self.last_stored.max(sequence);
        self.progressed = true;

        // entries at or below the stored tip are implied now
        let stored = self.last_stored;
        self.requested.retain(|requested, _| *requested > stored);
        self.pending_store.retain(|pending| *pending > stored);
        for slot in &mut self.neighbours {
            slot.remove(stored, SequenceRemovalAccuracy::LowerBound);
        }

        if !self.started {
            return vec![];
        }

        self.report_progress();

        if self.requested.is_empty() && self.last_stored >= self.target {
            return self.synchro_finished();
        }
        self.refill()
    }

    /// The chain rolled a block back.
    pub fn on_block_removed(&mut self, sequence: Sequence) -> Vec<Action> {
        if sequence <= self.last_stored {
            self.last_stored = sequence.saturating_sub(1);
        }
        vec![]
    }

    fn report_progress(&mut self) {
        let span = self.target.saturating_sub(self.start_sequence);
        if span == 0 {
            return;
        }
        let done = self.last_stored.saturating_sub(self.start_sequence);
        let percent = done * 100 / span;
        if percent > self.last_percent {
            self.last_percent = percent;
            info!(
                percent,
                stored = self.last_stored,
                target = self.target,
                "Sync progress"
            );
        }
    }

    fn synchro_finished(&mut self) -> Vec<Action> {
        info!(stored = self.last_stored, "Synchronization finished");
        self.started = false;
        self.stall_counter = 0;
        for slot in &mut self.neighbours {
            slot.sequences.clear();
        }
        vec![
            Action::CancelTimer { id: TimerId::Sync },
            Action::CancelTimer {
                id: TimerId::StoreBlock,
            },
            Action::EnqueueInternal {
                event: Event::SyncFinished {
                    sequence: self.last_stored,
                },
            },
        ]
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Neighbourhood membership
    // ═══════════════════════════════════════════════════════════════════════

    pub fn on_neighbour_added(&mut self, key: PublicKey, sequence: Sequence) -> Vec<Action> {
        match self.neighbours.iter_mut().find(|slot| slot.key == key) {
            Some(slot) => slot.max_sequence = slot.max_sequence.max(sequence),
            None => self.neighbours.push(NeighbourSlot::new(key, sequence)),
        }
        if self.started {
            self.refill()
        } else {
            vec![]
        }
    }

    /// A removed neighbour's assignments stay in the requested map without
    /// an owner; the next timer fire reassigns them.
    pub fn on_neighbour_removed(&mut self, key: &PublicKey) -> Vec<Action> {
        self.neighbours.retain(|slot| slot.key != *key);
        vec![]
    }

    /// A peer advertised its tip. A regressed tip sheds assignments the peer
    /// can no longer serve; a fresh tip above the target extends the pass; a
    /// tip farther ahead than the retained window starts one. The round
    /// counter is advanced by round tables alone, never by advertised
    /// heights.
    pub fn on_ping(&mut self, key: &PublicKey, sequence: Sequence) -> Vec<Action> {
        let Some(slot) = self.neighbours.iter_mut().find(|slot| slot.key == *key) else {
            return vec![];
        };

        if sequence < slot.max_sequence {
            slot.remove(sequence + 1, SequenceRemovalAccuracy::UpperBound);
        }
        slot.max_sequence = sequence;

        if self.started && sequence > self.target {
            debug!(?key, sequence, "Sync target extended");
            self.target = sequence;
            return self.refill();
        }
        if !self.started
            && sequence.saturating_sub(self.last_stored) > self.config.round_difference_for_sync
        {
            debug!(?key, sequence, "Far-ahead tip advertised");
            return self.start_pass(sequence);
        }
        vec![]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> PublicKey {
        PublicKey::from_bytes(&[n; 32])
    }

    fn pool(sequence: Sequence) -> Pool {
        Pool::new(sequence, vec![sequence as u8])
    }

    fn requests(actions: &[Action]) -> Vec<(PublicKey, Vec<Sequence>)> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::SendBlockRequest {
                    target, sequences, ..
                } => Some((*target, sequences.clone())),
                _ => None,
            })
            .collect()
    }

    fn stores(actions: &[Action]) -> Vec<Sequence> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::StoreBlock { pool } => Some(pool.sequence()),
                _ => None,
            })
            .collect()
    }

    fn synchronizer() -> PoolSynchronizer {
        PoolSynchronizer::new(SyncConfig::default(), 0)
    }

    #[test]
    fn sync_respects_the_round_difference() {
        let mut sync = synchronizer();
        sync.on_neighbour_added(key(1), 20);
        assert!(sync.sync(5, None).is_empty());
        assert!(!sync.is_syncro_started());
    }

    #[test]
    fn fresh_sync_requests_a_full_window() {
        let mut sync = synchronizer();
        sync.on_neighbour_added(key(1), 20);

        let actions = sync.sync(20, None);
        assert!(sync.is_syncro_started());
        assert_eq!(sync.target(), 20);

        let reqs = requests(&actions);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].0, key(1));
        assert_eq!(reqs[0].1, (1..=16).collect::<Vec<_>>());
    }

    #[test]
    fn window_advances_past_the_first_batch() {
        let mut sync = synchronizer();
        sync.on_neighbour_added(key(1), 20);
        sync.sync(20, None);

        let replies = sync.on_block_reply((1..=16).map(pool).collect(), 1);
        assert_eq!(stores(&replies).len(), 16);

        let mut reqs = Vec::new();
        for sequence in 1..=16 {
            reqs.extend(requests(&sync.on_block_stored(sequence)));
        }
        // replies in flight to storage are never re-requested; the window
        // moves straight on to the tail
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].1, vec![17, 18, 19, 20]);
    }

    #[test]
    fn completion_fires_once_the_tip_is_stored() {
        let mut sync = synchronizer();
        sync.on_neighbour_added(key(1), 3);
        sync.sync(20, Some(0));

        sync.on_block_reply(vec![pool(1), pool(2), pool(3)], 1);
        sync.on_block_stored(1);
        sync.on_block_stored(2);
        let actions = sync.on_block_stored(3);

        assert!(!sync.is_syncro_started());
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::EnqueueInternal {
                event: Event::SyncFinished { sequence: 3 }
            }
        )));
        assert!(actions
            .iter()
            .any(|action| matches!(action, Action::CancelTimer { id: TimerId::Sync })));
    }

    #[test]
    fn needed_range_splits_across_neighbours() {
        let mut sync = synchronizer();
        sync.on_neighbour_added(key(1), 10);
        sync.on_neighbour_added(key(2), 10);

        let actions = sync.sync(20, Some(0));
        let reqs = requests(&actions);
        assert_eq!(reqs.len(), 2);
        // window / neighbours = 8 per chunk
        assert_eq!(reqs[0].1, (1..=8).collect::<Vec<_>>());
        assert_eq!(reqs[1].1, vec![9, 10]);
    }

    #[test]
    fn timed_out_sequences_move_to_another_neighbour() {
        let mut sync = synchronizer();
        sync.on_neighbour_added(key(1), 10);
        sync.on_neighbour_added(key(2), 10);
        sync.sync(20, Some(0));

        // B answers its share, A stays silent
        sync.on_block_reply((9..=10).map(pool).collect(), 2);

        // rounds pass beyond the refill warning
        sync.sync(30, Some(0));
        let actions = sync.on_timer();

        let reqs = requests(&actions);
        assert_eq!(reqs.len(), 1);
        let (target, sequences) = &reqs[0];
        assert_eq!(*target, key(2));
        assert_eq!(*sequences, (1..=8).collect::<Vec<_>>());
    }

    #[test]
    fn exhausted_sequences_drop_out_of_the_window() {
        let config = SyncConfig {
            max_sync_attempts: 1,
            ..Default::default()
        };
        let mut sync = PoolSynchronizer::new(config, 0);
        sync.on_neighbour_added(key(1), 4);
        sync.sync(20, Some(0));
        assert_eq!(sync.outstanding(), 4);

        sync.sync(30, Some(0));
        // first aged pass exhausts the single allowed attempt and drops all
        // four, then the refill re-considers them in the same window
        let actions = sync.on_timer();
        let reqs = requests(&actions);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].1, vec![1, 2, 3, 4]);
    }

    #[test]
    fn spurious_replies_are_discarded() {
        let mut sync = synchronizer();
        sync.on_neighbour_added(key(1), 10);
        sync.sync(20, Some(0));

        // sequence 50 was never requested and is not contiguous
        let actions = sync.on_block_reply(vec![pool(50)], 7);
        assert!(stores(&actions).is_empty());
    }

    #[test]
    fn contiguous_unknown_replies_are_accepted() {
        let mut sync = synchronizer();
        sync.on_neighbour_added(key(1), 10);

        let actions = sync.on_block_reply(vec![pool(1)], 1);
        assert_eq!(stores(&actions), vec![1]);
    }

    #[test]
    fn stored_tip_clears_implied_assignments() {
        let mut sync = synchronizer();
        sync.on_neighbour_added(key(1), 10);
        sync.sync(20, Some(0));
        assert_eq!(sync.outstanding(), 10);

        // the chain advanced past 4 without our replies (another source)
        sync.on_block_stored(4);
        assert_eq!(sync.outstanding(), 6);
        assert_eq!(sync.neighbours[0].sequences, (5..=10).collect::<Vec<_>>());
    }

    #[test]
    fn regressed_ping_sheds_unservable_assignments() {
        let mut sync = synchronizer();
        sync.on_neighbour_added(key(1), 10);
        sync.sync(20, Some(0));

        sync.on_ping(&key(1), 6);
        assert_eq!(sync.neighbours[0].sequences, (1..=6).collect::<Vec<_>>());
        assert_eq!(sync.neighbours[0].max_sequence, 6);
    }

    #[test]
    fn far_ahead_ping_starts_a_pass() {
        let mut sync = synchronizer();
        sync.on_neighbour_added(key(1), 0);

        let actions = sync.on_ping(&key(1), 20);
        assert!(sync.is_syncro_started());
        assert_eq!(sync.target(), 20);
        let reqs = requests(&actions);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].1, (1..=16).collect::<Vec<_>>());
    }

    #[test]
    fn near_tip_ping_does_not_start_a_pass() {
        let mut sync = synchronizer();
        sync.on_neighbour_added(key(1), 0);

        let actions = sync.on_ping(&key(1), 5);
        assert!(!sync.is_syncro_started());
        assert!(actions.is_empty());
    }

    #[test]
    fn fresh_ping_extends_the_target() {
        let mut sync = synchronizer();
        sync.on_neighbour_added(key(1), 4);
        sync.sync(20, Some(0));
        assert_eq!(sync.target(), 4);

        sync.on_ping(&key(1), 6);
        assert_eq!(sync.target(), 6);
    }

    #[test]
    fn stall_forces_neighbour_reselection() {
        let mut sync = synchronizer();
        sync.on_neighbour_added(key(1), 10);
        sync.sync(20, Some(0));

        let mut reselected = false;
        for _ in 0..SyncConfig::default().stall_threshold {
            let actions = sync.on_timer();
            reselected |= actions
                .iter()
                .any(|action| matches!(action, Action::ReselectNeighbours));
        }
        assert!(reselected);
    }

    #[test]
    fn trailing_pool_request_targets_the_best_neighbour() {
        let mut sync = synchronizer();
        sync.on_neighbour_added(key(1), 3);
        sync.on_neighbour_added(key(2), 9);

        let actions = sync.sync_last_pool();
        let reqs = requests(&actions);
        assert_eq!(reqs, vec![(key(2), vec![1])]);
        assert!(sync.is_syncro_started());

        sync.on_block_reply(vec![pool(1)], 1);
        let done = sync.on_block_stored(1);
        assert!(!sync.is_syncro_started());
        assert!(done.iter().any(|action| matches!(
            action,
            Action::EnqueueInternal {
                event: Event::SyncFinished { sequence: 1 }
            }
        )));
    }

    #[test]
    fn removed_neighbour_work_is_reassigned_on_timer() {
        let mut sync = synchronizer();
        sync.on_neighbour_added(key(1), 10);
        sync.on_neighbour_added(key(2), 10);
        sync.sync(20, Some(0));

        sync.on_neighbour_removed(&key(1));
        let actions = sync.on_timer();
        let reqs = requests(&actions);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].0, key(2));
        assert_eq!(reqs[0].1, (1..=8).collect::<Vec<_>>());
    }
}

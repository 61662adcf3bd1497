//! The production event loop.
//!
//! A single task owns the state machine and receives events via an mpsc
//! channel; every action the machine returns is executed here, against the
//! Neighbourhood, the chain, and the scheduler. Internal events produced by
//! actions are processed before new external input, preserving causality.

use crate::metrics;
use crate::scheduler::{CallTag, LaunchScheme, RoundScheduler};
use conclave_core::{
    Action, BlockChain, Event, OutboundMessage, StateMachine, StoreResult, TimerId, Transport,
};
use conclave_network::{
    decode_message, encode_block_request, encode_message, DecodedMessage, Neighbourhood,
};
use conclave_node::NodeStateMachine;
use conclave_types::{BlockRequest, Endpoint, Packet, Pool, PublicKey};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

const TAG_TIMER_SYNC: CallTag = 1;
const TAG_TIMER_FLUSH: CallTag = 2;
const TAG_TIMER_SPAM: CallTag = 3;
const TAG_TIMER_STORE: CallTag = 4;
const TAG_RESEND: CallTag = 10;
const TAG_PING: CallTag = 11;

const RESEND_INTERVAL: Duration = Duration::from_millis(200);
const PING_INTERVAL: Duration = Duration::from_secs(1);

const fn timer_tag(id: TimerId) -> CallTag {
    match id {
        TimerId::Sync => TAG_TIMER_SYNC,
        TimerId::Flush => TAG_TIMER_FLUSH,
        TimerId::Spam => TAG_TIMER_SPAM,
        TimerId::StoreBlock => TAG_TIMER_STORE,
    }
}

/// Owns the state machine and drives it from the event channel.
pub struct Runner {
    state: NodeStateMachine,
    own_key: PublicKey,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    /// Internal events jump the external queue.
    internal: VecDeque<Event>,
    scheduler: RoundScheduler,
    neighbourhood: Arc<Neighbourhood>,
    chain: Arc<dyn BlockChain>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Cheap handle for the threads around the runner: packet intake, event
/// injection, shutdown.
#[derive(Clone)]
pub struct RunnerHandle {
    own_key: PublicKey,
    events_tx: mpsc::UnboundedSender<Event>,
    neighbourhood: Arc<Neighbourhood>,
    chain: Arc<dyn BlockChain>,
    transport: Arc<dyn Transport>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Runner {
    /// Wire the runner. `events` must be the same channel pair the
    /// Neighbourhood publishes membership events to.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: NodeStateMachine,
        own_key: PublicKey,
        scheduler: RoundScheduler,
        neighbourhood: Arc<Neighbourhood>,
        chain: Arc<dyn BlockChain>,
        transport: Arc<dyn Transport>,
        events_tx: mpsc::UnboundedSender<Event>,
        events_rx: mpsc::UnboundedReceiver<Event>,
    ) -> (Self, RunnerHandle) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = RunnerHandle {
            own_key,
            events_tx: events_tx.clone(),
            neighbourhood: neighbourhood.clone(),
            chain: chain.clone(),
            transport,
            shutdown_tx: Arc::new(shutdown_tx),
        };
        (
            Self {
                state,
                own_key,
                events_tx,
                events_rx,
                internal: VecDeque::new(),
                scheduler,
                neighbourhood,
                chain,
                shutdown_rx,
            },
            handle,
        )
    }

    /// Run until shutdown. Consumes the runner; the state machine is only
    /// ever touched from this task.
    pub async fn run(mut self) {
        info!(key = ?self.own_key, "Runner starting");
        self.arm_maintenance();
        let initial = self.state.start();
        self.execute(initial);

        loop {
            let event = if let Some(event) = self.internal.pop_front() {
                event
            } else {
                tokio::select! {
                    changed = self.shutdown_rx.changed() => {
                        if changed.is_err() || *self.shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                    received = self.events_rx.recv() => match received {
                        Some(event) => event,
                        None => break,
                    },
                }
            };

            // the confidant roster follows the round table
            if let Event::RoundTableReceived { table } = &event {
                self.neighbourhood.reset_confidants();
                for key in &table.confidants {
                    self.neighbourhood.add_confidant(*key);
                }
            }

            let actions = self.state.handle(event);
            self.execute(actions);
            metrics::set_neighbour_count(self.neighbourhood.neighbour_count());
        }

        self.scheduler.cancel_all();
        info!("Runner stopped");
    }

    /// Roster upkeep that runs regardless of consensus state.
    fn arm_maintenance(&self) {
        let hood = self.neighbourhood.clone();
        self.scheduler.schedule(
            RESEND_INTERVAL,
            LaunchScheme::Periodic,
            TAG_RESEND,
            move || {
                let struck = hood.resend_pending();
                metrics::record_strikes(struck);
            },
        );

        let hood = self.neighbourhood.clone();
        let chain = self.chain.clone();
        let own_key = self.own_key;
        self.scheduler
            .schedule(PING_INTERVAL, LaunchScheme::Periodic, TAG_PING, move || {
                let sequence = chain.last_sequence();
                match encode_message(&own_key, &OutboundMessage::Ping { sequence }) {
                    Ok(packet) => {
                        hood.send_by_neighbours(&packet);
                    }
                    Err(error) => warn!(%error, "Failed to frame ping"),
                }

                let mut best_advertised = 0;
                hood.for_each_neighbour(|peer| {
                    best_advertised = best_advertised.max(peer.last_sequence);
                });
                if best_advertised > sequence {
                    debug!(
                        stored = sequence,
                        best_advertised, "Neighbours are ahead of the local chain"
                    );
                }
            });
    }

    fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            trace!(action = action.type_name(), "Executing action");
            match action {
                Action::BroadcastToNeighbours { message } => self.send(message, SendPath::Neighbours),
                Action::SendToConfidants { message } => self.send(message, SendPath::Confidants),
                Action::SendTo { target, message } => self.send(message, SendPath::Direct(target)),

                Action::SendBlockRequest {
                    target,
                    sequences,
                    packet_id,
                } => {
                    let request = BlockRequest {
                        target,
                        packet_id,
                        sequences,
                    };
                    let packet = encode_block_request(&request);
                    metrics::record_block_request();
                    metrics::record_packet_sent();
                    self.neighbourhood.send_to(&request.target, &packet);
                }

                Action::ReselectNeighbours => {
                    self.neighbourhood
                        .reselect_neighbours(self.chain.last_sequence());
                }

                Action::SetTimer {
                    id,
                    duration,
                    periodic,
                } => {
                    let tag = timer_tag(id);
                    let scheme = if periodic {
                        LaunchScheme::Periodic
                    } else {
                        LaunchScheme::Single
                    };
                    // setting an armed timer replaces it
                    self.scheduler.cancel(tag);
                    let events_tx = self.events_tx.clone();
                    self.scheduler.schedule(duration, scheme, tag, move || {
                        let _ = events_tx.send(Event::Timer(id));
                    });
                }

                Action::CancelTimer { id } => self.scheduler.cancel(timer_tag(id)),

                Action::StoreBlock { pool } => self.store_block(pool),

                Action::EnqueueInternal { event } => self.internal.push_back(event),
            }
        }
    }

    fn store_block(&mut self, pool: Pool) {
        let sequence = pool.sequence();
        let before = self.chain.last_sequence();
        match self.chain.store_block(pool) {
            StoreResult::Stored => {
                let after = self.chain.last_sequence();
                for stored in (before + 1)..=after {
                    self.internal.push_back(Event::BlockStored { sequence: stored });
                }
                if after > before {
                    metrics::record_block_stored(after);
                } else {
                    trace!(sequence, "Block cached ahead of the chain tip");
                }
            }
            StoreResult::Duplicate => debug!(sequence, "Duplicate block ignored"),
            StoreResult::Invalid => warn!(sequence, "Chain rejected block"),
        }
    }

    fn send(&self, message: OutboundMessage, path: SendPath) {
        let kind = message.type_name();
        match encode_message(&self.own_key, &message) {
            Ok(packet) => {
                metrics::record_packet_sent();
                match path {
                    SendPath::Neighbours => self.neighbourhood.send_by_neighbours(&packet),
                    SendPath::Confidants => self.neighbourhood.send_by_confidants(&packet),
                    SendPath::Direct(target) => self.neighbourhood.send_to(&target, &packet),
                }
            }
            Err(error) => warn!(%error, kind, "Failed to frame message"),
        }
    }
}

enum SendPath {
    Neighbours,
    Confidants,
    Direct(PublicKey),
}

impl RunnerHandle {
    /// Inject an event from outside the loop (transport glue, tests).
    pub fn send_event(&self, event: Event) {
        let _ = self.events_tx.send(event);
    }

    /// Stop the runner after the event in flight.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Entry point for the transport threads: decode one datagram.
    ///
    /// Structural errors are logged and dropped; a peer sending garbage
    /// takes a strike.
    pub fn on_packet(&self, bytes: Vec<u8>, remote: Endpoint) {
        metrics::record_packet_received();

        let packet = match Packet::parse(bytes) {
            Ok(packet) => packet,
            Err(error) => {
                metrics::record_packet_dropped();
                debug!(%error, %remote, "Malformed packet");
                return;
            }
        };

        let sender = packet.header().sender;
        if let Some(sender) = sender {
            // refresh the peer table and suppress echoing this hash back
            if let Err(error) = self.neighbourhood.register(sender, remote) {
                debug!(%error, ?sender, "Peer not registered");
            }
            self.neighbourhood
                .neighbour_sent_packet(&sender, &packet.hash());
        }

        match decode_message(&packet) {
            Ok(DecodedMessage::Event(event)) => {
                if let Event::PingReceived { key, sequence } = &event {
                    self.neighbourhood.update_sequence(key, *sequence);
                }
                let _ = self.events_tx.send(event);
            }
            Ok(DecodedMessage::BlockRequest(request)) => {
                self.serve_block_request(request, remote);
            }
            Err(error) => {
                metrics::record_packet_dropped();
                debug!(%error, %remote, "Undecodable payload");
                if let Some(sender) = sender {
                    self.neighbourhood.strike(&sender);
                    metrics::record_strikes(1);
                }
            }
        }
    }

    /// Answer a block request straight from storage; no state-machine round
    /// trip.
    fn serve_block_request(&self, request: BlockRequest, remote: Endpoint) {
        if request.target != self.own_key {
            trace!(?request.target, "Block request for someone else");
            return;
        }
        let pools: Vec<Pool> = request
            .sequences
            .iter()
            .filter_map(|sequence| self.chain.get_block(*sequence))
            .collect();
        if pools.is_empty() {
            return;
        }
        debug!(count = pools.len(), %remote, "Serving block request");
        let message = OutboundMessage::BlockReply {
            packet_id: request.packet_id,
            pools,
        };
        match encode_message(&self.own_key, &message) {
            Ok(packet) => {
                metrics::record_packet_sent();
                self.transport.send(remote, packet.bytes());
            }
            Err(error) => warn!(%error, "Failed to frame block reply"),
        }
    }
}

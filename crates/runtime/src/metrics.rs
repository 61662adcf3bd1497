//! Runtime metrics using the native Prometheus client.
//!
//! Metrics are domain-specific rather than generic event counters. Use
//! traces for event-level granularity during investigations.

use prometheus::{register_counter, register_gauge, Counter, Gauge};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Domain-specific gauges and counters.
pub struct Metrics {
    // === Chain ===
    pub blocks_stored: Counter,
    pub chain_height: Gauge,

    // === Sync ===
    pub sync_progress_percent: Gauge,
    pub block_requests_sent: Counter,

    // === Neighbourhood ===
    pub neighbour_count: Gauge,
    pub strikes_issued: Counter,

    // === Transport ===
    pub packets_sent: Counter,
    pub packets_received: Counter,
    pub packets_dropped: Counter,
}

impl Metrics {
    fn new() -> Self {
        Self {
            blocks_stored: register_counter!(
                "conclave_blocks_stored_total",
                "Blocks handed to the chain and confirmed stored"
            )
            .expect("register blocks_stored"),
            chain_height: register_gauge!(
                "conclave_chain_height",
                "The locally stored tip sequence"
            )
            .expect("register chain_height"),
            sync_progress_percent: register_gauge!(
                "conclave_sync_progress_percent",
                "Whole-integer sync progress of the current pass"
            )
            .expect("register sync_progress_percent"),
            block_requests_sent: register_counter!(
                "conclave_block_requests_sent_total",
                "Block request packets issued to neighbours"
            )
            .expect("register block_requests_sent"),
            neighbour_count: register_gauge!(
                "conclave_neighbour_count",
                "Active neighbours in the roster"
            )
            .expect("register neighbour_count"),
            strikes_issued: register_counter!(
                "conclave_strikes_issued_total",
                "Strikes recorded against peers"
            )
            .expect("register strikes_issued"),
            packets_sent: register_counter!(
                "conclave_packets_sent_total",
                "Framed packets handed to the transport"
            )
            .expect("register packets_sent"),
            packets_received: register_counter!(
                "conclave_packets_received_total",
                "Framed packets received from the transport"
            )
            .expect("register packets_received"),
            packets_dropped: register_counter!(
                "conclave_packets_dropped_total",
                "Inbound packets dropped as malformed"
            )
            .expect("register packets_dropped"),
        }
    }
}

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub fn record_block_stored(height: u64) {
    let m = metrics();
    m.blocks_stored.inc();
    m.chain_height.set(height as f64);
}

pub fn record_block_request() {
    metrics().block_requests_sent.inc();
}

pub fn record_packet_sent() {
    metrics().packets_sent.inc();
}

pub fn record_packet_received() {
    metrics().packets_received.inc();
}

pub fn record_packet_dropped() {
    metrics().packets_dropped.inc();
}

pub fn record_strikes(count: usize) {
    if count > 0 {
        metrics().strikes_issued.inc_by(count as f64);
    }
}

pub fn set_neighbour_count(count: usize) {
    metrics().neighbour_count.set(count as f64);
}

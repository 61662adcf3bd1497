//! Runtime shell for the conclave node core.
//!
//! Everything that blocks or performs I/O lives here:
//!
//! - [`RoundScheduler`] / [`DeferredCallQueue`]: a single-consumer
//!   cooperative scheduler for delayed and periodic callbacks tagged by
//!   identifier
//! - [`Rendezvous`]: the synchronous signal-and-wait primitive keyed by a
//!   signature
//! - [`Runner`]: the event loop that owns the state machine, executes its
//!   actions against the Neighbourhood and the chain, and feeds results back
//!   as events
//! - `metrics` / `telemetry`: Prometheus gauges and the tracing subscriber
//!   installer

pub mod metrics;
mod rendezvous;
mod runner;
mod scheduler;
pub mod telemetry;

pub use rendezvous::{Condition, Rendezvous};
pub use runner::{Runner, RunnerHandle};
pub use scheduler::{CallTag, DeferredCallQueue, LaunchScheme, RoundScheduler, NO_TAG};

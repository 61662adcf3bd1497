//! Synchronous signal-and-wait keyed by a signature.
//!
//! Correlates an outgoing request with its response when the caller is
//! blocking: the requester registers a waiter under the request's signature
//! and parks; whoever observes the response signals the same signature. The
//! condition is latched, so a signal that lands before the waiter parks
//! still completes the wait immediately.

use conclave_types::Signature;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::trace;

/// Base wait slice; the effective timeout is `slice × multiplier`.
pub const WAIT_SLICE: Duration = Duration::from_millis(30);
const DEFAULT_MULTIPLIER: u32 = 100;

/// What the waiter observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Success,
    Rejected,
    TimeOut,
    Expired,
}

/// One-shot rendezvous registry.
///
/// At most one outstanding waiter per signature; the entry is released after
/// the waiter observes the condition or after expiry.
pub struct Rendezvous {
    slots: Mutex<HashMap<Signature, Option<Condition>>>,
    cvar: Condvar,
    timeout: Duration,
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}

impl Rendezvous {
    pub fn new() -> Self {
        Self::with_timeout(WAIT_SLICE * DEFAULT_MULTIPLIER)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            cvar: Condvar::new(),
            timeout,
        }
    }

    /// Register a waiter. Returns false if one is already present for this
    /// signature.
    pub fn add(&self, signature: Signature) -> bool {
        let mut slots = self.slots.lock();
        if slots.contains_key(&signature) {
            return false;
        }
        slots.insert(signature, None);
        true
    }

    /// Block until the signature is signalled or the timeout elapses.
    /// Returns `Expired` if the signature was never registered.
    pub fn wait(&self, signature: &Signature) -> Condition {
        let deadline = Instant::now() + self.timeout;
        let mut slots = self.slots.lock();
        loop {
            match slots.get(signature) {
                None => return Condition::Expired,
                Some(Some(condition)) => {
                    let condition = *condition;
                    slots.remove(signature);
                    return condition;
                }
                Some(None) => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                slots.remove(signature);
                trace!("Rendezvous wait timed out");
                return Condition::TimeOut;
            }
            // spurious and foreign wakeups loop back to the slot check
            self.cvar.wait_for(&mut slots, remaining);
        }
    }

    /// Wake the waiter registered under `signature` with `condition`. Safe
    /// to call before the waiter parks; the condition is latched. A signal
    /// for an unknown signature is dropped.
    pub fn signal(&self, signature: &Signature, condition: Condition) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(signature) {
            *slot = Some(condition);
            self.cvar.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn signature(n: u8) -> Signature {
        Signature::from_bytes(&[n; 64])
    }

    #[test]
    fn signal_wakes_a_parked_waiter() {
        let rendezvous = Arc::new(Rendezvous::new());
        let sig = signature(1);
        assert!(rendezvous.add(sig));

        let signaller = rendezvous.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            signaller.signal(&sig, Condition::Success);
        });

        let started = Instant::now();
        assert_eq!(rendezvous.wait(&sig), Condition::Success);
        assert!(started.elapsed() < Duration::from_millis(30));
        handle.join().unwrap();
    }

    #[test]
    fn signal_before_wait_is_latched() {
        let rendezvous = Rendezvous::new();
        let sig = signature(2);
        assert!(rendezvous.add(sig));
        rendezvous.signal(&sig, Condition::Rejected);

        let started = Instant::now();
        assert_eq!(rendezvous.wait(&sig), Condition::Rejected);
        assert!(started.elapsed() < Duration::from_millis(5));
    }

    #[test]
    fn double_add_is_refused() {
        let rendezvous = Rendezvous::new();
        let sig = signature(3);
        assert!(rendezvous.add(sig));
        assert!(!rendezvous.add(sig));
    }

    #[test]
    fn wait_times_out_without_a_signal() {
        let rendezvous = Rendezvous::with_timeout(Duration::from_millis(20));
        let sig = signature(4);
        assert!(rendezvous.add(sig));
        assert_eq!(rendezvous.wait(&sig), Condition::TimeOut);
        // the entry is released: a fresh add is accepted again
        assert!(rendezvous.add(sig));
    }

    #[test]
    fn waiting_on_an_unknown_signature_expires() {
        let rendezvous = Rendezvous::new();
        assert_eq!(rendezvous.wait(&signature(5)), Condition::Expired);
    }

    #[test]
    fn entry_is_released_after_observation() {
        let rendezvous = Rendezvous::new();
        let sig = signature(6);
        assert!(rendezvous.add(sig));
        rendezvous.signal(&sig, Condition::Success);
        assert_eq!(rendezvous.wait(&sig), Condition::Success);
        // consumed: a second wait without add expires
        assert_eq!(rendezvous.wait(&sig), Condition::Expired);
    }
}

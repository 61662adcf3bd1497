//! Tagged deferred-call scheduling.
//!
//! Producers on any thread schedule callbacks; a single consumer dequeues
//! and invokes them in FIFO order, so no callback is ever re-entrant with
//! itself and core handlers never run concurrently. Firing tasks are tokio
//! timers; cancellation is checked at every firing boundary, never
//! mid-flight.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Identifies a scheduled call.
pub type CallTag = u64;

/// The tag no call will ever get; returned when a schedule is rejected.
pub const NO_TAG: CallTag = 0;

/// First tag handed out when the caller lets the scheduler pick.
const AUTO_TAG_BASE: CallTag = 1 << 32;

/// Launch schemes for scheduled calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchScheme {
    /// Fire once after the delay.
    Single,
    /// Fire repeatedly every delay until cancelled.
    Periodic,
}

type Callback = Box<dyn FnMut() + Send>;

/// Remaining firings for one tag. `remains = None` means unbounded
/// (periodic). The generation pins the entry to the task that armed it, so
/// a cancel-then-reschedule of the same tag orphans the old firing task.
#[derive(Debug)]
struct Entry {
    remains: Option<u32>,
    generation: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CallTag, Entry>,
    next_auto: CallTag,
    next_generation: u64,
}

struct QueuedCall {
    tag: CallTag,
    cb: Arc<Mutex<Callback>>,
}

/// Schedules delayed and periodic callbacks by tag.
///
/// Cloning shares the underlying schedule, so any thread may produce.
#[derive(Clone)]
pub struct RoundScheduler {
    inner: Arc<Mutex<Inner>>,
    queue: mpsc::UnboundedSender<QueuedCall>,
}

/// The consumer half: dequeues and invokes callbacks in FIFO order.
pub struct DeferredCallQueue {
    rx: mpsc::UnboundedReceiver<QueuedCall>,
}

impl DeferredCallQueue {
    /// Run the consumer until every scheduler clone is dropped.
    pub async fn run(mut self) {
        while let Some(call) = self.rx.recv().await {
            trace!(tag = call.tag, "Invoking deferred call");
            (call.cb.lock())();
        }
    }
}

impl RoundScheduler {
    pub fn new() -> (Self, DeferredCallQueue) {
        let (queue, rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Arc::new(Mutex::new(Inner {
                    entries: HashMap::new(),
                    next_auto: AUTO_TAG_BASE,
                    next_generation: 0,
                })),
                queue,
            },
            DeferredCallQueue { rx },
        )
    }

    /// Schedule a callback. Returns the tag, or [`NO_TAG`] when a task with
    /// the same tag is already scheduled (idempotent guard).
    ///
    /// Pass [`NO_TAG`] to let the scheduler pick a fresh tag.
    pub fn schedule(
        &self,
        delay: Duration,
        scheme: LaunchScheme,
        tag: CallTag,
        cb: impl FnMut() + Send + 'static,
    ) -> CallTag {
        let (tag, generation) = {
            let mut inner = self.inner.lock();
            let tag = if tag == NO_TAG {
                inner.next_auto += 1;
                inner.next_auto
            } else {
                tag
            };
            if inner.entries.contains_key(&tag) {
                trace!(tag, "Schedule rejected, tag already pending");
                return NO_TAG;
            }
            inner.next_generation += 1;
            let generation = inner.next_generation;
            inner.entries.insert(
                tag,
                Entry {
                    remains: match scheme {
                        LaunchScheme::Single => Some(1),
                        LaunchScheme::Periodic => None,
                    },
                    generation,
                },
            );
            (tag, generation)
        };
        debug!(tag, ?delay, ?scheme, "Scheduled call");

        let inner = self.inner.clone();
        let queue = self.queue.clone();
        let cb: Arc<Mutex<Callback>> = Arc::new(Mutex::new(Box::new(cb)));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;

                // firing boundary: consult the schedule before dispatching
                let (fire, stop) = {
                    let mut guard = inner.lock();
                    let verdict = match guard.entries.get_mut(&tag) {
                        // gone, or re-armed by a newer schedule of this tag
                        None => (false, true),
                        Some(entry) if entry.generation != generation => (false, true),
                        Some(entry) => match &mut entry.remains {
                            Some(0) => (false, true),
                            Some(remains) => {
                                *remains -= 1;
                                (true, *remains == 0)
                            }
                            None => (true, false),
                        },
                    };
                    if verdict.1 {
                        let owned = guard
                            .entries
                            .get(&tag)
                            .is_some_and(|entry| entry.generation == generation);
                        if owned {
                            guard.entries.remove(&tag);
                        }
                    }
                    verdict
                };
                if fire {
                    let _ = queue.send(QueuedCall {
                        tag,
                        cb: cb.clone(),
                    });
                }
                if stop {
                    break;
                }
            }
        });
        tag
    }

    /// Remove pending future invocations of `tag`. Invocations already
    /// dispatched to the consumer still run to completion.
    pub fn cancel(&self, tag: CallTag) {
        if self.inner.lock().entries.remove(&tag).is_some() {
            debug!(tag, "Cancelled call");
        }
    }

    /// Let the task fire `count` more times, then stop. Never extends an
    /// already shorter budget and never bounds a task into more firings than
    /// it had.
    pub fn cancel_after(&self, tag: CallTag, count: u32) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&tag) {
            match entry.remains {
                Some(remains) if remains <= count => {}
                _ => entry.remains = Some(count),
            }
        }
    }

    /// Cancel everything this scheduler instance has pending.
    pub fn cancel_all(&self) {
        let mut inner = self.inner.lock();
        let count = inner.entries.len();
        inner.entries.clear();
        if count > 0 {
            debug!(count, "Cancelled all calls");
        }
    }

    pub fn is_scheduled(&self, tag: CallTag) -> bool {
        self.inner.lock().entries.contains_key(&tag)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

//! Per-connection timers.
//!
//! Timers are owned by the connection task: the task sleeps until
//! [`TimerQueue::next_deadline`] and then calls [`TimerQueue::fire_expired`],
//! so callbacks always run on the same task that decodes frames.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Callback run when a timer expires.
pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// Handle to a started timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Something that can run a callback after a delay.
pub trait TimerService: Send + Sync {
    /// Starts a timer. The callback runs at most once.
    fn start(&self, timeout: Duration, callback: TimerCallback) -> TimerId;

    /// Cancels a timer. Returns false if it already fired or was cancelled.
    fn cancel(&self, id: TimerId) -> bool;
}

#[derive(Default)]
struct TimerState {
    next_id: u64,
    entries: BTreeMap<(Instant, TimerId), TimerCallback>,
    deadlines: HashMap<TimerId, Instant>,
}

/// Deadline-ordered timer queue driven by its owner.
#[derive(Default)]
pub struct TimerQueue {
    state: Mutex<TimerState>,
    changed: Notify,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.state
            .lock()
            .entries
            .keys()
            .next()
            .map(|(deadline, _)| *deadline)
    }

    /// Waits until a timer is started or cancelled.
    pub async fn changed(&self) {
        self.changed.notified().await
    }

    /// Runs every callback whose deadline is at or before `now`, in deadline
    /// order. Returns the number of callbacks run.
    ///
    /// Callbacks run without the lock held, so they may start new timers.
    pub fn fire_expired(&self, now: Instant) -> usize {
        let mut fired = 0;
        loop {
            let callback = {
                let mut state = self.state.lock();
                let key = match state.entries.keys().next() {
                    Some(key) if key.0 <= now => *key,
                    _ => break,
                };
                state.deadlines.remove(&key.1);
                state.entries.remove(&key)
            };
            if let Some(callback) = callback {
                callback();
                fired += 1;
            }
        }
        fired
    }

    /// Drops every pending callback without running it.
    pub fn clear(&self) {
        let entries = {
            let mut state = self.state.lock();
            state.deadlines.clear();
            std::mem::take(&mut state.entries)
        };
        drop(entries);
        self.changed.notify_one();
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TimerService for TimerQueue {
    fn start(&self, timeout: Duration, callback: TimerCallback) -> TimerId {
        let deadline = Instant::now() + timeout;
        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let id = TimerId(state.next_id);
            state.entries.insert((deadline, id), callback);
            state.deadlines.insert(id, deadline);
            id
        };
        self.changed.notify_one();
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        // The callback may own a request; drop it after the lock is released.
        let removed = {
            let mut state = self.state.lock();
            state
                .deadlines
                .remove(&id)
                .and_then(|deadline| state.entries.remove(&(deadline, id)))
        };
        let cancelled = removed.is_some();
        drop(removed);
        if cancelled {
            self.changed.notify_one();
        }
        cancelled
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("pending", &self.len())
            .finish()
    }
}

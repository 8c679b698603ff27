//! Timed coalescing in front of a [`MessageBatcher`].

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use varsync_core::{Message, Priority};

use crate::batcher::MessageBatcher;

/// When queued messages leave the batcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Flush once nothing new has arrived for the window. Every enqueue
    /// restarts the window.
    Trailing(Duration),
    /// Flush a fixed delay after the first enqueue of a batch.
    Fixed(Duration),
}

impl FlushPolicy {
    fn delay(self) -> Duration {
        match self {
            Self::Trailing(d) | Self::Fixed(d) => d,
        }
    }
}

/// Receives each flushed batch, in flush order.
pub type Sink = Arc<dyn Fn(Vec<Message>) + Send + Sync>;

struct State {
    batcher: MessageBatcher,
    /// Bumped whenever a pending timer becomes obsolete.
    generation: u64,
    armed: bool,
}

/// Accumulates messages and hands them to a sink according to a
/// [`FlushPolicy`]. Messages flagged as user-triggered flush at once,
/// together with anything already queued.
pub struct OutgoingBatcher {
    state: Arc<Mutex<State>>,
    policy: FlushPolicy,
    sink: Sink,
}

impl OutgoingBatcher {
    pub fn new(policy: FlushPolicy, sink: Sink) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                batcher: MessageBatcher::new(),
                generation: 0,
                armed: false,
            })),
            policy,
            sink,
        }
    }

    pub fn policy(&self) -> FlushPolicy {
        self.policy
    }

    pub fn enqueue(&self, items: Vec<(Priority, Message)>, user_event: bool) {
        if items.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for (priority, message) in items {
            state.batcher.push(priority, message);
        }
        if user_event || self.policy.delay().is_zero() {
            flush_locked(&mut state, &self.sink);
            return;
        }
        match self.policy {
            FlushPolicy::Trailing(delay) => {
                state.generation += 1;
                state.armed = true;
                self.arm(state.generation, delay);
            }
            FlushPolicy::Fixed(delay) => {
                if !state.armed {
                    state.generation += 1;
                    state.armed = true;
                    self.arm(state.generation, delay);
                }
            }
        }
    }

    /// Flush whatever is queued without waiting for the timer.
    pub fn flush_now(&self) {
        let mut state = self.state.lock();
        flush_locked(&mut state, &self.sink);
    }

    pub fn pending(&self) -> usize {
        self.state.lock().batcher.len()
    }

    fn arm(&self, generation: u64, delay: Duration) {
        let weak: Weak<Mutex<State>> = Arc::downgrade(&self.state);
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(state) = weak.upgrade() else {
                return;
            };
            let mut state = state.lock();
            if state.generation == generation {
                flush_locked(&mut state, &sink);
            }
        });
    }
}

/// The sink runs under the lock so consecutive flushes reach it in order.
fn flush_locked(state: &mut State, sink: &Sink) {
    state.generation += 1;
    state.armed = false;
    if state.batcher.is_empty() {
        return;
    }
    let messages = state.batcher.flush();
    sink(messages);
}

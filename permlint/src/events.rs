//! Typed event streams.
//!
//! Components that publish events (the metrics collector, the invalidation
//! manager) hold a [`Subscribers`] list. Each call to `subscribe` hands out the
//! receiving end of a fresh channel; receivers that have been dropped are
//! pruned on the next publish.

use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};

use tracing::trace;

/// Fan-out list of channel subscribers.
#[derive(Debug)]
pub struct Subscribers<T> {
    senders: Mutex<Vec<Sender<T>>>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> Subscribers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = mpsc::channel();
        self.lock().push(tx);
        rx
    }

    /// Sends `event` to every live subscriber. Returns how many received it.
    pub fn publish(&self, event: T) -> usize {
        let mut senders = self.lock();
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        trace!(subscribers = senders.len(), "event published");
        senders.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Sender<T>>> {
        // A panic while holding the lock leaves the list usable.
        self.senders.lock().unwrap_or_else(|e| e.into_inner())
    }
}

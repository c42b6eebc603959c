//! One-shot request/completion rendezvous.
//!
//! A caller arms a [`Rendezvous`], issues a stack request and awaits the
//! returned [`Pending`]. The event-dispatch path calls
//! [`Rendezvous::signal`] when it sees the matching completion event.
//! Events that arrive while nothing is armed are not consumed.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::{Error, Result};

struct Slot<T> {
    generation: u64,
    tx: oneshot::Sender<T>,
}

/// A slot that at most one waiter can arm at a time.
pub struct Rendezvous<T> {
    operation: &'static str,
    slot: Mutex<Option<Slot<T>>>,
    generation: Mutex<u64>,
}

impl<T> Rendezvous<T> {
    /// Create an unarmed rendezvous. `operation` names the awaited event in
    /// errors and logs.
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            slot: Mutex::new(None),
            generation: Mutex::new(0),
        }
    }

    /// Arm the slot, replacing any stale waiter.
    pub fn arm(&self) -> Pending<'_, T> {
        let (tx, rx) = oneshot::channel();
        let generation = {
            let mut next = self.generation.lock();
            *next += 1;
            *next
        };

        if self.slot.lock().replace(Slot { generation, tx }).is_some() {
            warn!(operation = self.operation, "Replacing an armed wait");
        }

        Pending {
            owner: self,
            generation,
            rx: Some(rx),
        }
    }

    /// Deliver `value` to the armed waiter.
    ///
    /// Returns `false` if nothing was armed.
    pub fn signal(&self, value: T) -> bool {
        match self.slot.lock().take() {
            Some(slot) => slot.tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Whether a waiter is armed.
    pub fn is_armed(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Name of the awaited operation.
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    fn disarm(&self, generation: u64) {
        let mut slot = self.slot.lock();
        if slot.as_ref().map(|s| s.generation) == Some(generation) {
            *slot = None;
        }
    }
}

impl<T> std::fmt::Debug for Rendezvous<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rendezvous")
            .field("operation", &self.operation)
            .field("armed", &self.is_armed())
            .finish()
    }
}

/// An armed wait. Dropping it disarms the slot, so an abandoned request
/// never leaves a stale waiter behind.
pub struct Pending<'a, T> {
    owner: &'a Rendezvous<T>,
    generation: u64,
    rx: Option<oneshot::Receiver<T>>,
}

impl<T> Pending<'_, T> {
    /// Wait for the signal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when `timeout` elapses first and
    /// [`Error::Cancelled`] when the slot was re-armed by another waiter.
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<T> {
        let operation = self.owner.operation;
        let Some(rx) = self.rx.take() else {
            return Err(Error::Cancelled { operation });
        };

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    warn!(operation, ?limit, "Timed out waiting for completion event");
                    return Err(Error::Timeout { operation });
                }
            },
            None => rx.await,
        };

        received.map_err(|_| Error::Cancelled { operation })
    }
}

impl<T> Drop for Pending<'_, T> {
    fn drop(&mut self) {
        self.owner.disarm(self.generation);
    }
}

//! Single-slot, latest-wins update channel.
//!
//! A [`Publisher`] holds at most one pending value. Publishing while a
//! subscriber has not yet consumed the previous value overwrites it, so a
//! slow consumer only ever observes the most recent state. Built on
//! [`tokio::sync::watch`], which has exactly these semantics.

use tokio::sync::watch;

/// Producer side of a single-slot channel.
#[derive(Debug)]
pub struct Publisher<T> {
    tx: watch::Sender<Option<T>>,
}

/// Consumer side of a single-slot channel.
///
/// Only values published after the subscription was created are delivered.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T> Publisher<T> {
    /// Create a publisher with an empty slot.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Place `value` in the slot, replacing any unconsumed value.
    pub fn publish(&self, value: T) {
        self.tx.send_replace(Some(value));
    }

    /// Open a new subscription.
    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }
}

impl<T> Default for Publisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Subscription<T> {
    /// Wait for the next published value.
    ///
    /// Returns `None` once the publisher has been dropped and no value is
    /// pending.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(value) = self.rx.borrow_and_update().clone() {
                return Some(value);
            }
        }
    }
}

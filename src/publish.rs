//! Latest-value channels from the capture worker to its consumer.
//!
//! Each channel holds at most one value. Publishing over an unread value replaces it,
//! so a slow consumer sees the newest frame or counter and the producer never blocks.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

pub struct Publisher<T> {
    tx: Sender<T>,
    // Used only to evict the stale value when the slot is full.
    evict: Receiver<T>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            evict: self.evict.clone(),
        }
    }
}

pub struct Subscriber<T> {
    rx: Receiver<T>,
}

pub fn latest<T>() -> (Publisher<T>, Subscriber<T>) {
    let (tx, rx) = bounded(1);
    (
        Publisher {
            tx,
            evict: rx.clone(),
        },
        Subscriber { rx },
    )
}

impl<T> Publisher<T> {
    /// Publish `value`, replacing any unread value.
    pub fn publish(&self, value: T) {
        let mut value = value;
        loop {
            match self.tx.try_send(value) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    let _ = self.evict.try_recv();
                    value = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

impl<T> Subscriber<T> {
    /// Newest unread value, if any.
    pub fn try_latest(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Some(value),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

//! Focus/Online Signal Sources
//!
//! Boolean-valued event sources ("window has focus", "network reachable")
//! the engine subscribes to in order to trigger background refetches and to
//! pause retries while offline. Detection itself is out of scope: platform
//! integrations drive these through the manual setter, and tests flip them
//! directly.

use std::sync::Arc;
use tokio::sync::watch;

// == Status Signal ==
/// A subscribable boolean signal with a manual override setter.
///
/// Internally a tokio watch channel; subscribers get a receiver that yields
/// the current value immediately and wakes on every change.
#[derive(Clone, Debug)]
pub struct StatusSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StatusSignal {
    /// Creates a signal with the given initial value.
    pub fn new(initial: bool) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Current value.
    pub fn get(&self) -> bool {
        *self.tx.borrow()
    }

    /// Manual override setter. No-op notifications are suppressed so
    /// repeated `set(true)` calls do not wake subscribers.
    pub fn set(&self, value: bool) {
        self.tx.send_if_modified(|current| {
            if *current != value {
                *current = value;
                true
            } else {
                false
            }
        });
    }

    /// Subscribes to value changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for StatusSignal {
    fn default() -> Self {
        Self::new(true)
    }
}

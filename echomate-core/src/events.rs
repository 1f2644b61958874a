//! Process-wide event bits for cross-task signaling.
//!
//! A small fixed vocabulary of boolean flags backed by a `watch` channel:
//! every mutation publishes a new snapshot, so a waiter that wakes after a
//! bit is set always observes it. Bits may be cleared by a different actor
//! than the one that set them, so waiters re-check intent after waking.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const WIFI_CONNECTED: u32 = 1 << 0;
pub const WIFI_FAILED: u32 = 1 << 1;
pub const CONFIG_SAVED: u32 = 1 << 2;
pub const FACTORY_RESET: u32 = 1 << 3;
pub const SESSION_UP: u32 = 1 << 4;
pub const SESSION_DOWN: u32 = 1 << 5;

#[derive(Clone)]
pub struct EventBus {
    flags: Arc<watch::Sender<u32>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0u32);
        Self { flags: Arc::new(tx) }
    }

    /// Set bits. Idempotent; independent of all other bits.
    pub fn set(&self, bits: u32) {
        self.flags.send_modify(|v| *v |= bits);
    }

    /// Clear bits. Idempotent.
    pub fn clear(&self, bits: u32) {
        self.flags.send_modify(|v| *v &= !bits);
    }

    /// Clear every bit (factory reset path).
    pub fn clear_all(&self) {
        self.flags.send_modify(|v| *v = 0);
    }

    /// Current snapshot.
    pub fn get(&self) -> u32 {
        *self.flags.borrow()
    }

    /// Block until any bit in `mask` is set, or `timeout` elapses.
    ///
    /// Returns the observed bits intersected with `mask` (0 on timeout).
    /// `timeout: None` waits forever; that is a caller opt-in, never a
    /// default inside this crate.
    pub async fn wait_any(&self, mask: u32, timeout: Option<Duration>) -> u32 {
        let mut rx = self.flags.subscribe();
        let wait = rx.wait_for(|v| v & mask != 0);
        let observed = match timeout {
            Some(t) => match tokio::time::timeout(t, wait).await {
                Ok(Ok(v)) => *v,
                // channel closed or timed out
                _ => return 0,
            },
            None => match wait.await {
                Ok(v) => *v,
                Err(_) => return 0,
            },
        };
        observed & mask
    }
}

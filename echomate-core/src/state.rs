//! The device-wide connectivity state. Exactly one instance exists, owned
//! by the orchestrator; the session manager holds a clone solely to toggle
//! `SessionUp` ⇄ `StationConnected`. Never persisted — every boot starts
//! from `Init`.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Init,
    Provisioning,
    StationConnecting,
    StationConnected,
    SessionUp,
    /// Recording or playback in progress.
    Busy,
    Error,
}

#[derive(Clone)]
pub struct StateHandle {
    tx: Arc<watch::Sender<ConnectivityState>>,
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StateHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectivityState::Init);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, state: ConnectivityState) {
        if self.tx.send_replace(state) != state {
            tracing::debug!(?state, "connectivity state changed");
        }
    }

    pub fn get(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }
}

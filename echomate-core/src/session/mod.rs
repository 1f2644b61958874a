//! Backend session manager.
//!
//! Owns one [`BackendClient`] at a time and reacts to its events: gates the
//! one-time onboarding chime behind `first_connection_since_boot`, announces
//! the device identity on every connect, tracks the SESSION_UP/SESSION_DOWN
//! bits, and dispatches inbound commands to the device collaborator. A
//! supervisory poll catches a client that died without delivering an event
//! and recreates it.

pub mod client;

use crate::config::SessionSection;
use crate::events::{self, EventBus};
use crate::state::{ConnectivityState, StateHandle};
use crate::traits::{DeviceCollaborator, CLIP_SESSION_READY};
use client::{BackendClient, ConnectionState, SessionEvent};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Longest recording the hardware buffer supports, in seconds.
const MAX_RECORDING_SECS: i64 = 60;
const DEFAULT_RECORDING_SECS: i64 = 5;
/// Grace before a commanded restart, so the ack reaches the backend.
const RESTART_DELAY: Duration = Duration::from_secs(3);
/// Pause between destroying a wedged client and building its replacement.
const RECREATE_DELAY: Duration = Duration::from_secs(1);

struct Inner {
    client: Arc<BackendClient>,
    reactor: JoinHandle<()>,
}

pub struct SessionManager {
    cfg: SessionSection,
    client_id: String,
    device_type: String,
    collaborator: Arc<dyn DeviceCollaborator>,
    events: EventBus,
    state: StateHandle,
    first_connection: Arc<AtomicBool>,
    inner: Mutex<Option<Inner>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        cfg: SessionSection,
        client_id: String,
        device_type: String,
        collaborator: Arc<dyn DeviceCollaborator>,
        events: EventBus,
        state: StateHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            client_id,
            device_type,
            collaborator,
            events,
            state,
            first_connection: Arc::new(AtomicBool::new(true)),
            inner: Mutex::new(None),
            supervisor: Mutex::new(None),
        })
    }

    /// Open the backend connection and arm the supervisor.
    pub async fn start(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.is_some() {
            warn!("session manager already started");
            return;
        }
        *inner = Some(self.spawn_client());
        drop(inner);

        let weak = Arc::downgrade(self);
        let poll = Duration::from_millis(self.cfg.supervisor_poll_ms);
        *self.supervisor.lock().await = Some(tokio::spawn(supervise(weak, poll)));
        info!(addr = %self.cfg.server_addr, "session manager started");
    }

    /// Close the connection and stop supervising.
    pub async fn stop(&self) {
        if let Some(task) = self.supervisor.lock().await.take() {
            task.abort();
        }
        if let Some(old) = self.inner.lock().await.take() {
            old.client.stop().await;
            old.reactor.abort();
        }
        self.events.clear(events::SESSION_UP);
        info!("session manager stopped");
    }

    /// Hard teardown; used on factory reset.
    pub async fn destroy(&self) {
        if let Some(task) = self.supervisor.lock().await.take() {
            task.abort();
        }
        if let Some(old) = self.inner.lock().await.take() {
            old.client.destroy();
            old.reactor.abort();
        }
        self.events.clear(events::SESSION_UP);
    }

    /// Whether the session object is still live (not necessarily connected).
    pub async fn is_alive(&self) -> bool {
        match self.inner.lock().await.as_ref() {
            Some(inner) => !inner.client.is_finished(),
            None => false,
        }
    }

    pub async fn is_connected(&self) -> bool {
        match self.inner.lock().await.as_ref() {
            Some(inner) => inner.client.state() == ConnectionState::Connected,
            None => false,
        }
    }

    /// Destroy the current client and build a fresh one. The
    /// `first_connection_since_boot` flag is left untouched; only the quiet
    /// period may re-arm it.
    pub async fn recreate(&self) {
        warn!("recreating backend session");
        let mut inner = self.inner.lock().await;
        if let Some(old) = inner.take() {
            old.client.destroy();
            old.reactor.abort();
        }
        tokio::time::sleep(RECREATE_DELAY).await;
        *inner = Some(self.spawn_client());
    }

    fn spawn_client(&self) -> Inner {
        let (raw_client, event_rx) = BackendClient::start(&self.cfg);
        let client = Arc::new(raw_client);
        let ctx = ReactorCtx {
            client: client.clone(),
            collaborator: self.collaborator.clone(),
            events: self.events.clone(),
            state: self.state.clone(),
            first_connection: self.first_connection.clone(),
            client_id: self.client_id.clone(),
            device_type: self.device_type.clone(),
            quiet_period: Duration::from_millis(self.cfg.quiet_period_ms),
        };
        let reactor = tokio::spawn(reactor_loop(event_rx, ctx));
        Inner { client, reactor }
    }
}

/// Poll for a client that reports itself dead or disconnected despite the
/// session bits saying otherwise, and recreate it. Defensive recovery; the
/// normal path is entirely event-driven.
async fn supervise(manager: Weak<SessionManager>, poll: Duration) {
    loop {
        tokio::time::sleep(poll).await;
        let Some(manager) = manager.upgrade() else {
            return;
        };
        let needs_recreate = {
            let inner = manager.inner.lock().await;
            match inner.as_ref() {
                Some(inner) => {
                    inner.client.is_finished()
                        || (inner.client.state() == ConnectionState::Disconnected
                            && manager.events.get() & events::SESSION_UP != 0)
                }
                // stopped; nothing to watch any more
                None => return,
            }
        };
        if needs_recreate {
            manager.events.clear(events::SESSION_UP);
            manager.recreate().await;
        }
    }
}

struct ReactorCtx {
    client: Arc<BackendClient>,
    collaborator: Arc<dyn DeviceCollaborator>,
    events: EventBus,
    state: StateHandle,
    first_connection: Arc<AtomicBool>,
    client_id: String,
    device_type: String,
    quiet_period: Duration,
}

async fn reactor_loop(mut rx: mpsc::Receiver<SessionEvent>, ctx: ReactorCtx) {
    let mut quiet_timer: Option<JoinHandle<()>> = None;

    while let Some(event) = rx.recv().await {
        match event {
            SessionEvent::Connected => {
                if let Some(timer) = quiet_timer.take() {
                    timer.abort();
                }
                if ctx.first_connection.swap(false, Ordering::SeqCst) {
                    info!("first backend connection since boot");
                    if let Err(e) = ctx.collaborator.play_clip(CLIP_SESSION_READY).await {
                        warn!(error = %e, "onboarding chime failed");
                    }
                } else {
                    info!("backend reconnected, skipping chime");
                }

                ctx.client
                    .send_json(json!({
                        "event": "device_connected",
                        "data": { "clientId": ctx.client_id, "type": ctx.device_type },
                    }))
                    .await;

                ctx.events.clear(events::SESSION_DOWN);
                ctx.events.set(events::SESSION_UP);
                ctx.state.set(ConnectivityState::SessionUp);
            }
            SessionEvent::Disconnected => {
                ctx.events.clear(events::SESSION_UP);
                ctx.events.set(events::SESSION_DOWN);
                ctx.state.set(ConnectivityState::StationConnected);

                // a long enough outage makes the next connect count as
                // "first" again for announcement purposes
                if let Some(timer) = quiet_timer.take() {
                    timer.abort();
                }
                let first_connection = ctx.first_connection.clone();
                let quiet_period = ctx.quiet_period;
                quiet_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(quiet_period).await;
                    first_connection.store(true, Ordering::SeqCst);
                    info!("quiet period elapsed, re-arming first-connection announcement");
                }));
            }
            SessionEvent::Message(text) => dispatch(&ctx, &text).await,
        }
    }
}

/// Parse and dispatch one inbound command. Unknown or malformed payloads
/// are logged and dropped; they never take the session down.
async fn dispatch(ctx: &ReactorCtx, text: &str) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "malformed backend message, dropping");
            return;
        }
    };
    let Some(event) = value.get("event").and_then(|v| v.as_str()) else {
        warn!("backend message without event field, dropping");
        return;
    };
    let data = value.get("data").and_then(|v| v.as_object());
    debug!(%event, "backend command");

    match event {
        "start_recording" => {
            let duration = data
                .and_then(|d| d.get("duration"))
                .and_then(|v| v.as_i64())
                .unwrap_or(DEFAULT_RECORDING_SECS)
                .clamp(1, MAX_RECORDING_SECS) as u32;

            ctx.client
                .send_json(json!({
                    "event": "recording_started",
                    "data": { "duration": duration },
                }))
                .await;

            ctx.state.set(ConnectivityState::Busy);
            match ctx.collaborator.record(duration).await {
                Ok(size) => {
                    info!(size, duration, "recording complete");
                    ctx.client
                        .send_json(json!({
                            "event": "record_complete",
                            "data": { "size": size, "duration": duration },
                        }))
                        .await;
                }
                Err(e) => warn!(error = %e, "recording failed"),
            }
            ctx.state.set(ConnectivityState::SessionUp);
        }
        "restart" => {
            warn!("restart commanded by backend");
            ctx.client
                .send_json(json!({
                    "event": "restart_ack",
                    "data": { "status": "ok" },
                }))
                .await;
            tokio::time::sleep(RESTART_DELAY).await;
            ctx.collaborator.restart_device().await;
        }
        "play_pcm" => {
            let id = data
                .and_then(|d| d.get("id"))
                .and_then(|v| v.as_i64())
                .unwrap_or(1) as u32;

            ctx.state.set(ConnectivityState::Busy);
            let status = match ctx.collaborator.play_clip(id).await {
                Ok(()) => "ok",
                Err(e) => {
                    warn!(error = %e, id, "clip playback failed");
                    "fail"
                }
            };
            ctx.state.set(ConnectivityState::SessionUp);

            ctx.client
                .send_json(json!({
                    "event": "play_pcm_result",
                    "data": { "id": id, "status": status },
                }))
                .await;
        }
        other => debug!(event = %other, "unrecognized backend event, ignoring"),
    }
}

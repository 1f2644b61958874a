//! Connectivity orchestrator.
//!
//! The one place that sequences boot: event bus, station manager, then
//! either the stored-credential join or the SoftAP provisioning fallback,
//! and finally the backend session with an idle monitor. Also the only
//! place allowed to decide on a full device restart.

use anyhow::Result;
use echomate_core::config::DeviceConfig;
use echomate_core::events::{self, EventBus};
use echomate_core::frontends::EmbedFrontend;
use echomate_core::session::SessionManager;
use echomate_core::softap::SoftApService;
use echomate_core::state::{ConnectivityState, StateHandle};
use echomate_core::station::{ConnectOutcome, StationManager};
use echomate_core::store::CredentialStore;
use echomate_core::traits::{
    DeviceCollaborator, WifiRadio, CLIP_CONFIG_SAVED, CLIP_PROVISIONING, CLIP_WELCOME,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Grace before the fail-stop restart that applies fresh credentials.
const RESTART_DELAY: Duration = Duration::from_secs(3);
/// Pause before restarting out of a fatal low-level failure.
const FATAL_RESTART_DELAY: Duration = Duration::from_secs(3);
const MONITOR_TICK: Duration = Duration::from_secs(1);

pub async fn run(
    cfg: DeviceConfig,
    radio: Arc<dyn WifiRadio>,
    collaborator: Arc<dyn DeviceCollaborator>,
) -> Result<()> {
    let events = EventBus::new();
    let state = StateHandle::new();
    #[cfg(unix)]
    spawn_reset_signal_watcher(events.clone());
    run_with_bus(cfg, radio, collaborator, events, state).await
}

pub(crate) async fn run_with_bus(
    cfg: DeviceConfig,
    radio: Arc<dyn WifiRadio>,
    collaborator: Arc<dyn DeviceCollaborator>,
    events: EventBus,
    state: StateHandle,
) -> Result<()> {
    let store = Arc::new(CredentialStore::new(&cfg.store.path, events.clone()));
    let frontend = Arc::new(EmbedFrontend::new());

    // factory reset pre-empts every other state
    tokio::spawn(watch_factory_reset(
        events.clone(),
        store.clone(),
        collaborator.clone(),
    ));

    let station = StationManager::new(
        radio.clone(),
        store.clone(),
        events.clone(),
        cfg.station.clone(),
    );
    if let Err(e) = station.init().await {
        // corrupted low-level stack: the only supported recovery
        error!(error = %e, "station init failed, restarting device");
        tokio::time::sleep(FATAL_RESTART_DELAY).await;
        collaborator.restart_device().await;
        return Ok(());
    }

    if store.has_valid_credentials().await.is_some() {
        state.set(ConnectivityState::StationConnecting);
        match station.wait_connected(Some(cfg.connect_timeout())).await {
            ConnectOutcome::Connected => {
                state.set(ConnectivityState::StationConnected);
                if let Some(info) = station.get_info() {
                    info!(ip = %info.ip, ssid = %info.ssid, rssi = info.rssi, "station online");
                }
                run_session(&cfg, radio.as_ref(), collaborator, events, state).await;
                return Ok(());
            }
            outcome => {
                warn!(?outcome, "station join did not complete, falling back to provisioning");
            }
        }
    } else {
        info!("first boot or factory reset, playing welcome clip");
        if let Err(e) = collaborator.play_clip(CLIP_WELCOME).await {
            warn!(error = %e, "welcome clip failed");
        }
    }

    provision(&cfg, radio, store, frontend, collaborator, events, state).await
}

/// SoftAP provisioning branch: bring the captive portal up and block until
/// credentials arrive, then restart to apply them. Restart over in-place
/// radio reconfiguration keeps the driver state out of trouble.
async fn provision(
    cfg: &DeviceConfig,
    radio: Arc<dyn WifiRadio>,
    store: Arc<CredentialStore>,
    frontend: Arc<EmbedFrontend>,
    collaborator: Arc<dyn DeviceCollaborator>,
    events: EventBus,
    state: StateHandle,
) -> Result<()> {
    state.set(ConnectivityState::Provisioning);
    if let Err(e) = collaborator.play_clip(CLIP_PROVISIONING).await {
        warn!(error = %e, "provisioning clip failed");
    }

    let softap = SoftApService::new(
        radio,
        store,
        frontend,
        cfg.softap.clone(),
        cfg.device.name.clone(),
    );
    if let Err(e) = softap.start().await {
        error!(error = %e, "provisioning mode failed to start, restarting device");
        tokio::time::sleep(FATAL_RESTART_DELAY).await;
        collaborator.restart_device().await;
        return Ok(());
    }
    println!("📡 Provisioning active: join AP '{}' to configure", softap.ap_ssid());

    // blocks until the portal saves a valid credential set; waiting
    // forever here is deliberate, there is nothing else to do
    events.wait_any(events::CONFIG_SAVED, None).await;

    info!("configuration saved, restarting to apply");
    if let Err(e) = collaborator.play_clip(CLIP_CONFIG_SAVED).await {
        warn!(error = %e, "config-saved clip failed");
    }
    if let Err(e) = softap.stop().await {
        warn!(error = %e, "softap teardown failed, restarting anyway");
    }
    tokio::time::sleep(RESTART_DELAY).await;
    collaborator.restart_device().await;
    Ok(())
}

/// Bring the backend session up and idle-monitor it forever, recreating a
/// session object that silently died.
async fn run_session(
    cfg: &DeviceConfig,
    radio: &dyn WifiRadio,
    collaborator: Arc<dyn DeviceCollaborator>,
    events: EventBus,
    state: StateHandle,
) {
    let client_id = if cfg.device.client_id.is_empty() {
        let mac = radio.mac();
        format!("echomate-{:02x}{:02x}{:02x}", mac[3], mac[4], mac[5])
    } else {
        cfg.device.client_id.clone()
    };
    info!(%client_id, addr = %cfg.session.server_addr, "bringing up backend session");

    let session = SessionManager::new(
        cfg.session.clone(),
        client_id,
        cfg.device.device_type.clone(),
        collaborator,
        events,
        state,
    );
    session.start().await;

    loop {
        tokio::time::sleep(MONITOR_TICK).await;
        if !session.is_alive().await {
            warn!("session object died silently, recreating");
            session.recreate().await;
        }
    }
}

/// Blocks until FACTORY_RESET is raised, then erases credentials, clears
/// every event bit and restarts. Runs concurrently with everything else.
async fn watch_factory_reset(
    events: EventBus,
    store: Arc<CredentialStore>,
    collaborator: Arc<dyn DeviceCollaborator>,
) {
    events.wait_any(events::FACTORY_RESET, None).await;
    warn!("factory reset requested");

    if let Err(e) = collaborator.play_clip(CLIP_WELCOME).await {
        warn!(error = %e, "factory reset clip failed");
    }
    if let Err(e) = store.erase().await {
        error!(error = %e, "credential erase failed");
    }
    collaborator.factory_reset().await;
    events.clear_all();

    tokio::time::sleep(Duration::from_secs(1)).await;
    collaborator.restart_device().await;
}

/// SIGUSR1 stands in for the reset button on hosted builds.
#[cfg(unix)]
fn spawn_reset_signal_watcher(events: EventBus) {
    tokio::spawn(async move {
        let mut stream = match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::user_defined1(),
        ) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install reset signal handler");
                return;
            }
        };
        while stream.recv().await.is_some() {
            events.set(events::FACTORY_RESET);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use echomate_core::backends::mock::MockRadio;
    use echomate_core::config::{SoftApSection, StationSection};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::Notify;

    const MAC: [u8; 6] = [0x24, 0x6f, 0x28, 0xaa, 0xbb, 0xcc];

    struct TestCollaborator {
        clips: StdMutex<Vec<u32>>,
        restarts: AtomicU32,
        restarted: Notify,
    }

    impl TestCollaborator {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                clips: StdMutex::new(Vec::new()),
                restarts: AtomicU32::new(0),
                restarted: Notify::new(),
            })
        }

        fn clips(&self) -> Vec<u32> {
            self.clips.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeviceCollaborator for TestCollaborator {
        async fn play_clip(&self, id: u32) -> echomate_core::Result<()> {
            self.clips.lock().unwrap().push(id);
            Ok(())
        }

        async fn record(&self, _duration_secs: u32) -> echomate_core::Result<usize> {
            Ok(0)
        }

        async fn restart_device(&self) {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            self.restarted.notify_one();
        }

        async fn factory_reset(&self) {}
    }

    fn test_cfg(name: &str) -> DeviceConfig {
        let store_path = std::env::temp_dir().join(format!(
            "echomate-orch-{}-{name}.toml",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&store_path);
        let mut cfg = DeviceConfig::default();
        cfg.store.path = store_path.display().to_string();
        cfg.softap = SoftApSection {
            http_port: 0,
            dns_port: 0,
            ..SoftApSection::default()
        };
        cfg.station = StationSection {
            backoff_base_ms: 1,
            backoff_cap_ms: 4,
            connect_timeout_ms: 2_000,
            ..StationSection::default()
        };
        cfg.session.reconnect_interval_ms = 50;
        cfg.session.supervisor_poll_ms = 50;
        // a bound-then-dropped port, so connects are refused unless a test
        // stands up its own backend
        cfg.session.server_addr = format!("127.0.0.1:{}", free_port());
        cfg
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Scenario A: no stored credentials → provisioning portal comes up;
    /// a set-wifi POST persists the credentials and triggers the restart.
    #[tokio::test]
    async fn provisioning_flow_accepts_credentials_and_restarts() {
        let mut cfg = test_cfg("provision");
        let port = free_port();
        cfg.softap.http_port = port;
        let store_path = cfg.store.path.clone();

        let collaborator = TestCollaborator::new();
        let radio: Arc<dyn WifiRadio> = Arc::new(MockRadio::always_succeeding(MAC));
        let events = EventBus::new();
        let state = StateHandle::new();

        let run_task = tokio::spawn(run_with_bus(
            cfg,
            radio,
            collaborator.clone(),
            events,
            state,
        ));

        // wait for the portal to come up, then configure
        let url = format!("http://127.0.0.1:{port}/api/set-wifi");
        let http = reqwest::Client::new();
        let mut response = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            match http
                .post(&url)
                .header("content-type", "application/x-www-form-urlencoded")
                .body("ssid=MyNet&password=secret1")
                .send()
                .await
            {
                Ok(resp) => {
                    response = Some(resp.json::<serde_json::Value>().await.unwrap());
                    break;
                }
                Err(_) => continue,
            }
        }
        let response = response.expect("portal never came up");
        assert_eq!(response["status"], "ok");

        tokio::time::timeout(Duration::from_secs(10), collaborator.restarted.notified())
            .await
            .expect("device never restarted after provisioning");

        // credentials really were persisted
        let stored = std::fs::read_to_string(&store_path).unwrap();
        assert!(stored.contains("MyNet"));
        assert!(stored.contains("secret1"));

        let clips = collaborator.clips();
        assert!(clips.contains(&CLIP_WELCOME));
        assert!(clips.contains(&CLIP_PROVISIONING));
        assert!(clips.contains(&CLIP_CONFIG_SAVED));

        run_task.abort();
    }

    /// Scenario B: valid credentials and a reachable backend → the session
    /// announces the device identity and the onboarding chime fires once.
    #[tokio::test]
    async fn session_flow_announces_device_identity() {
        let mut cfg = test_cfg("session");
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        cfg.session.server_addr = backend.local_addr().unwrap().to_string();

        // pre-provisioned device
        let seed_store = CredentialStore::new(&cfg.store.path, EventBus::new());
        seed_store
            .save(&echomate_core::store::Credentials {
                ssid: "HomeNet".into(),
                password: "pw".into(),
            })
            .await
            .unwrap();

        let collaborator = TestCollaborator::new();
        let radio: Arc<dyn WifiRadio> = Arc::new(MockRadio::always_succeeding(MAC));
        let events = EventBus::new();
        let state = StateHandle::new();

        let run_task = tokio::spawn(run_with_bus(
            cfg,
            radio,
            collaborator.clone(),
            events.clone(),
            state,
        ));

        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), backend.accept())
            .await
            .expect("session never connected")
            .unwrap();
        let mut lines = BufReader::new(stream).lines();
        let hello = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let hello: serde_json::Value = serde_json::from_str(&hello).unwrap();
        assert_eq!(hello["event"], "device_connected");
        assert_eq!(hello["data"]["clientId"], "echomate-aabbcc");
        assert_eq!(hello["data"]["type"], "echomate-s3");

        // onboarding chime exactly once
        let up = events
            .wait_any(events::SESSION_UP, Some(Duration::from_secs(2)))
            .await;
        assert_ne!(up, 0);
        assert_eq!(
            collaborator
                .clips()
                .iter()
                .filter(|&&c| c == echomate_core::traits::CLIP_SESSION_READY)
                .count(),
            1
        );

        run_task.abort();
    }

    /// Factory reset pre-empts everything: credentials erased, bits
    /// cleared, device restarted.
    #[tokio::test]
    async fn factory_reset_erases_and_restarts() {
        let cfg = test_cfg("reset");
        let store_path = cfg.store.path.clone();

        let seed_store = CredentialStore::new(&store_path, EventBus::new());
        seed_store
            .save(&echomate_core::store::Credentials {
                ssid: "DoomedNet".into(),
                password: "pw".into(),
            })
            .await
            .unwrap();

        // unreachable backend keeps the session retrying quietly
        let collaborator = TestCollaborator::new();
        let radio: Arc<dyn WifiRadio> = Arc::new(MockRadio::always_succeeding(MAC));
        let events = EventBus::new();
        let state = StateHandle::new();

        let run_task = tokio::spawn(run_with_bus(
            cfg,
            radio,
            collaborator.clone(),
            events.clone(),
            state,
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        events.set(events::FACTORY_RESET);

        tokio::time::timeout(Duration::from_secs(5), collaborator.restarted.notified())
            .await
            .expect("factory reset never restarted the device");

        assert!(!std::path::Path::new(&store_path).exists());
        assert_eq!(events.get(), 0);

        run_task.abort();
    }
}

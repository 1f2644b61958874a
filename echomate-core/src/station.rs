//! Station-mode connection manager.
//!
//! Drives join/retry against the stored credentials and exposes a blocking
//! wait for the outcome. Radio callbacks are consumed as typed events from
//! a channel; the retry policy is reconnect-with-exponential-back-off up to
//! a fixed attempt count, then declare failure and go passive until the
//! next `init()`.

use crate::config::StationSection;
use crate::events::{self, EventBus};
use crate::store::CredentialStore;
use crate::traits::{RadioEvent, StationInfo, WifiRadio};
use crate::Result;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    Failed,
    TimedOut,
}

pub struct StationManager {
    radio: Arc<dyn WifiRadio>,
    store: Arc<CredentialStore>,
    events: EventBus,
    cfg: StationSection,
    info: Arc<StdMutex<Option<StationInfo>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl StationManager {
    pub fn new(
        radio: Arc<dyn WifiRadio>,
        store: Arc<CredentialStore>,
        events: EventBus,
        cfg: StationSection,
    ) -> Self {
        Self {
            radio,
            store,
            events,
            cfg,
            info: Arc::new(StdMutex::new(None)),
            pump: Mutex::new(None),
        }
    }

    /// Bring up station mode and, if valid credentials exist, start a join.
    /// Idempotent; calling again re-arms the retry budget after a declared
    /// failure.
    pub async fn init(&self) -> Result<()> {
        self.radio.init_station().await?;
        self.events.clear(events::WIFI_CONNECTED | events::WIFI_FAILED);

        let rx = self.radio.subscribe();
        let mut pump = self.pump.lock().await;
        if let Some(old) = pump.take() {
            old.abort();
        }
        *pump = Some(tokio::spawn(event_pump(
            rx,
            self.radio.clone(),
            self.store.clone(),
            self.events.clone(),
            self.cfg.clone(),
            self.info.clone(),
        )));
        drop(pump);

        match self.store.has_valid_credentials().await {
            Some(creds) => {
                info!(ssid = %creds.ssid, "stored credentials found, joining");
                self.radio.connect(&creds).await?;
            }
            None => {
                info!("no stored credentials, radio stays passive");
            }
        }
        Ok(())
    }

    /// Block until the current join attempt resolves. `timeout: None` waits
    /// forever (explicit caller opt-in).
    pub async fn wait_connected(&self, timeout: Option<Duration>) -> ConnectOutcome {
        let bits = self
            .events
            .wait_any(events::WIFI_CONNECTED | events::WIFI_FAILED, timeout)
            .await;
        if bits & events::WIFI_CONNECTED != 0 {
            ConnectOutcome::Connected
        } else if bits & events::WIFI_FAILED != 0 {
            ConnectOutcome::Failed
        } else {
            ConnectOutcome::TimedOut
        }
    }

    /// Connection info captured at the last successful address acquisition.
    pub fn get_info(&self) -> Option<StationInfo> {
        self.info.lock().unwrap().clone()
    }
}

async fn event_pump(
    mut rx: broadcast::Receiver<RadioEvent>,
    radio: Arc<dyn WifiRadio>,
    store: Arc<CredentialStore>,
    events: EventBus,
    cfg: StationSection,
    info: Arc<StdMutex<Option<StationInfo>>>,
) {
    let mut attempts: u32 = 0;

    loop {
        match rx.recv().await {
            Ok(RadioEvent::Connected { ssid }) => {
                debug!(%ssid, "associated, waiting for address");
            }
            Ok(RadioEvent::GotIp(station_info)) => {
                info!(ip = %station_info.ip, ssid = %station_info.ssid,
                      rssi = station_info.rssi, "station connected");
                *info.lock().unwrap() = Some(station_info);
                attempts = 0;
                events.clear(events::WIFI_FAILED);
                events.set(events::WIFI_CONNECTED);
            }
            Ok(RadioEvent::Disconnected { reason }) => {
                events.clear(events::WIFI_CONNECTED);
                attempts += 1;
                if attempts < cfg.max_retry {
                    let backoff = Duration::from_millis(
                        cfg.backoff_base_ms
                            .checked_shl(attempts - 1)
                            .unwrap_or(u64::MAX)
                            .min(cfg.backoff_cap_ms),
                    );
                    warn!(%reason, attempt = attempts, max = cfg.max_retry,
                          backoff_ms = backoff.as_millis() as u64, "link lost, retrying");
                    tokio::time::sleep(backoff).await;
                    match store.has_valid_credentials().await {
                        Some(creds) => {
                            if let Err(e) = radio.connect(&creds).await {
                                warn!(error = %e, "reconnect attempt failed to start");
                            }
                        }
                        None => {
                            warn!("credentials vanished, stopping retries");
                            events.set(events::WIFI_FAILED);
                        }
                    }
                } else {
                    warn!(%reason, attempts, "retry budget exhausted, going passive");
                    events.set(events::WIFI_FAILED);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "radio event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mock::{JoinOutcome, MockRadio};
    use crate::store::Credentials;

    const MAC: [u8; 6] = [0x24, 0x6f, 0x28, 0xaa, 0xbb, 0xcc];

    fn fast_cfg() -> StationSection {
        StationSection {
            max_retry: 5,
            backoff_base_ms: 1,
            backoff_cap_ms: 4,
            connect_timeout_ms: 2_000,
        }
    }

    async fn store_with_creds(name: &str) -> Arc<CredentialStore> {
        let path = std::env::temp_dir().join(format!(
            "echomate-station-{}-{name}.toml",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        let store = Arc::new(CredentialStore::new(path, EventBus::new()));
        store
            .save(&Credentials {
                ssid: "HomeNet".into(),
                password: "pw".into(),
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn successful_join_reports_info() {
        let radio = Arc::new(MockRadio::always_succeeding(MAC));
        let events = EventBus::new();
        let manager = StationManager::new(
            radio.clone(),
            store_with_creds("ok").await,
            events,
            fast_cfg(),
        );

        manager.init().await.unwrap();
        let outcome = manager
            .wait_connected(Some(Duration::from_secs(2)))
            .await;
        assert_eq!(outcome, ConnectOutcome::Connected);

        let info = manager.get_info().unwrap();
        assert_eq!(info.ssid, "HomeNet");
        assert_eq!(radio.connect_calls(), 1);
    }

    #[tokio::test]
    async fn declares_failure_after_retry_budget_and_goes_passive() {
        let script = (0..5)
            .map(|_| JoinOutcome::Refuse("auth failed".into()))
            .collect();
        let radio = Arc::new(MockRadio::with_script(MAC, script));
        let events = EventBus::new();
        let manager = StationManager::new(
            radio.clone(),
            store_with_creds("fail").await,
            events,
            fast_cfg(),
        );

        manager.init().await.unwrap();
        let outcome = manager
            .wait_connected(Some(Duration::from_secs(5)))
            .await;
        assert_eq!(outcome, ConnectOutcome::Failed);
        assert_eq!(radio.connect_calls(), 5);

        // passive until the next init(): no further attempts show up
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(radio.connect_calls(), 5);
    }

    #[tokio::test]
    async fn reinit_rearms_the_retry_budget() {
        let mut script: Vec<JoinOutcome> =
            (0..5).map(|_| JoinOutcome::Refuse("no ap".into())).collect();
        script.push(JoinOutcome::Success(StationInfo {
            ip: "10.0.0.9".parse().unwrap(),
            ssid: String::new(),
            rssi: -60,
        }));
        let radio = Arc::new(MockRadio::with_script(MAC, script));
        let events = EventBus::new();
        let manager = StationManager::new(
            radio.clone(),
            store_with_creds("reinit").await,
            events,
            fast_cfg(),
        );

        manager.init().await.unwrap();
        assert_eq!(
            manager.wait_connected(Some(Duration::from_secs(5))).await,
            ConnectOutcome::Failed
        );

        manager.init().await.unwrap();
        assert_eq!(
            manager.wait_connected(Some(Duration::from_secs(5))).await,
            ConnectOutcome::Connected
        );
        assert_eq!(radio.connect_calls(), 6);
    }

    #[tokio::test]
    async fn without_credentials_wait_times_out() {
        let path = std::env::temp_dir().join(format!(
            "echomate-station-{}-nocreds.toml",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        let store = Arc::new(CredentialStore::new(path, EventBus::new()));

        let radio = Arc::new(MockRadio::always_succeeding(MAC));
        let manager = StationManager::new(radio.clone(), store, EventBus::new(), fast_cfg());

        manager.init().await.unwrap();
        assert_eq!(
            manager
                .wait_connected(Some(Duration::from_millis(50)))
                .await,
            ConnectOutcome::TimedOut
        );
        assert_eq!(radio.connect_calls(), 0);
    }
}

//! SoftAP provisioning service.
//!
//! Composes the AP radio mode, the provisioning HTTP server and the DNS
//! responder into one start/stop lifecycle. The service never decides to
//! stop itself: arrival of valid credentials raises CONFIG_SAVED and the
//! orchestrator stops provisioning and restarts the device, so the radio
//! mode is never switched in-process.

use crate::config::SoftApSection;
use crate::dns;
use crate::store::CredentialStore;
use crate::traits::{UiAssetProvider, WifiRadio};
use crate::web_server::{start_portal, PortalState};
use crate::Result;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApState {
    Stopped,
    Starting,
    Active,
    Stopping,
}

struct Running {
    http_addr: Option<SocketAddr>,
    http_task: Option<JoinHandle<Result<()>>>,
    dns_addr: Option<SocketAddr>,
    dns_shutdown: Option<oneshot::Sender<()>>,
    dns_task: Option<JoinHandle<()>>,
}

pub struct SoftApService {
    radio: Arc<dyn WifiRadio>,
    store: Arc<CredentialStore>,
    frontend: Arc<dyn UiAssetProvider>,
    cfg: SoftApSection,
    device_name: String,
    state: Mutex<ApState>,
    running: Mutex<Option<Running>>,
}

impl SoftApService {
    pub fn new(
        radio: Arc<dyn WifiRadio>,
        store: Arc<CredentialStore>,
        frontend: Arc<dyn UiAssetProvider>,
        cfg: SoftApSection,
        device_name: String,
    ) -> Self {
        Self {
            radio,
            store,
            frontend,
            cfg,
            device_name,
            state: Mutex::new(ApState::Stopped),
            running: Mutex::new(None),
        }
    }

    pub async fn state(&self) -> ApState {
        *self.state.lock().await
    }

    /// SSID of the temporary AP: fixed prefix + last 3 MAC bytes, so two
    /// units next to each other do not collide.
    pub fn ap_ssid(&self) -> String {
        let mac = self.radio.mac();
        format!(
            "{}{:02X}{:02X}{:02X}",
            self.cfg.ssid_prefix, mac[3], mac[4], mac[5]
        )
    }

    /// Address the portal actually bound, once active (tests bind port 0).
    pub async fn http_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref()?.http_addr
    }

    pub async fn dns_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref()?.dns_addr
    }

    /// Bring up the AP radio, the portal and the DNS responder. A portal
    /// start failure is logged and non-fatal: DNS-only captive behavior
    /// still functions in degraded mode.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state != ApState::Stopped {
                warn!(state = ?*state, "softap start ignored");
                return Ok(());
            }
            *state = ApState::Starting;
        }

        let ssid = self.ap_ssid();
        info!(%ssid, channel = self.cfg.channel, "starting SoftAP provisioning mode");
        self.radio
            .start_access_point(&ssid, &self.cfg.password, self.cfg.channel)
            .await?;

        let mac = self.radio.mac();
        let portal_state = Arc::new(PortalState {
            store: self.store.clone(),
            frontend: self.frontend.clone(),
            device_name: self.device_name.clone(),
            mac: format_mac(mac),
            ap_ip: self.cfg.ap_ip,
        });
        let http_bind = SocketAddr::from(([0, 0, 0, 0], self.cfg.http_port));
        let (http_addr, http_task) = match start_portal(portal_state, http_bind).await {
            Ok((addr, task)) => (Some(addr), Some(task)),
            Err(e) => {
                // degraded mode: captive DNS still herds clients
                error!(error = %e, "portal failed to start, continuing DNS-only");
                (None, None)
            }
        };

        let dns_bind = SocketAddr::from(([0, 0, 0, 0], self.cfg.dns_port));
        let (dns_addr, dns_shutdown, dns_task) =
            match dns::spawn_responder(dns_bind, self.cfg.ap_ip).await {
                Ok((addr, shutdown, task)) => (Some(addr), Some(shutdown), Some(task)),
                Err(e) => {
                    error!(error = %e, "DNS responder failed to start");
                    (None, None, None)
                }
            };

        *self.running.lock().await = Some(Running {
            http_addr,
            http_task,
            dns_addr,
            dns_shutdown,
            dns_task,
        });
        *self.state.lock().await = ApState::Active;
        Ok(())
    }

    /// Stop the portal, the DNS responder (it notices the shutdown signal
    /// and exits its loop) and tear the AP down.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state != ApState::Active {
                warn!(state = ?*state, "softap stop ignored");
                return Ok(());
            }
            *state = ApState::Stopping;
        }

        if let Some(running) = self.running.lock().await.take() {
            if let Some(task) = running.http_task {
                task.abort();
            }
            if let Some(shutdown) = running.dns_shutdown {
                let _ = shutdown.send(());
            }
            if let Some(task) = running.dns_task {
                let _ = task.await;
            }
        }
        self.radio.stop_access_point().await?;

        *self.state.lock().await = ApState::Stopped;
        info!("SoftAP provisioning mode stopped");
        Ok(())
    }

    pub fn ap_ip(&self) -> Ipv4Addr {
        self.cfg.ap_ip
    }
}

pub fn format_mac(mac: [u8; 6]) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

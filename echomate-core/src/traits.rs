use crate::store::Credentials;
use async_trait::async_trait;
use serde::Serialize;
use std::borrow::Cow;
use std::net::Ipv4Addr;
use tokio::sync::broadcast;

/// Station connection info, available once an address has been acquired.
#[derive(Debug, Clone, Serialize)]
pub struct StationInfo {
    pub ip: Ipv4Addr,
    pub ssid: String,
    /// Signal strength in dBm.
    pub rssi: i8,
}

/// Events emitted by a radio backend while in station mode.
///
/// Backends push these through a broadcast channel instead of registering
/// callbacks; the station manager is the state machine that consumes them.
#[derive(Debug, Clone)]
pub enum RadioEvent {
    /// Associated with the AP; an address has not been acquired yet.
    Connected { ssid: String },
    Disconnected { reason: String },
    /// Address acquired; the join is complete.
    GotIp(StationInfo),
}

/// Radio hardware seam. The station/AP mode switch is an exclusive
/// resource: only the orchestrator and the SoftAP service may drive it,
/// and never while servers referencing the old mode are still running.
#[async_trait]
pub trait WifiRadio: Send + Sync {
    /// Bring the radio up in station mode. Idempotent.
    async fn init_station(&self) -> crate::Result<()>;

    /// Initiate a join. Non-blocking; the outcome arrives as [`RadioEvent`]s.
    async fn connect(&self, creds: &Credentials) -> crate::Result<()>;

    async fn disconnect(&self) -> crate::Result<()>;

    /// Bring up a local access point. Empty password means open network.
    async fn start_access_point(
        &self,
        ssid: &str,
        password: &str,
        channel: u8,
    ) -> crate::Result<()>;

    async fn stop_access_point(&self) -> crate::Result<()>;

    /// Hardware address of the station interface.
    fn mac(&self) -> [u8; 6];

    fn subscribe(&self) -> broadcast::Receiver<RadioEvent>;
}

/// 前端资源提供者接口。
#[async_trait]
pub trait UiAssetProvider: Send + Sync {
    /// Retrieves a single UI asset as `(content, mime type)`.
    async fn get_asset(&self, path: &str) -> crate::Result<(Cow<'static, [u8]>, String)>;
}

/// Embedded audio clip ids, numbered like the shipped PCM assets.
pub const CLIP_WELCOME: u32 = 1;
pub const CLIP_PROVISIONING: u32 = 2;
pub const CLIP_CONFIG_SAVED: u32 = 3;
pub const CLIP_SESSION_READY: u32 = 4;

/// Device-side collaborators: audio subsystem and restart/reset routines.
/// All calls are opaque, possibly slow, and possibly failing from the
/// orchestrator's perspective.
#[async_trait]
pub trait DeviceCollaborator: Send + Sync {
    /// Play one of the embedded clips through the speaker.
    async fn play_clip(&self, id: u32) -> crate::Result<()>;

    /// Record for `duration_secs`, returning the number of bytes captured.
    async fn record(&self, duration_secs: u32) -> crate::Result<usize>;

    /// Fail-stop restart. Does not return on the real device.
    async fn restart_device(&self);

    /// Erase user state beyond the credential store (which the caller
    /// erases itself).
    async fn factory_reset(&self);
}

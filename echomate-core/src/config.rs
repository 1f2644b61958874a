use serde::Deserialize;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Static device configuration, loaded once at boot from TOML.
/// Every field has a default so an empty file (or no file) yields a
/// working development setup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub device: DeviceSection,
    pub softap: SoftApSection,
    pub station: StationSection,
    pub session: SessionSection,
    pub store: StoreSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    pub name: String,
    /// Stable backend client id. Empty means "derive from the radio MAC".
    pub client_id: String,
    pub device_type: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SoftApSection {
    /// AP SSID prefix; the last 3 MAC bytes are appended to avoid
    /// collisions between units.
    pub ssid_prefix: String,
    /// Empty string means an open network.
    pub password: String,
    pub channel: u8,
    pub max_connections: u8,
    pub ap_ip: Ipv4Addr,
    pub http_port: u16,
    pub dns_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StationSection {
    pub max_retry: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Backend address, `host:port`.
    pub server_addr: String,
    pub reconnect_interval_ms: u64,
    pub network_timeout_ms: u64,
    pub quiet_period_ms: u64,
    pub supervisor_poll_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub path: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device: DeviceSection::default(),
            softap: SoftApSection::default(),
            station: StationSection::default(),
            session: SessionSection::default(),
            store: StoreSection::default(),
        }
    }
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            name: "EchoMate".to_string(),
            client_id: String::new(),
            device_type: "echomate-s3".to_string(),
        }
    }
}

impl Default for SoftApSection {
    fn default() -> Self {
        Self {
            ssid_prefix: "EchoMate-Setup-".to_string(),
            password: String::new(),
            channel: 1,
            max_connections: 4,
            ap_ip: Ipv4Addr::new(192, 168, 4, 1),
            http_port: 80,
            dns_port: 53,
        }
    }
}

impl Default for StationSection {
    fn default() -> Self {
        Self {
            max_retry: 5,
            backoff_base_ms: 500,
            backoff_cap_ms: 8_000,
            connect_timeout_ms: 30_000,
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:9001".to_string(),
            reconnect_interval_ms: 10_000,
            network_timeout_ms: 10_000,
            quiet_period_ms: 30_000,
            supervisor_poll_ms: 1_000,
        }
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: "/var/lib/echomate/wifi_config.toml".to_string(),
        }
    }
}

impl DeviceConfig {
    pub fn from_toml_str(s: &str) -> crate::Result<Self> {
        toml::from_str(s).map_err(|e| crate::Error::Fatal(format!("config parse: {e}")))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.station.connect_timeout_ms)
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.session.quiet_period_ms)
    }
}

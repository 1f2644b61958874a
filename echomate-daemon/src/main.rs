mod hooks;
mod orchestrator;

use echomate_core::config::DeviceConfig;
use echomate_core::traits::WifiRadio;
use hooks::DeviceHooks;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "/etc/echomate/config.toml";
const DEFAULT_CLIPS_DIR: &str = "/usr/share/echomate/clips";

// --- 无线后端选择 (编译期) ---

#[cfg(feature = "backend_wpa_cli")]
fn get_radio(cfg: &DeviceConfig) -> anyhow::Result<Arc<dyn WifiRadio>> {
    use anyhow::Context;
    use echomate_core::backends::wpa_cli::WpaCliRadio;
    println!("📶 Using wpa_cli radio backend");
    Ok(Arc::new(
        WpaCliRadio::new("wlan0", cfg.softap.ap_ip).context("wpa_cli radio init")?,
    ))
}

#[cfg(all(feature = "backend_mock", not(feature = "backend_wpa_cli")))]
fn get_radio(_cfg: &DeviceConfig) -> anyhow::Result<Arc<dyn WifiRadio>> {
    use echomate_core::backends::mock::MockRadio;
    println!("🤖 Using mock radio backend (no hardware access)");
    Ok(Arc::new(MockRadio::always_succeeding([
        0x24, 0x6f, 0x28, 0x11, 0x22, 0x33,
    ])))
}

#[cfg(not(any(feature = "backend_mock", feature = "backend_wpa_cli")))]
compile_error!(
    "No radio backend feature selected. Choose one, e.g. --features echomate-daemon/backend_wpa_cli"
);

fn load_config() -> anyhow::Result<DeviceConfig> {
    let path =
        std::env::var("ECHOMATE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    match std::fs::read_to_string(&path) {
        Ok(raw) => {
            info!(%path, "configuration loaded");
            Ok(DeviceConfig::from_toml_str(&raw)?)
        }
        Err(e) => {
            info!(%path, error = %e, "no configuration file, using defaults");
            Ok(DeviceConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("🚀 EchoMate connectivity daemon starting");

    let cfg = load_config()?;
    let radio = get_radio(&cfg)?;
    let clips_dir =
        std::env::var("ECHOMATE_CLIPS_DIR").unwrap_or_else(|_| DEFAULT_CLIPS_DIR.to_string());
    let collaborator = Arc::new(DeviceHooks::new(clips_dir));

    orchestrator::run(cfg, radio, collaborator).await
}

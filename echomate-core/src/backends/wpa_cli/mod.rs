// 后端：wpa_cli（通过 wpa_cli / ip / hostapd 子进程驱动无线网卡）
// Station joins go through wpa_cli network blocks; AP mode runs hostapd
// with a generated config. Join outcomes are surfaced as RadioEvents from
// a status poll task, so the station manager sees the same event stream as
// with any other backend.

use crate::store::Credentials;
use crate::traits::{RadioEvent, StationInfo, WifiRadio};
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);
const STATUS_POLL_LIMIT: u32 = 60;
const HOSTAPD_CONF_PATH: &str = "/tmp/echomate-hostapd.conf";

pub struct WpaCliRadio {
    iface: String,
    ap_ip: Ipv4Addr,
    mac: [u8; 6],
    hostapd: Arc<Mutex<Option<Child>>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<RadioEvent>,
}

impl WpaCliRadio {
    pub fn new(iface: &str, ap_ip: Ipv4Addr) -> Result<Self> {
        let mac = read_mac(iface)?;
        let (events, _) = broadcast::channel(32);
        Ok(Self {
            iface: iface.to_string(),
            ap_ip,
            mac,
            hostapd: Arc::new(Mutex::new(None)),
            poll_task: Mutex::new(None),
            events,
        })
    }

    fn wpa_cli(&self) -> Command {
        let mut cmd = Command::new("wpa_cli");
        cmd.arg("-i").arg(&self.iface);
        cmd
    }
}

fn read_mac(iface: &str) -> Result<[u8; 6]> {
    let path = format!("/sys/class/net/{iface}/address");
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| Error::Fatal(format!("cannot read {path}: {e}")))?;
    let mut mac = [0u8; 6];
    let mut parts = raw.trim().split(':');
    for byte in &mut mac {
        let part = parts
            .next()
            .ok_or_else(|| Error::Fatal(format!("malformed MAC in {path}")))?;
        *byte = u8::from_str_radix(part, 16)
            .map_err(|e| Error::Fatal(format!("malformed MAC in {path}: {e}")))?;
    }
    Ok(mac)
}

// Helper: run a command and return Output; produce a unified
// Error::CommandFailed on failure
async fn run_cmd_output(mut cmd: Command, ctx: &str) -> Result<Output> {
    match cmd.output().await {
        Ok(out) => {
            if !out.status.success() {
                let err = String::from_utf8_lossy(&out.stderr);
                error!(context = %ctx, stderr = %err, "command failed");
                return Err(Error::CommandFailed(format!("{ctx} failed: {err}")));
            }
            Ok(out)
        }
        Err(e) => {
            error!(context = %ctx, error = %e, "failed to spawn command");
            Err(Error::CommandFailed(format!("{ctx} spawn failed: {e}")))
        }
    }
}

async fn run_cmd_status(mut cmd: Command, ctx: &str) -> Result<()> {
    match cmd.status().await {
        Ok(status) => {
            if !status.success() {
                return Err(Error::CommandFailed(format!("{ctx} returned non-zero")));
            }
            Ok(())
        }
        Err(e) => Err(Error::CommandFailed(format!("{ctx} spawn failed: {e}"))),
    }
}

fn status_field<'a>(status: &'a str, key: &str) -> Option<&'a str> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(key).and_then(|r| r.strip_prefix('=')))
}

#[async_trait]
impl WifiRadio for WpaCliRadio {
    async fn init_station(&self) -> Result<()> {
        // wpa_supplicant already running is the common case; start it
        // otherwise. Idempotent either way.
        if run_cmd_output(
            {
                let mut c = self.wpa_cli();
                c.arg("status");
                c
            },
            "wpa_cli status",
        )
        .await
        .is_ok()
        {
            return Ok(());
        }

        info!(iface = %self.iface, "starting wpa_supplicant");
        run_cmd_status(
            {
                let mut c = Command::new("wpa_supplicant");
                c.arg("-B")
                    .arg("-i")
                    .arg(&self.iface)
                    .arg("-c")
                    .arg("/etc/wpa_supplicant.conf");
                c
            },
            "wpa_supplicant",
        )
        .await
        .map_err(|e| Error::Fatal(format!("station init: {e}")))
    }

    async fn connect(&self, creds: &Credentials) -> Result<()> {
        // fresh network block per attempt
        let out = run_cmd_output(
            {
                let mut c = self.wpa_cli();
                c.arg("add_network");
                c
            },
            "wpa_cli add_network",
        )
        .await?;
        let net_id = String::from_utf8_lossy(&out.stdout).trim().to_string();

        let mut settings = vec![("ssid".to_string(), format!("\"{}\"", creds.ssid))];
        if creds.password.is_empty() {
            settings.push(("key_mgmt".to_string(), "NONE".to_string()));
        } else {
            settings.push(("psk".to_string(), format!("\"{}\"", creds.password)));
        }
        for (key, value) in settings {
            run_cmd_output(
                {
                    let mut c = self.wpa_cli();
                    c.arg("set_network").arg(&net_id).arg(&key).arg(&value);
                    c
                },
                "wpa_cli set_network",
            )
            .await?;
        }
        run_cmd_output(
            {
                let mut c = self.wpa_cli();
                c.arg("select_network").arg(&net_id);
                c
            },
            "wpa_cli select_network",
        )
        .await?;

        // watch the join from a poll task; the outcome arrives as events
        let iface = self.iface.clone();
        let events = self.events.clone();
        let mut poll_task = self.poll_task.lock().await;
        if let Some(old) = poll_task.take() {
            old.abort();
        }
        *poll_task = Some(tokio::spawn(async move {
            let mut associated = false;
            for _ in 0..STATUS_POLL_LIMIT {
                tokio::time::sleep(STATUS_POLL_INTERVAL).await;
                let out = match Command::new("wpa_cli")
                    .arg("-i")
                    .arg(&iface)
                    .arg("status")
                    .output()
                    .await
                {
                    Ok(out) => out,
                    Err(e) => {
                        warn!(error = %e, "wpa_cli status poll failed");
                        let _ = events.send(RadioEvent::Disconnected {
                            reason: "status poll failed".to_string(),
                        });
                        return;
                    }
                };
                let status = String::from_utf8_lossy(&out.stdout).to_string();
                let state = status_field(&status, "wpa_state").unwrap_or("UNKNOWN");
                debug!(%state, "station status poll");

                match state {
                    "COMPLETED" => {
                        let ssid = status_field(&status, "ssid").unwrap_or_default().to_string();
                        if !associated {
                            associated = true;
                            let _ = events.send(RadioEvent::Connected { ssid: ssid.clone() });
                        }
                        if let Some(ip) = status_field(&status, "ip_address")
                            .and_then(|s| s.parse::<Ipv4Addr>().ok())
                        {
                            let _ = events.send(RadioEvent::GotIp(StationInfo {
                                ip,
                                ssid,
                                rssi: signal_dbm(&iface).await,
                            }));
                            return;
                        }
                    }
                    "DISCONNECTED" | "INACTIVE" if associated => {
                        let _ = events.send(RadioEvent::Disconnected {
                            reason: state.to_string(),
                        });
                        return;
                    }
                    _ => {}
                }
            }
            let _ = events.send(RadioEvent::Disconnected {
                reason: "join timed out".to_string(),
            });
        }));

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(task) = self.poll_task.lock().await.take() {
            task.abort();
        }
        run_cmd_status(
            {
                let mut c = self.wpa_cli();
                c.arg("disconnect");
                c
            },
            "wpa_cli disconnect",
        )
        .await
    }

    async fn start_access_point(&self, ssid: &str, password: &str, channel: u8) -> Result<()> {
        // clear leftovers from an unclean shutdown
        let _ = Command::new("killall").arg("-q").arg("hostapd").output().await;

        run_cmd_status(
            {
                let mut c = Command::new("ip");
                c.arg("addr")
                    .arg("add")
                    .arg(format!("{}/24", self.ap_ip))
                    .arg("dev")
                    .arg(&self.iface);
                c
            },
            "ip addr add",
        )
        .await
        .ok(); // already assigned is fine

        let mut conf = format!(
            "interface={}\nssid={}\nchannel={}\nhw_mode=g\n",
            self.iface, ssid, channel
        );
        if !password.is_empty() {
            conf.push_str(&format!(
                "wpa=2\nwpa_passphrase={password}\nwpa_key_mgmt=WPA-PSK\nrsn_pairwise=CCMP\n"
            ));
        }
        tokio::fs::write(HOSTAPD_CONF_PATH, conf).await?;

        let child = Command::new("hostapd")
            .arg(HOSTAPD_CONF_PATH)
            .spawn()
            .map_err(|e| Error::Fatal(format!("hostapd spawn failed: {e}")))?;
        *self.hostapd.lock().await = Some(child);

        info!(%ssid, iface = %self.iface, "access point up");
        Ok(())
    }

    async fn stop_access_point(&self) -> Result<()> {
        if let Some(mut child) = self.hostapd.lock().await.take() {
            let _ = child.kill().await;
        }
        let _ = run_cmd_status(
            {
                let mut c = Command::new("ip");
                c.arg("addr")
                    .arg("del")
                    .arg(format!("{}/24", self.ap_ip))
                    .arg("dev")
                    .arg(&self.iface);
                c
            },
            "ip addr del",
        )
        .await;
        Ok(())
    }

    fn mac(&self) -> [u8; 6] {
        self.mac
    }

    fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.events.subscribe()
    }
}

async fn signal_dbm(iface: &str) -> i8 {
    let out = Command::new("wpa_cli")
        .arg("-i")
        .arg(iface)
        .arg("signal_poll")
        .output()
        .await;
    if let Ok(out) = out {
        let text = String::from_utf8_lossy(&out.stdout).to_string();
        if let Some(rssi) = status_field(&text, "RSSI").and_then(|s| s.parse::<i16>().ok()) {
            return rssi.clamp(-127, 0) as i8;
        }
    }
    -127
}

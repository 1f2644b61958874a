//! A scripted radio for tests and hardware-less development.
//!
//! Each `connect` call consumes the next scripted outcome and emits the
//! matching radio events; the last outcome repeats once the script runs
//! dry, so an "always succeeds" mock is just a one-entry script.

use crate::store::Credentials;
use crate::traits::{RadioEvent, StationInfo, WifiRadio};
use crate::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone)]
pub enum JoinOutcome {
    /// Associate, then acquire this address.
    Success(StationInfo),
    /// Drop the link with the given reason.
    Refuse(String),
}

pub struct MockRadio {
    mac: [u8; 6],
    script: Mutex<VecDeque<JoinOutcome>>,
    last: Mutex<Option<JoinOutcome>>,
    events: broadcast::Sender<RadioEvent>,
    station_ready: AtomicBool,
    ap_ssid: Mutex<Option<String>>,
    connect_calls: AtomicU32,
}

impl MockRadio {
    pub fn with_script(mac: [u8; 6], outcomes: Vec<JoinOutcome>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            mac,
            script: Mutex::new(outcomes.into()),
            last: Mutex::new(None),
            events,
            station_ready: AtomicBool::new(false),
            ap_ssid: Mutex::new(None),
            connect_calls: AtomicU32::new(0),
        }
    }

    /// A radio that joins any network on the first try.
    pub fn always_succeeding(mac: [u8; 6]) -> Self {
        Self::with_script(
            mac,
            vec![JoinOutcome::Success(StationInfo {
                ip: Ipv4Addr::new(192, 168, 1, 50),
                ssid: String::new(),
                rssi: -52,
            })],
        )
    }

    /// Number of join attempts initiated so far.
    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// SSID of the currently running access point, if any.
    pub fn ap_ssid(&self) -> Option<String> {
        self.ap_ssid.lock().unwrap().clone()
    }

    fn next_outcome(&self) -> Option<JoinOutcome> {
        let mut script = self.script.lock().unwrap();
        let mut last = self.last.lock().unwrap();
        if let Some(outcome) = script.pop_front() {
            *last = Some(outcome.clone());
            Some(outcome)
        } else {
            last.clone()
        }
    }
}

#[async_trait]
impl WifiRadio for MockRadio {
    async fn init_station(&self) -> Result<()> {
        self.station_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, creds: &Credentials) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.next_outcome();
        let events = self.events.clone();
        let ssid = creds.ssid.clone();
        debug!(%ssid, ?outcome, "mock radio join");

        tokio::spawn(async move {
            // a little air time before the outcome lands
            tokio::time::sleep(Duration::from_millis(5)).await;
            match outcome {
                Some(JoinOutcome::Success(mut info)) => {
                    if info.ssid.is_empty() {
                        info.ssid = ssid.clone();
                    }
                    let _ = events.send(RadioEvent::Connected { ssid });
                    let _ = events.send(RadioEvent::GotIp(info));
                }
                Some(JoinOutcome::Refuse(reason)) => {
                    let _ = events.send(RadioEvent::Disconnected { reason });
                }
                None => {
                    let _ = events.send(RadioEvent::Disconnected {
                        reason: "no scripted outcome".to_string(),
                    });
                }
            }
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn start_access_point(&self, ssid: &str, _password: &str, _channel: u8) -> Result<()> {
        *self.ap_ssid.lock().unwrap() = Some(ssid.to_string());
        Ok(())
    }

    async fn stop_access_point(&self) -> Result<()> {
        *self.ap_ssid.lock().unwrap() = None;
        Ok(())
    }

    fn mac(&self) -> [u8; 6] {
        self.mac
    }

    fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.events.subscribe()
    }
}

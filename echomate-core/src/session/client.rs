//! Backend connection client.
//!
//! One logical connection to the backend, carried as newline-delimited JSON
//! text over TCP. Reconnection is native to the client: the connection task
//! retries with the configured interval until stopped, and publishes
//! connect/disconnect/message events plus a connection-state watch. The
//! session manager layers no reconnect loop on top of this.

use crate::config::SessionSection;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Events delivered to the session manager.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Message(String),
}

enum Command {
    Send(String),
    Stop,
}

pub struct BackendClient {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl BackendClient {
    /// Connect to `cfg.server_addr` (with the stable client id announced on
    /// the wire by the session manager) and keep the connection alive until
    /// [`stop`](Self::stop) or [`destroy`](Self::destroy).
    ///
    /// Returns the client plus the event stream.
    pub fn start(cfg: &SessionSection) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let task = tokio::spawn(connection_task(
            cfg.clone(),
            cmd_rx,
            event_tx,
            Arc::new(state_tx),
        ));

        (
            Self {
                cmd_tx,
                state_rx,
                task,
            },
            event_rx,
        )
    }

    /// Queue a text message. Fails silently while disconnected; the
    /// protocol above is event-driven and resends identity on reconnect.
    pub async fn send_text(&self, text: String) {
        if self.cmd_tx.send(Command::Send(text)).await.is_err() {
            warn!("backend client task gone, dropping outbound message");
        }
    }

    pub async fn send_json(&self, value: serde_json::Value) {
        self.send_text(value.to_string()).await;
    }

    /// The connection's own view of its state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Graceful stop: close the connection and end the task.
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop).await;
    }

    /// Hard teardown for the defensive-recovery path.
    pub fn destroy(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn connection_task(
    cfg: SessionSection,
    mut cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<SessionEvent>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
) {
    let reconnect_interval = Duration::from_millis(cfg.reconnect_interval_ms);
    let network_timeout = Duration::from_millis(cfg.network_timeout_ms);

    loop {
        let _ = state_tx.send(ConnectionState::Connecting);
        let stream = match tokio::time::timeout(
            network_timeout,
            TcpStream::connect(&cfg.server_addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(addr = %cfg.server_addr, error = %e, "backend connect failed");
                let _ = state_tx.send(ConnectionState::Disconnected);
                if wait_retry(&mut cmd_rx, reconnect_interval).await {
                    return;
                }
                continue;
            }
            Err(_) => {
                debug!(addr = %cfg.server_addr, "backend connect timed out");
                let _ = state_tx.send(ConnectionState::Disconnected);
                if wait_retry(&mut cmd_rx, reconnect_interval).await {
                    return;
                }
                continue;
            }
        };

        info!(addr = %cfg.server_addr, "backend session connected");
        let _ = state_tx.send(ConnectionState::Connected);
        if event_tx.send(SessionEvent::Connected).await.is_err() {
            return;
        }

        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut stopped = false;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Send(text)) => {
                        let mut framed = text;
                        framed.push('\n');
                        if let Err(e) = write_half.write_all(framed.as_bytes()).await {
                            warn!(error = %e, "backend write failed");
                            break;
                        }
                    }
                    Some(Command::Stop) | None => {
                        stopped = true;
                        break;
                    }
                },
                line = tokio::time::timeout(network_timeout, lines.next_line()) => match line {
                    Ok(Ok(Some(text))) => {
                        if event_tx.send(SessionEvent::Message(text)).await.is_err() {
                            return;
                        }
                    }
                    Ok(Ok(None)) => {
                        debug!("backend closed the connection");
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "backend read failed");
                        break;
                    }
                    // idle: probe the link; a dead peer fails the write
                    Err(_) => {
                        if let Err(e) = write_half.write_all(b"{\"event\":\"ping\"}\n").await {
                            warn!(error = %e, "backend idle probe failed");
                            break;
                        }
                    }
                },
            }
        }

        let _ = state_tx.send(ConnectionState::Disconnected);
        if event_tx.send(SessionEvent::Disconnected).await.is_err() {
            return;
        }
        if stopped {
            info!("backend session stopped");
            return;
        }
        if wait_retry(&mut cmd_rx, reconnect_interval).await {
            return;
        }
    }
}

/// Sleep out the reconnect interval, still honoring a Stop that arrives
/// mid-wait. Returns true when the task should end.
async fn wait_retry(cmd_rx: &mut mpsc::Receiver<Command>, interval: Duration) -> bool {
    let deadline = tokio::time::sleep(interval);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return false,
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Stop) | None => return true,
                // nothing to send it to; drop and keep waiting
                Some(Command::Send(_)) => {}
            },
        }
    }
}

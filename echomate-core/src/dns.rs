//! Captive-portal DNS responder.
//!
//! A minimal authoritative server that answers every A query with the
//! device's own access-point address. Replies are built with bounds-checked
//! byte writes; anything malformed or oversized is dropped, never answered
//! with a truncated packet.

use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shortest possible query: the 12-byte message header.
const MIN_QUERY_LEN: usize = 12;
/// Upper bound on the question section we are willing to echo back.
const MAX_QUESTION_LEN: usize = 64;
/// Short TTL so clients re-resolve once real connectivity returns.
const ANSWER_TTL_SECS: u32 = 10;

/// Bind a UDP socket and spawn the responder task.
///
/// Returns the bound address, a shutdown sender, and the task handle.
/// Dropping or firing the sender stops the loop; a socket error (the
/// socket being closed underneath us when provisioning stops) is terminal
/// as well, never retried.
pub async fn spawn_responder(
    bind: SocketAddr,
    ap_ip: Ipv4Addr,
) -> crate::Result<(SocketAddr, oneshot::Sender<()>, JoinHandle<()>)> {
    let sock = UdpSocket::bind(bind).await?;
    let local = sock.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        run(sock, ap_ip, shutdown_rx).await;
    });

    info!(addr = %local, %ap_ip, "DNS responder started");
    Ok((local, shutdown_tx, handle))
}

async fn run(sock: UdpSocket, ap_ip: Ipv4Addr, mut shutdown_rx: oneshot::Receiver<()>) {
    let mut buf = [0u8; 512];

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => {
                info!("DNS responder: shutdown requested");
                break;
            }
            res = sock.recv_from(&mut buf) => {
                match res {
                    Ok((len, peer)) => {
                        let query = &buf[..len];
                        match build_response(query, ap_ip) {
                            Some(reply) => {
                                debug!(domain = %question_name(query), %ap_ip, "answering DNS query");
                                let _ = sock.send_to(&reply, peer).await;
                            }
                            // malformed or oversized, silently dropped
                            None => debug!(len, %peer, "dropping malformed DNS query"),
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "DNS socket error, exiting responder");
                        break;
                    }
                }
            }
        }
    }
}

/// Offset one past the question section (labels + zero byte + QTYPE/QCLASS),
/// or `None` if the packet is truncated or the question exceeds the scratch
/// bound.
fn question_end(query: &[u8]) -> Option<usize> {
    let mut pos = MIN_QUERY_LEN;
    while pos < query.len() && query[pos] != 0 {
        pos += query[pos] as usize + 1;
    }
    // zero terminator + 2 bytes QTYPE + 2 bytes QCLASS
    let end = pos + 5;
    if end > query.len() || end - MIN_QUERY_LEN > MAX_QUESTION_LEN {
        return None;
    }
    Some(end)
}

/// Decode the queried name for logging only; the response never depends
/// on it.
fn question_name(query: &[u8]) -> String {
    let mut name = String::new();
    let mut pos = MIN_QUERY_LEN;
    while pos < query.len() && query[pos] != 0 && name.len() < MAX_QUESTION_LEN {
        let label_len = query[pos] as usize;
        pos += 1;
        if !name.is_empty() {
            name.push('.');
        }
        for _ in 0..label_len {
            if pos >= query.len() || name.len() >= MAX_QUESTION_LEN {
                break;
            }
            name.push(query[pos] as char);
            pos += 1;
        }
    }
    name
}

/// Build the reply for `query`, or `None` if the query must be dropped.
///
/// The reply copies the transaction id and question verbatim and appends a
/// single A record pointing at `ap_ip` with a 10-second TTL.
pub fn build_response(query: &[u8], ap_ip: Ipv4Addr) -> Option<Vec<u8>> {
    if query.len() < MIN_QUERY_LEN {
        return None;
    }
    let q_end = question_end(query)?;

    let mut reply = Vec::with_capacity(q_end + 16);
    // transaction id from the request
    reply.extend_from_slice(&query[0..2]);
    // flags: response, recursion available
    reply.extend_from_slice(&[0x81, 0x80]);
    // QD=1 AN=1 NS=0 AR=0
    reply.extend_from_slice(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
    // question section, verbatim
    reply.extend_from_slice(&query[MIN_QUERY_LEN..q_end]);
    // answer: pointer to the name at offset 12
    reply.extend_from_slice(&[0xC0, 0x0C]);
    // TYPE A, CLASS IN
    reply.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
    reply.extend_from_slice(&ANSWER_TTL_SECS.to_be_bytes());
    // RDLENGTH 4 + the AP address
    reply.extend_from_slice(&[0x00, 0x04]);
    reply.extend_from_slice(&ap_ip.octets());

    Some(reply)
}

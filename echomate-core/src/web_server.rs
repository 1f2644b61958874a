//! Provisioning HTTP server.
//!
//! Serves the embedded configuration page, a device-info endpoint, and the
//! set-wifi endpoint, plus a catch-all that redirects every other request
//! back to the portal root so captive-portal probes land on the page. No
//! authentication: the trust boundary is "anyone on the temporary AP".

use crate::store::{CredentialStore, Credentials};
use crate::traits::UiAssetProvider;
use axum::body::Body;
use axum::extract::{Form, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const NO_CACHE: &str = "no-store, no-cache, must-revalidate, max-age=0";

pub struct PortalState {
    pub store: Arc<CredentialStore>,
    pub frontend: Arc<dyn UiAssetProvider>,
    pub device_name: String,
    pub mac: String,
    pub ap_ip: Ipv4Addr,
}

/// Bind `addr` and serve the portal. Binding happens before the accept task
/// is spawned so a failure (port taken, no privileges) is observable to the
/// SoftAP service, which degrades to DNS-only captive mode.
pub async fn start_portal(
    state: Arc<PortalState>,
    addr: SocketAddr,
) -> crate::Result<(SocketAddr, JoinHandle<crate::Result<()>>)> {
    let app = Router::new()
        .route("/", get(serve_index))
        .route("/api/device-info", get(api_device_info))
        .route("/api/set-wifi", post(api_set_wifi))
        .fallback(captive_redirect)
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!(addr = %local, "provisioning HTTP server listening");

    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .await
            .map_err(|e| crate::Error::WebServer(e.into()))
    });

    Ok((local, handle))
}

async fn serve_index(State(state): State<Arc<PortalState>>) -> Response {
    match state.frontend.get_asset("index.html").await {
        Ok((data, mime)) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, mime)
            .header(header::CACHE_CONTROL, NO_CACHE)
            .body(Body::from(data))
            .unwrap(),
        Err(_) => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("configuration page missing"))
            .unwrap(),
    }
}

async fn api_device_info(State(state): State<Arc<PortalState>>) -> impl IntoResponse {
    (
        [
            (header::CACHE_CONTROL, NO_CACHE),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        Json(serde_json::json!({
            "status": "ok",
            "device_name": state.device_name,
            "mac": state.mac,
            "ip": state.ap_ip.to_string(),
        })),
    )
}

#[derive(Deserialize)]
struct SetWifiRequest {
    ssid: String,
    #[serde(default)]
    password: String,
}

/// `POST /api/set-wifi`, form-encoded. Always answers 200 with a JSON
/// status so the page can render the failure reason; a successful save
/// raises CONFIG_SAVED and the orchestrator takes it from there.
async fn api_set_wifi(
    State(state): State<Arc<PortalState>>,
    Form(req): Form<SetWifiRequest>,
) -> impl IntoResponse {
    let creds = Credentials {
        ssid: req.ssid,
        password: req.password,
    };
    info!(ssid = %creds.ssid, password_len = creds.password.len(), "received Wi-Fi configuration");

    let body = match state.store.save(&creds).await {
        Ok(()) => serde_json::json!({
            "status": "ok",
            "message": "configuration saved, device will restart and connect",
        }),
        Err(e) => serde_json::json!({
            "status": "error",
            "message": format!("failed to save configuration: {e}"),
        }),
    };

    (
        [
            (header::CACHE_CONTROL, NO_CACHE),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        Json(body),
    )
}

/// Captive-portal catch-all: every unmatched request is pushed back to the
/// portal root. Client families need different nudges, picked by a simple
/// User-Agent/Host sniff.
async fn captive_redirect(State(state): State<Arc<PortalState>>, headers: HeaderMap) -> Response {
    let ua = header_str(&headers, header::USER_AGENT);
    let host = header_str(&headers, header::HOST);
    debug!(%ua, %host, "captive portal catch-all");

    let is_xiaomi = ua.contains("MiuiBrowser") || ua.contains("XiaoMi") || ua.contains("MI ");
    let is_apple = ua.contains("iPhone")
        || ua.contains("iPad")
        || ua.contains("Mac")
        || host.contains("captive.apple.com");

    let root = format!("http://{}/", state.ap_ip);
    let builder = Response::builder()
        .header(header::CACHE_CONTROL, NO_CACHE)
        .header(header::PRAGMA, "no-cache")
        .header(header::EXPIRES, "0")
        .header(header::CONNECTION, "close");

    if is_xiaomi {
        builder
            .status(StatusCode::FOUND)
            .header(header::LOCATION, root)
            .body(Body::empty())
            .unwrap()
    } else if is_apple {
        let page = format!(
            "<!DOCTYPE html><html><head>\
             <meta http-equiv='refresh' content='0;url={root}'>\
             </head><body>\
             <h2>Opening setup page...</h2>\
             <p><a href='{root}'>tap here</a></p>\
             </body></html>"
        );
        builder
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/html")
            .body(Body::from(page))
            .unwrap()
    } else {
        let page = format!(
            "<!DOCTYPE html><html><head>\
             <meta http-equiv='refresh' content='0;url={root}'>\
             <script>window.location.href='{root}';</script>\
             </head><body>\
             <h2>Opening setup page...</h2>\
             <p>If nothing happens, <a href='{root}'>tap here</a></p>\
             </body></html>"
        );
        builder
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/html")
            .body(Body::from(page))
            .unwrap()
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

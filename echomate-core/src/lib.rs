//! Core library for the EchoMate connectivity stack.
//! This crate owns the provisioning flow (credential store, SoftAP captive
//! portal with DNS + HTTP), the station connection manager, and the backend
//! session manager. Radio hardware and the audio subsystem are reached
//! through the traits in [`traits`], with implementations selected by
//! feature flags.

pub mod backends;
pub mod config;
pub mod dns;
pub mod events;
pub mod frontends;
pub mod session;
pub mod softap;
pub mod state;
pub mod station;
pub mod store;
pub mod traits;
pub mod web_server;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad credential input. Reported back to the HTTP caller; never
    /// touches persisted state.
    #[error("validation error: {0}")]
    Validation(String),

    /// Socket errors and connection drops; retried per component policy.
    #[error("transient network error: {0}")]
    Transient(String),

    /// Buffer allocation failure. Callers degrade by shrinking once, then
    /// abort the operation and report.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// No stored credentials. Drives the provisioning branch.
    #[error("no valid configuration stored")]
    ConfigMissing,

    /// Unrecoverable radio/driver failure. Only the orchestrator may react,
    /// and the only supported recovery is a device restart.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("web server error: {0}")]
    WebServer(#[from] axum::BoxError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("asset not found: {0}")]
    AssetNotFound(String),
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;

//! Persisted Wi-Fi credential namespace.
//!
//! A single TOML file holding the `ssid` and `password` keys, guarded by an
//! internal mutex. Writes go through a temp file + rename so a save is
//! atomic from the caller's view: either both fields persist or neither.

use crate::events::{self, EventBus};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const MAX_SSID_LEN: usize = 32;
pub const MAX_PASSWORD_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

impl Credentials {
    /// A credential set is valid iff the ssid is non-empty and ≤32 bytes
    /// and the password is ≤64 bytes (empty is allowed for open networks).
    pub fn validate(&self) -> Result<()> {
        if self.ssid.is_empty() {
            return Err(Error::Validation("ssid must not be empty".into()));
        }
        if self.ssid.len() > MAX_SSID_LEN {
            return Err(Error::Validation(format!(
                "ssid exceeds {MAX_SSID_LEN} bytes"
            )));
        }
        if self.password.len() > MAX_PASSWORD_LEN {
            return Err(Error::Validation(format!(
                "password exceeds {MAX_PASSWORD_LEN} bytes"
            )));
        }
        Ok(())
    }
}

/// On-disk representation. Both keys optional so a partially written or
/// foreign file simply reads as "no valid configuration".
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredConfig {
    ssid: Option<String>,
    password: Option<String>,
}

pub struct CredentialStore {
    path: PathBuf,
    events: EventBus,
    lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>, events: EventBus) -> Self {
        Self {
            path: path.into(),
            events,
            lock: Mutex::new(()),
        }
    }

    /// Returns the stored credentials if a valid set exists. Absence of the
    /// file, either key, or a value outside the size limits all read as
    /// `None`.
    pub async fn has_valid_credentials(&self) -> Option<Credentials> {
        let _guard = self.lock.lock().await;
        let raw = tokio::fs::read_to_string(&self.path).await.ok()?;
        let stored: StoredConfig = match toml::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "credential file unreadable");
                return None;
            }
        };
        let creds = Credentials {
            ssid: stored.ssid?,
            password: stored.password?,
        };
        creds.validate().ok()?;
        Some(creds)
    }

    /// Validate and persist. On success the CONFIG_SAVED event bit is set
    /// as an observable side effect. Validation failures leave the
    /// persisted state untouched.
    pub async fn save(&self, creds: &Credentials) -> Result<()> {
        creds.validate()?;

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let stored = StoredConfig {
            ssid: Some(creds.ssid.clone()),
            password: Some(creds.password.clone()),
        };
        let body = toml::to_string(&stored)
            .map_err(|e| Error::Validation(format!("serialize credentials: {e}")))?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        info!(ssid = %creds.ssid, "credentials saved");
        self.events.set(events::CONFIG_SAVED);
        Ok(())
    }

    /// Remove both fields. Afterwards `has_valid_credentials` is `None`.
    pub async fn erase(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!("credentials erased");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("echomate-store-{}-{name}.toml", std::process::id()))
    }

    fn store(name: &str) -> CredentialStore {
        let path = scratch_path(name);
        let _ = std::fs::remove_file(&path);
        CredentialStore::new(path, EventBus::new())
    }

    #[tokio::test]
    async fn save_then_read_round_trips() {
        let store = store("roundtrip");
        let creds = Credentials {
            ssid: "MyNet".into(),
            password: "secret1".into(),
        };
        store.save(&creds).await.unwrap();
        assert_eq!(store.has_valid_credentials().await, Some(creds));
        assert_ne!(store.events.get() & events::CONFIG_SAVED, 0);
    }

    #[tokio::test]
    async fn empty_password_is_valid() {
        let store = store("open-network");
        let creds = Credentials {
            ssid: "OpenNet".into(),
            password: String::new(),
        };
        store.save(&creds).await.unwrap();
        assert_eq!(store.has_valid_credentials().await, Some(creds));
    }

    #[tokio::test]
    async fn invalid_input_rejected_and_state_unchanged() {
        let store = store("validation");
        let good = Credentials {
            ssid: "Home".into(),
            password: "pw".into(),
        };
        store.save(&good).await.unwrap();

        for bad in [
            Credentials {
                ssid: String::new(),
                password: "pw".into(),
            },
            Credentials {
                ssid: "x".repeat(33),
                password: "pw".into(),
            },
            Credentials {
                ssid: "Home".into(),
                password: "x".repeat(65),
            },
        ] {
            let err = store.save(&bad).await.unwrap_err();
            assert!(matches!(err, Error::Validation(_)));
            assert_eq!(store.has_valid_credentials().await, Some(good.clone()));
        }
    }

    #[tokio::test]
    async fn erase_removes_config() {
        let store = store("erase");
        store
            .save(&Credentials {
                ssid: "Net".into(),
                password: "pw".into(),
            })
            .await
            .unwrap();
        store.erase().await.unwrap();
        assert_eq!(store.has_valid_credentials().await, None);
        // erasing twice is fine
        store.erase().await.unwrap();
    }

    #[tokio::test]
    async fn missing_key_reads_as_no_config() {
        let path = scratch_path("partial");
        std::fs::write(&path, "ssid = \"OnlySsid\"\n").unwrap();
        let store = CredentialStore::new(path, EventBus::new());
        assert_eq!(store.has_valid_credentials().await, None);
    }
}

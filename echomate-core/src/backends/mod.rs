//! Radio backend implementations behind the [`WifiRadio`] seam.
//!
//! [`WifiRadio`]: crate::traits::WifiRadio

pub mod mock;

#[cfg(feature = "backend_wpa_cli")]
pub mod wpa_cli;

//! Venue API credential handling.
//!
//! Secrets live in `Zeroizing` buffers so they are wiped from memory on drop,
//! and never appear in `Debug` output.

use std::env;

use tracing::warn;
use zeroize::Zeroizing;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("environment variable not set: {0}")]
    EnvVarNotSet(String),

    #[error("secret validation failed: {0}")]
    ValidationFailed(String),
}

/// Signed-endpoint credentials for the venue.
pub struct VenueCredentials {
    pub api_key: String,
    pub api_secret: Zeroizing<String>,
}

impl std::fmt::Debug for VenueCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueCredentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<REDACTED>")
            .finish()
    }
}

impl VenueCredentials {
    /// Load from `VENUE_API_KEY` / `VENUE_API_SECRET`.
    pub fn from_env() -> Result<Self, SecretError> {
        let api_key = env::var("VENUE_API_KEY")
            .map_err(|_| SecretError::EnvVarNotSet("VENUE_API_KEY".to_string()))?;
        let api_secret = Zeroizing::new(
            env::var("VENUE_API_SECRET")
                .map_err(|_| SecretError::EnvVarNotSet("VENUE_API_SECRET".to_string()))?,
        );

        if api_key.trim().is_empty() {
            return Err(SecretError::ValidationFailed("VENUE_API_KEY is empty".to_string()));
        }
        if api_secret.trim().is_empty() {
            return Err(SecretError::ValidationFailed("VENUE_API_SECRET is empty".to_string()));
        }
        if api_secret.len() < 16 {
            warn!("VENUE_API_SECRET looks unusually short; check the configured credential");
        }

        Ok(VenueCredentials { api_key, api_secret })
    }
}

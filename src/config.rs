//! Runtime configuration and secrets loading.
//!
//! Secrets live in a small TOML file (`secrets.toml` by default) holding the
//! OAuth2 client id, client secret, and the fixed redirect URI registered
//! with the application. The file is size-checked before parsing to prevent
//! out-of-memory conditions from a corrupt or misplaced path.

use std::{fs, io, time::Duration};

use serde::Deserialize;
use veil::Redact;

/// Hostname of the OAuth2 token endpoint.
pub const ACCOUNTS_HOST: &str = "accounts.spotify.com";

/// Hostname of the player API.
pub const API_HOST: &str = "api.spotify.com";

/// Both hosts only speak TLS.
pub const HTTPS_PORT: u16 = 443;

/// Default interval between playback polls.
pub const DEFAULT_POLLING_DELAY: Duration = Duration::from_secs(5);

/// Application configuration assembled from the CLI and the secrets file.
#[derive(Clone, Redact, PartialEq, Eq)]
pub struct Config {
    pub client_id: String,
    #[redact]
    pub client_secret: String,

    /// Redirect URI exactly as registered with the service. Sent
    /// percent-encoded in authorization-code grant bodies.
    pub redirect_uri: String,

    /// Base interval between playback polls.
    pub polling_delay: Duration,

    pub accounts_host: String,
    pub accounts_port: u16,
    pub api_host: String,
    pub api_port: u16,
}

/// Shape of the secrets file.
#[derive(Redact, Deserialize)]
struct Secrets {
    client_id: String,
    #[redact]
    client_secret: String,
    redirect_uri: String,
}

impl Config {
    /// Loads configuration from a secrets file.
    ///
    /// Returns `io::ErrorKind::InvalidData` when the file is oversized,
    /// is not valid TOML, or has empty fields.
    pub fn from_secrets_file(secrets_file: &str) -> io::Result<Self> {
        // Prevent out-of-memory condition: the secrets file should be small.
        let attributes = fs::metadata(secrets_file)?;
        if attributes.len() > 1024 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{secrets_file} is too large"),
            ));
        }

        let contents = fs::read_to_string(secrets_file)?;
        let secrets: Secrets = toml::from_str(&contents).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{secrets_file} format is invalid: {e}"),
            )
        })?;

        if secrets.client_id.is_empty()
            || secrets.client_secret.is_empty()
            || secrets.redirect_uri.is_empty()
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{secrets_file} has one or more empty fields"),
            ));
        }

        Ok(Self {
            client_id: secrets.client_id,
            client_secret: secrets.client_secret,
            redirect_uri: secrets.redirect_uri,
            polling_delay: DEFAULT_POLLING_DELAY,
            accounts_host: ACCOUNTS_HOST.to_owned(),
            accounts_port: HTTPS_PORT,
            api_host: API_HOST.to_owned(),
            api_port: HTTPS_PORT,
        })
    }
}

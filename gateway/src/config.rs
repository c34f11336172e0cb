use experiments::RemoteClientConfig;
use http::HeaderName;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_COOKIE_NAME: &str = "xpr.config";

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Invalid cookie name: {0:?}")]
    InvalidCookieName(String),

    #[error("Invalid identity header: {0:?}")]
    InvalidIdentityHeader(String),

    #[error("Refresh interval cannot be 0")]
    InvalidRefreshInterval,
}

/// Gateway configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Main listener for incoming requests
    pub listener: Listener,
    /// Admin listener for health and readiness checks
    pub admin_listener: Listener,
    #[serde(default)]
    pub features: FeaturesConfig,
    /// Configuration service the experiments are fetched from
    pub remote: RemoteClientConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;
        self.features.validate()
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeaturesConfig {
    /// Name of the cookie holding the experiment state
    pub cookie_name: String,
    /// Request header carrying the user id. Requests without it are anonymous.
    pub identity_header: Option<String>,
    /// Reload the configuration this often. Without it the configuration is only
    /// loaded at startup and on demand.
    pub refresh_interval_secs: Option<u64>,
    /// Register the declared experiments with the configuration service at startup
    /// instead of only loading.
    pub announce: bool,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        FeaturesConfig {
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            identity_header: None,
            refresh_interval_secs: None,
            announce: false,
        }
    }
}

impl FeaturesConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_cookie_token(&self.cookie_name) {
            return Err(ValidationError::InvalidCookieName(self.cookie_name.clone()));
        }

        if let Some(header) = &self.identity_header
            && HeaderName::from_bytes(header.as_bytes()).is_err()
        {
            return Err(ValidationError::InvalidIdentityHeader(header.clone()));
        }

        if self.refresh_interval_secs == Some(0) {
            return Err(ValidationError::InvalidRefreshInterval);
        }

        Ok(())
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval_secs.map(Duration::from_secs)
    }
}

// RFC 6265 cookie-name: a token, so no controls, whitespace or separators.
fn is_cookie_token(name: &str) -> bool {
    const SEPARATORS: &[u8] = b"()<>@,;:\\\"/[]?={}";
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_graphic() && !SEPARATORS.contains(&b))
}

use serde::Deserialize;
use serde_json::Value;
use url::Url;

fn default_timeout_secs() -> u64 {
    10
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

/// Connection settings for the configuration service.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RemoteClientConfig {
    /// Base URL of the configuration service
    pub url: Url,
    /// Application name the experiments are registered under
    pub app: String,
    /// Deployment reference, e.g. an environment name
    pub reference: String,
    /// Experiments declared by this application. Announced on startup when enabled,
    /// and used as the fallback configuration when the service is unreachable.
    #[serde(default)]
    pub experiments: Vec<Value>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

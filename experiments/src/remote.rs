const MAX_RETRIES: u32 = 3;

use crate::config::RemoteClientConfig;
use crate::types::RemoteConfig;
use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::time::{Duration, sleep};

#[derive(thiserror::Error, Debug)]
pub enum RemoteErrorKind {
    #[error("request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("configuration service unavailable")]
    RetriesExceeded,
    #[error("unexpected status {0}")]
    UnexpectedStatus(StatusCode),
}

/// A failed fetch together with the configuration to fall back on.
#[derive(thiserror::Error, Debug)]
#[error("{kind}")]
pub struct RemoteError {
    #[source]
    pub kind: RemoteErrorKind,
    pub defaults: RemoteConfig,
}

/// Source of experiment configuration.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Reference the configuration is fetched for, passed on to the oracle.
    fn reference(&self) -> String;

    async fn load(&self) -> Result<RemoteConfig, RemoteError>;

    /// Registers the experiments this service declares and returns the resulting
    /// configuration.
    async fn announce(&self) -> Result<RemoteConfig, RemoteError>;
}

#[async_trait]
impl<T: RemoteClient + ?Sized> RemoteClient for Arc<T> {
    fn reference(&self) -> String {
        (**self).reference()
    }

    async fn load(&self) -> Result<RemoteConfig, RemoteError> {
        (**self).load().await
    }

    async fn announce(&self) -> Result<RemoteConfig, RemoteError> {
        (**self).announce().await
    }
}

#[derive(Serialize)]
struct AnnounceBody<'a> {
    reference: &'a str,
    experiments: &'a [Value],
}

/// Talks to the configuration service over HTTP.
///
/// `GET {url}/apps/{app}?reference=..` loads, `PUT {url}/apps/{app}` announces. Both
/// answer with a `{"app": .., "shared": ..}` document.
pub struct HttpRemoteClient {
    client: reqwest::Client,
    app_url: String,
    reference: String,
    experiments: Vec<Value>,
    retry_base_delay: Duration,
}

impl HttpRemoteClient {
    pub fn new(config: &RemoteClientConfig) -> Result<Self, RemoteErrorKind> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let app_url = format!(
            "{}/apps/{}",
            config.url.as_str().trim_end_matches('/'),
            config.app
        );

        Ok(HttpRemoteClient {
            client,
            app_url,
            reference: config.reference.clone(),
            experiments: config.experiments.clone(),
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        })
    }

    /// Used when the service cannot be reached: only the locally declared experiments.
    pub fn defaults(&self) -> RemoteConfig {
        RemoteConfig {
            app: json!({ "experiments": self.experiments }),
            shared: json!({}),
        }
    }

    async fn fetch(&self, method: Method) -> Result<RemoteConfig, RemoteErrorKind> {
        const RETRIABLE_STATUS_CODES: &[StatusCode] = &[
            StatusCode::TOO_MANY_REQUESTS,     // 429
            StatusCode::INTERNAL_SERVER_ERROR, // 500
            StatusCode::BAD_GATEWAY,           // 502
            StatusCode::SERVICE_UNAVAILABLE,   // 503
            StatusCode::GATEWAY_TIMEOUT,       // 504
        ];

        let mut url = Url::parse(&self.app_url)?;
        if method == Method::GET {
            url.query_pairs_mut()
                .append_pair("reference", &self.reference);
        }

        let mut retries = 0;

        loop {
            let mut request = self.client.request(method.clone(), url.clone());
            if method == Method::PUT {
                request = request.json(&AnnounceBody {
                    reference: &self.reference,
                    experiments: &self.experiments,
                });
            }

            let response = request.send().await?;
            let status = response.status();

            if status.is_success() {
                return Ok(response.json::<RemoteConfig>().await?);
            }

            if !RETRIABLE_STATUS_CODES.contains(&status) {
                return Err(RemoteErrorKind::UnexpectedStatus(status));
            }

            if retries >= MAX_RETRIES {
                return Err(RemoteErrorKind::RetriesExceeded);
            }

            let delay = self.retry_base_delay * 2_u32.pow(retries);
            tracing::debug!(%status, retries, ?delay, "retrying configuration fetch");
            sleep(delay).await;
            retries += 1;
        }
    }

    fn with_defaults(
        &self,
        result: Result<RemoteConfig, RemoteErrorKind>,
    ) -> Result<RemoteConfig, RemoteError> {
        result.map_err(|kind| RemoteError {
            kind,
            defaults: self.defaults(),
        })
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    fn reference(&self) -> String {
        self.reference.clone()
    }

    async fn load(&self) -> Result<RemoteConfig, RemoteError> {
        let result = self.fetch(Method::GET).await;
        self.with_defaults(result)
    }

    async fn announce(&self) -> Result<RemoteConfig, RemoteError> {
        let result = self.fetch(Method::PUT).await;
        self.with_defaults(result)
    }
}

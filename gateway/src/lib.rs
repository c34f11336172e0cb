//! HTTP integration of experiment resolution: a hyper service wrapper that resolves
//! features for every request and keeps the experiments cookie up to date.

mod client;
pub mod config;
pub mod cookies;
pub mod errors;
pub mod identity;
pub mod metrics_defs;
mod service;
pub mod store;
#[cfg(test)]
mod testutils;

pub use client::{Command, FeatureClient, RefreshError, RefreshHandle};
pub use errors::GatewayError;
pub use service::FeatureService;
pub use store::{CookieStore, CookieUpdate, ExperimentStore};

use experiments::{HttpRemoteClient, default_oracles};
use http::HeaderName;
use hyper::body::{Body, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use identity::{AnonymousIdentity, HeaderIdentity, Identify};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::error::Error as StdError;
use std::sync::Arc;

/// Serves `handler` behind [`FeatureService`] on the main listener, and readiness
/// checks on the admin listener, until either listener fails.
pub async fn run<H, B>(config: config::Config, handler: H) -> Result<(), GatewayError>
where
    H: Service<Request<Incoming>, Response = Response<B>> + Send + Sync + 'static,
    H::Future: Send + 'static,
    H::Error: Into<Box<dyn StdError + Send + Sync>> + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    config.validate()?;

    let remote = Arc::new(HttpRemoteClient::new(&config.remote)?);
    let client = FeatureClient::new(&config.features, remote, default_oracles());
    let refresher = client.start();

    let identity: Arc<dyn Identify> = match &config.features.identity_header {
        Some(header) => {
            let header = HeaderName::from_bytes(header.as_bytes())
                .map_err(|_| config::ValidationError::InvalidIdentityHeader(header.clone()))?;
            Arc::new(HeaderIdentity::new(header))
        }
        None => Arc::new(AnonymousIdentity),
    };

    let ready_client = client.clone();
    let admin = AdminService::new(move || ready_client.is_ready());
    let features = FeatureService::new(handler, client, identity);

    let main_task = run_http_service(&config.listener.host, config.listener.port, features);
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin,
    );

    let result = tokio::try_join!(main_task, admin_task);
    refresher.shutdown().await;
    result?;

    Ok(())
}

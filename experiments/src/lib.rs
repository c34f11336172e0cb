//! Per-user experiment and feature-flag resolution.
//!
//! A [`FetchState`] applies configuration fetched through a [`RemoteClient`] to one
//! [`ExperimentOracle`] per [`Domain`]. For each request, [`FeatureResolver`] combines
//! the oracles with what the user's cookie remembers and any query overrides.

pub mod codec;
pub mod config;
pub mod fetch_state;
pub mod metrics_defs;
pub mod oracle;
pub mod remote;
pub mod resolver;
pub mod types;

pub use config::RemoteClientConfig;
pub use fetch_state::{CachedClient, FetchState};
pub use oracle::{DefaultOracle, ExperimentOracle, UserContext, default_oracles};
pub use remote::{HttpRemoteClient, RemoteClient, RemoteError, RemoteErrorKind};
pub use resolver::{FeatureResolver, RequestFeatures, Resolution};
pub use types::{CookieState, Domain, FeatureSnapshot, PerDomain, RemoteConfig};

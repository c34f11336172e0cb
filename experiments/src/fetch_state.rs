use crate::metrics_defs::{FETCH_APPLY, REMOTE_REQUEST_DURATION};
use crate::oracle::ExperimentOracle;
use crate::remote::{RemoteClient, RemoteError};
use crate::types::{PerDomain, RemoteConfig, Stamp};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use shared::{counter, histogram};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

struct FetchStateInner {
    stamps: PerDomain<Option<Stamp>>,
    last_fetch: Option<RemoteConfig>,
}

/// Process-wide record of the last applied configuration.
///
/// Configures the domain oracles whenever a configuration is applied. Requests only
/// ever read from the oracles; this is the single writer.
pub struct FetchState {
    oracles: PerDomain<Arc<dyn ExperimentOracle>>,
    reference: String,
    inner: Mutex<FetchStateInner>,
    // Set by the first apply of any kind and never cleared. Also backs readiness.
    fetched: AtomicBool,
}

impl FetchState {
    pub fn new(
        oracles: PerDomain<Arc<dyn ExperimentOracle>>,
        reference: impl Into<String>,
    ) -> Self {
        FetchState {
            oracles,
            reference: reference.into(),
            inner: Mutex::new(FetchStateInner {
                stamps: PerDomain::default(),
                last_fetch: None,
            }),
            fetched: AtomicBool::new(false),
        }
    }

    /// Applies a fetched configuration. `optional` marks fallback defaults from a failed
    /// fetch: those are dropped once anything has been applied, so a failure never
    /// replaces a good configuration. Returns whether the configuration was applied.
    pub fn apply_config(&self, config: &RemoteConfig, optional: bool) -> bool {
        let mut inner = self.inner.lock();

        if optional && self.fetched.load(Ordering::Acquire) {
            counter!(FETCH_APPLY, "path" => "skipped").increment(1);
            tracing::debug!("keeping previously applied configuration");
            return false;
        }

        let app = match &config.app {
            Value::Null => json!({}),
            app => app.clone(),
        };
        inner.stamps.app = Some(self.oracles.app.configure(&app, &self.reference));

        if config.shared_experiments().is_some() {
            let stamp = self.oracles.shared.configure(&config.shared, &self.reference);
            inner.stamps.shared = Some(stamp);
        }

        inner.last_fetch = Some(config.clone());
        self.fetched.store(true, Ordering::Release);

        let path = if optional { "defaults" } else { "success" };
        counter!(FETCH_APPLY, "path" => path).increment(1);
        tracing::info!(
            path,
            app_stamp = inner.stamps.app.as_deref(),
            shared_stamp = inner.stamps.shared.as_deref(),
            "applied experiment configuration"
        );

        true
    }

    pub fn has_fetched(&self) -> bool {
        self.fetched.load(Ordering::Acquire)
    }

    pub fn stamps(&self) -> PerDomain<Option<Stamp>> {
        self.inner.lock().stamps.clone()
    }

    pub fn last_fetch(&self) -> Option<RemoteConfig> {
        self.inner.lock().last_fetch.clone()
    }

    pub fn oracles(&self) -> &PerDomain<Arc<dyn ExperimentOracle>> {
        &self.oracles
    }
}

/// Wraps a [`RemoteClient`] so that every outcome of `load` and `announce` lands in a
/// [`FetchState`]: successes are applied, failures apply their defaults optionally.
/// Results are passed through untouched.
pub struct CachedClient<C> {
    inner: C,
    state: Arc<FetchState>,
}

impl<C: RemoteClient> CachedClient<C> {
    pub fn new(inner: C, state: Arc<FetchState>) -> Self {
        CachedClient { inner, state }
    }

    pub fn state(&self) -> &Arc<FetchState> {
        &self.state
    }

    fn settle(
        &self,
        op: &'static str,
        started: Instant,
        result: &Result<RemoteConfig, RemoteError>,
    ) {
        let status = if result.is_ok() { "ok" } else { "error" };
        histogram!(REMOTE_REQUEST_DURATION, "op" => op, "status" => status)
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(config) => {
                self.state.apply_config(config, false);
            }
            Err(err) => {
                tracing::warn!(op, error = %err, "experiment configuration fetch failed");
                self.state.apply_config(&err.defaults, true);
            }
        }
    }
}

#[async_trait]
impl<C: RemoteClient> RemoteClient for CachedClient<C> {
    fn reference(&self) -> String {
        self.inner.reference()
    }

    async fn load(&self) -> Result<RemoteConfig, RemoteError> {
        let started = Instant::now();
        let result = self.inner.load().await;
        self.settle("load", started, &result);
        result
    }

    async fn announce(&self) -> Result<RemoteConfig, RemoteError> {
        let started = Instant::now();
        let result = self.inner.announce().await;
        self.settle("announce", started, &result);
        result
    }
}

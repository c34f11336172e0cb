use crate::config::FeaturesConfig;
use crate::metrics_defs::REFRESHES;
use experiments::{
    CachedClient, ExperimentOracle, FeatureResolver, FetchState, PerDomain, RemoteClient,
    RemoteConfig, RemoteError,
};
use shared::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};

#[derive(Debug)]
pub enum Command {
    // Reload the configuration outside of the normal interval.
    // The worker replies once the attempt finishes.
    Refresh(oneshot::Sender<Result<(), RemoteError>>),
    // Stop the worker
    Shutdown,
}

#[derive(thiserror::Error, Debug)]
pub enum RefreshError {
    #[error("refresh worker is not running")]
    WorkerGone,
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

struct FeatureClientInner {
    remote: CachedClient<Arc<dyn RemoteClient>>,
    resolver: FeatureResolver,
    cookie_name: String,
    refresh_interval: Option<Duration>,
    announce: bool,
}

/// Everything a request needs to resolve features, plus the means to keep the
/// configuration current. Cheap to clone.
#[derive(Clone)]
pub struct FeatureClient {
    inner: Arc<FeatureClientInner>,
}

impl FeatureClient {
    pub fn new(
        config: &FeaturesConfig,
        remote: Arc<dyn RemoteClient>,
        oracles: PerDomain<Arc<dyn ExperimentOracle>>,
    ) -> Self {
        let state = Arc::new(FetchState::new(oracles.clone(), remote.reference()));

        FeatureClient {
            inner: Arc::new(FeatureClientInner {
                remote: CachedClient::new(remote, state),
                resolver: FeatureResolver::new(oracles),
                cookie_name: config.cookie_name.clone(),
                refresh_interval: config.refresh_interval(),
                announce: config.announce,
            }),
        }
    }

    pub async fn load(&self) -> Result<RemoteConfig, RemoteError> {
        self.inner.remote.load().await
    }

    pub async fn announce(&self) -> Result<RemoteConfig, RemoteError> {
        self.inner.remote.announce().await
    }

    /// Whether any configuration, fetched or defaulted, has been applied.
    pub fn is_ready(&self) -> bool {
        self.inner.remote.state().has_fetched()
    }

    pub fn state(&self) -> &Arc<FetchState> {
        self.inner.remote.state()
    }

    pub fn resolver(&self) -> &FeatureResolver {
        &self.inner.resolver
    }

    pub fn cookie_name(&self) -> &str {
        &self.inner.cookie_name
    }

    /// Spawns the refresh worker. It announces or loads once right away, then
    /// reloads on the configured interval and whenever asked to.
    pub fn start(&self) -> RefreshHandle {
        let (tx, rx) = mpsc::channel::<Command>(16);
        let client = self.clone();
        let handle = tokio::spawn(async move { client.run_worker(rx).await });
        RefreshHandle { tx, handle }
    }

    async fn run_worker(&self, mut rx: mpsc::Receiver<Command>) {
        let initial = if self.inner.announce {
            self.announce().await
        } else {
            self.load().await
        };
        record_refresh("startup", &initial);

        let mut ticker = self.inner.refresh_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                _ = next_tick(&mut ticker) => {
                    let result = self.load().await;
                    record_refresh("interval", &result);
                }
                command = rx.recv() => match command {
                    Some(Command::Refresh(reply)) => {
                        let result = self.load().await;
                        record_refresh("command", &result);
                        let _ = reply.send(result.map(|_| ()));
                    }
                    Some(Command::Shutdown) | None => break,
                },
            }
        }

        tracing::info!("refresh worker stopped");
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn record_refresh(trigger: &'static str, result: &Result<RemoteConfig, RemoteError>) {
    let outcome = if result.is_ok() { "ok" } else { "error" };
    counter!(REFRESHES, "trigger" => trigger, "outcome" => outcome).increment(1);
}

/// Controls a running refresh worker.
pub struct RefreshHandle {
    tx: mpsc::Sender<Command>,
    handle: tokio::task::JoinHandle<()>,
}

impl RefreshHandle {
    /// Reloads now and waits for the outcome. Failed loads still apply their
    /// defaults when nothing was applied before.
    pub async fn refresh(&self) -> Result<(), RefreshError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Command::Refresh(reply))
            .await
            .map_err(|_| RefreshError::WorkerGone)?;
        response.await.map_err(|_| RefreshError::WorkerGone)??;
        Ok(())
    }

    /// Stops the worker and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.tx.send(Command::Shutdown).await;
        if let Err(err) = self.handle.await {
            tracing::error!(error = %err, "refresh worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{ScriptedRemote, configured, unavailable};
    use experiments::default_oracles;
    use serde_json::json;

    fn client(
        remote: ScriptedRemote,
        config: FeaturesConfig,
    ) -> (FeatureClient, Arc<ScriptedRemote>) {
        let remote = Arc::new(remote);
        let client = FeatureClient::new(&config, remote.clone(), default_oracles());
        (client, remote)
    }

    #[tokio::test]
    async fn test_load_makes_ready() {
        let (client, _) = client(
            ScriptedRemote::new(vec![Ok(configured(true))]),
            FeaturesConfig::default(),
        );
        assert!(!client.is_ready());
        assert_eq!(client.cookie_name(), "xpr.config");

        client.load().await.unwrap();
        assert!(client.is_ready());
        assert_eq!(client.state().last_fetch(), Some(configured(true)));
    }

    #[tokio::test]
    async fn test_failed_load_is_ready_with_defaults() {
        let (client, _) = client(
            ScriptedRemote::new(vec![unavailable()]),
            FeaturesConfig::default(),
        );

        assert!(client.load().await.is_err());
        assert!(client.is_ready());
        let defaults = client.state().last_fetch().unwrap();
        assert_eq!(defaults.shared, json!({}));
    }

    #[tokio::test]
    async fn test_worker_refresh_and_shutdown() {
        let (client, remote) = client(
            ScriptedRemote::new(vec![
                Ok(configured(false)),
                Ok(configured(true)),
                unavailable(),
            ]),
            FeaturesConfig::default(),
        );

        let handle = client.start();

        handle.refresh().await.unwrap();
        assert_eq!(client.state().last_fetch(), Some(configured(true)));

        // failures reach the caller but keep the applied configuration
        assert!(matches!(
            handle.refresh().await,
            Err(RefreshError::Remote(_))
        ));
        assert_eq!(client.state().last_fetch(), Some(configured(true)));

        handle.shutdown().await;
        assert_eq!(remote.calls(), vec!["load", "load", "load"]);
    }

    #[tokio::test]
    async fn test_worker_announces_first() {
        let config = FeaturesConfig {
            announce: true,
            ..Default::default()
        };
        let (client, remote) = client(
            ScriptedRemote::new(vec![Ok(configured(true)), Ok(configured(false))]),
            config,
        );

        let handle = client.start();
        handle.refresh().await.unwrap();
        handle.shutdown().await;

        assert_eq!(remote.calls(), vec!["announce", "load"]);
        assert_eq!(client.state().last_fetch(), Some(configured(false)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_reloads_on_interval() {
        let config = FeaturesConfig {
            refresh_interval_secs: Some(30),
            ..Default::default()
        };
        let (client, remote) = client(
            ScriptedRemote::new(vec![Ok(configured(false)), Ok(configured(true))]),
            config,
        );

        let handle = client.start();
        tokio::time::sleep(Duration::from_secs(31)).await;
        handle.shutdown().await;

        assert_eq!(remote.calls(), vec!["load", "load"]);
        assert_eq!(client.state().last_fetch(), Some(configured(true)));
    }

    #[tokio::test]
    async fn test_http_remote_defaults_then_fetch() {
        use experiments::{HttpRemoteClient, RemoteClientConfig};
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let mock_server = MockServer::start().await;
        let remote_config: RemoteClientConfig = serde_yaml::from_str(&format!(
            "{{url: \"{}\", app: storefront, reference: production, retry_base_delay_ms: 1}}",
            mock_server.uri()
        ))
        .unwrap();
        let remote = Arc::new(HttpRemoteClient::new(&remote_config).unwrap());
        let client = FeatureClient::new(&FeaturesConfig::default(), remote, default_oracles());

        Mock::given(method("GET"))
            .and(path("/apps/storefront"))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/apps/storefront"))
            .respond_with(ResponseTemplate::new(200).set_body_json(configured(true)))
            .mount(&mock_server)
            .await;

        // the service refuses the first load: ready on the declared defaults
        assert!(client.load().await.is_err());
        assert!(client.is_ready());
        assert_eq!(
            client.state().last_fetch(),
            Some(RemoteConfig {
                app: json!({"experiments": []}),
                shared: json!({}),
            })
        );

        client.load().await.unwrap();
        assert_eq!(client.state().last_fetch(), Some(configured(true)));
    }
}

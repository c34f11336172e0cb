use crate::codec;
use crate::metrics_defs::{OVERRIDES_APPLIED, OVERRIDES_DROPPED};
use crate::oracle::ExperimentOracle;
use crate::types::{CookieState, Domain, FeatureSnapshot, PerDomain, StoredExperiments};
use serde_json::Value;
use shared::counter;
use std::fmt;
use std::sync::Arc;

/// Query parameters starting with this prefix override a feature for one request.
pub const OVERRIDE_PREFIX: &str = "xpr.";

#[derive(thiserror::Error, Debug)]
#[error("invalid override for {name}: {source}")]
pub struct OverrideParseError {
    pub name: String,
    #[source]
    pub source: serde_json::Error,
}

/// Parses a single `xpr.<name>=<json>` override value.
pub fn parse_override(name: &str, raw: &str) -> Result<Value, OverrideParseError> {
    serde_json::from_str(raw).map_err(|source| OverrideParseError {
        name: name.to_string(),
        source,
    })
}

/// Feature overrides from a raw query string, in query order. Values that are not
/// JSON are dropped one key at a time.
pub fn parse_overrides(query: &str) -> Vec<(String, Value)> {
    url::form_urlencoded::parse(query.as_bytes())
        .filter_map(|(key, raw)| {
            let name = key.strip_prefix(OVERRIDE_PREFIX)?;
            match parse_override(name, &raw) {
                Ok(value) => Some((name.to_string(), value)),
                Err(err) => {
                    counter!(OVERRIDES_DROPPED).increment(1);
                    tracing::debug!(error = %err, "dropping feature override");
                    None
                }
            }
        })
        .collect()
}

/// Features resolved for one request.
#[derive(Clone)]
pub struct RequestFeatures {
    oracles: PerDomain<Arc<dyn ExperimentOracle>>,
    snapshots: PerDomain<FeatureSnapshot>,
}

impl RequestFeatures {
    /// Value of a feature, `false` when neither domain knows it.
    pub fn feature(&self, name: &str) -> Value {
        self.feature_or(name, Value::Bool(false))
    }

    /// Value of a feature looked up in `app`, then `shared`. `fallback` is returned only
    /// when neither domain has an entry for `name`.
    ///
    /// Any app entry wins, including `false` or `null`: a falsy app value does not fall
    /// through to `shared`.
    pub fn feature_or(&self, name: &str, fallback: Value) -> Value {
        self.oracles
            .app
            .feature(name, &self.snapshots.app)
            .or_else(|| self.oracles.shared.feature(name, &self.snapshots.shared))
            .unwrap_or(fallback)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.feature(name).as_bool().unwrap_or(false)
    }

    /// Both domains' resolved snapshots.
    pub fn features(&self) -> &PerDomain<FeatureSnapshot> {
        &self.snapshots
    }

    pub fn snapshot(&self, domain: Domain) -> &FeatureSnapshot {
        self.snapshots.get(domain)
    }
}

impl fmt::Debug for RequestFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestFeatures")
            .field("snapshots", &self.snapshots)
            .finish()
    }
}

#[derive(Debug)]
pub struct Resolution {
    pub features: RequestFeatures,
    /// New cookie value to persist, when the user is known.
    pub cookie: Option<String>,
}

/// Per-request hook turning stored cookie state and query overrides into features.
#[derive(Clone)]
pub struct FeatureResolver {
    oracles: PerDomain<Arc<dyn ExperimentOracle>>,
}

impl FeatureResolver {
    pub fn new(oracles: PerDomain<Arc<dyn ExperimentOracle>>) -> Self {
        FeatureResolver { oracles }
    }

    pub fn resolve(&self, cookie: CookieState, query: Option<&str>) -> Resolution {
        let overrides = query.map(parse_overrides).unwrap_or_default();

        let CookieState {
            user_id,
            experiments,
        } = cookie;
        let StoredExperiments { bucket, snapshots } =
            experiments.unwrap_or_else(|| StoredExperiments {
                bucket: None,
                snapshots: PerDomain::default(),
            });

        // The app context settles the bucket so both domains agree on it, even when
        // the oracle has to assign one.
        let app_context = self.oracles.app.context_for(bucket.as_deref(), &user_id);
        let shared_context = self
            .oracles
            .shared
            .context_for(Some(&app_context.bucket), &user_id);

        let mut resolved = PerDomain::new(
            self.oracles.app.read_for(&app_context, &snapshots.app),
            self.oracles.shared.read_for(&shared_context, &snapshots.shared),
        );

        if !overrides.is_empty() {
            counter!(OVERRIDES_APPLIED).increment(overrides.len() as u64);
        }
        for (name, value) in overrides {
            resolved.app.set_dirty(name, value);
        }

        let cookie = (!user_id.is_empty()).then(|| codec::encode_experiments(&user_id, &resolved));

        Resolution {
            features: RequestFeatures {
                oracles: self.oracles.clone(),
                snapshots: resolved,
            },
            cookie,
        }
    }
}

//! Interface to the experiment engine that assigns variants, plus a simple in-process
//! implementation.

use crate::types::{FeatureSnapshot, PerDomain, Stamp};
use parking_lot::RwLock;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Number of buckets users are partitioned into by [`DefaultOracle`].
pub const BUCKETS: u32 = 100;

/// Who is asking, as seen by the oracle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: String,
    pub bucket: String,
}

pub trait ExperimentOracle: Send + Sync {
    /// Replaces the active configuration and returns its stamp.
    fn configure(&self, config: &Value, reference: &str) -> Stamp;

    /// Builds the context for a user, assigning a bucket when none is stored.
    fn context_for(&self, bucket: Option<&str>, user_id: &str) -> UserContext;

    /// Effective features of a user given what was stored for them.
    fn read_for(&self, context: &UserContext, stored: &FeatureSnapshot) -> FeatureSnapshot;

    /// Resolved value of one feature; `None` when the snapshot has no entry for it.
    fn feature(&self, name: &str, snapshot: &FeatureSnapshot) -> Option<Value> {
        snapshot.features.get(name).cloned()
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Variant {
    pub value: Value,
    /// Number of buckets receiving this value.
    pub weight: u32,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Experiment {
    pub name: String,
    #[serde(default = "default_value")]
    pub default: Value,
    #[serde(default)]
    pub variants: Vec<Variant>,
}

fn default_value() -> Value {
    Value::Bool(false)
}

impl Experiment {
    /// Variants own consecutive bucket ranges in declaration order. Buckets past the
    /// last range, and non-numeric buckets, get the default.
    pub fn value_for(&self, bucket: Option<u32>) -> &Value {
        let Some(bucket) = bucket else {
            return &self.default;
        };

        let mut upper: u32 = 0;
        for variant in &self.variants {
            upper = upper.saturating_add(variant.weight);
            if bucket < upper {
                return &variant.value;
            }
        }
        &self.default
    }
}

#[derive(Debug, Default, Deserialize)]
struct ExperimentSet {
    #[serde(default)]
    experiments: Vec<Experiment>,
}

#[derive(Debug, Default)]
struct OracleState {
    stamp: Option<Stamp>,
    experiments: Vec<Experiment>,
}

/// Oracle driven by a `{"experiments": [...]}` document.
///
/// Named users are bucketed by a hash of their id. Anonymous users get a random
/// bucket, which then sticks through the cookie.
#[derive(Debug, Default)]
pub struct DefaultOracle {
    state: RwLock<OracleState>,
}

impl DefaultOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp(&self) -> Option<Stamp> {
        self.state.read().stamp.clone()
    }
}

impl ExperimentOracle for DefaultOracle {
    fn configure(&self, config: &Value, reference: &str) -> Stamp {
        let experiments = match ExperimentSet::deserialize(config) {
            Ok(set) => set.experiments,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring malformed experiment configuration");
                Vec::new()
            }
        };

        let stamp = stamp_for(config, reference);
        tracing::debug!(stamp = %stamp, experiments = experiments.len(), "configured oracle");

        let mut state = self.state.write();
        state.stamp = Some(stamp.clone());
        state.experiments = experiments;
        stamp
    }

    fn context_for(&self, bucket: Option<&str>, user_id: &str) -> UserContext {
        let bucket = match bucket.filter(|b| !b.is_empty()) {
            Some(bucket) => bucket.to_string(),
            None if user_id == crate::types::ANONYMOUS_USER => {
                rand::thread_rng().gen_range(0..BUCKETS).to_string()
            }
            None => bucket_for(user_id).to_string(),
        };

        UserContext {
            user_id: user_id.to_string(),
            bucket,
        }
    }

    fn read_for(&self, context: &UserContext, stored: &FeatureSnapshot) -> FeatureSnapshot {
        let state = self.state.read();
        let position = context.bucket.parse::<u32>().ok();

        let mut snapshot = FeatureSnapshot {
            user_id: context.user_id.clone(),
            bucket: Some(context.bucket.clone()),
            stamp: state.stamp.clone(),
            ..Default::default()
        };

        for experiment in &state.experiments {
            snapshot.features.insert(
                experiment.name.clone(),
                experiment.value_for(position).clone(),
            );
        }

        // Values the user chose survive configuration changes.
        for name in &stored.dirty_features {
            if let Some(value) = stored.features.get(name) {
                snapshot.set_dirty(name.clone(), value.clone());
            }
        }

        snapshot
    }
}

/// A fresh [`DefaultOracle`] for each domain.
pub fn default_oracles() -> PerDomain<Arc<dyn ExperimentOracle>> {
    let app: Arc<dyn ExperimentOracle> = Arc::new(DefaultOracle::new());
    let shared: Arc<dyn ExperimentOracle> = Arc::new(DefaultOracle::new());
    PerDomain::new(app, shared)
}

fn stamp_for(config: &Value, reference: &str) -> Stamp {
    let mut hasher = Sha256::new();
    hasher.update(reference.as_bytes());
    hasher.update(b"\n");
    hasher.update(config.to_string().as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

fn bucket_for(user_id: &str) -> u32 {
    let digest = Sha256::digest(user_id.as_bytes());
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&digest[..4]);
    u32::from_be_bytes(prefix) % BUCKETS
}

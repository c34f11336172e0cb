use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Identity used when the request carries no user.
pub const ANONYMOUS_USER: &str = "__anon__";

pub type Stamp = String;

/// Feature values keyed by name, in insertion order.
pub type Features = Map<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Domain {
    App,
    Shared,
}

impl Domain {
    /// Serialization order.
    pub const ALL: [Domain; 2] = [Domain::App, Domain::Shared];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Domain::App => "app",
            Domain::Shared => "shared",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value for each experiment domain.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PerDomain<T> {
    pub app: T,
    pub shared: T,
}

impl<T> PerDomain<T> {
    pub fn new(app: T, shared: T) -> Self {
        PerDomain { app, shared }
    }

    pub fn get(&self, domain: Domain) -> &T {
        match domain {
            Domain::App => &self.app,
            Domain::Shared => &self.shared,
        }
    }

    pub fn get_mut(&mut self, domain: Domain) -> &mut T {
        match domain {
            Domain::App => &mut self.app,
            Domain::Shared => &mut self.shared,
        }
    }

    pub fn map<U, F>(self, mut f: F) -> PerDomain<U>
    where
        F: FnMut(Domain, T) -> U,
    {
        PerDomain {
            app: f(Domain::App, self.app),
            shared: f(Domain::Shared, self.shared),
        }
    }
}

/// Experiment state of one user in one domain.
///
/// Every name in `dirty_features` is a key of `features`. Use [`FeatureSnapshot::set_dirty`]
/// to keep it that way.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FeatureSnapshot {
    pub user_id: String,
    pub bucket: Option<String>,
    pub stamp: Option<Stamp>,
    pub features: Features,
    pub dirty_features: IndexSet<String>,
}

impl FeatureSnapshot {
    /// Sets a feature value and records it as explicitly chosen for this user.
    pub fn set_dirty(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.features.insert(name.clone(), value);
        self.dirty_features.insert(name);
    }

    /// The dirty features with their current values, in dirty order.
    pub fn dirty_values(&self) -> Features {
        self.dirty_features
            .iter()
            .filter_map(|name| {
                self.features
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect()
    }
}

/// The last configuration fetched from (or defaulted for) the remote service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub app: Value,
    #[serde(default)]
    pub shared: Value,
}

impl RemoteConfig {
    /// The shared experiment list, only when it has at least one entry.
    pub fn shared_experiments(&self) -> Option<&Vec<Value>> {
        self.shared
            .get("experiments")
            .and_then(Value::as_array)
            .filter(|experiments| !experiments.is_empty())
    }
}

/// Experiments restored from a cookie.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredExperiments {
    pub bucket: Option<String>,
    pub snapshots: PerDomain<FeatureSnapshot>,
}

/// Decoded cookie. `experiments` is `None` for a user without usable stored state.
#[derive(Clone, Debug, PartialEq)]
pub struct CookieState {
    pub user_id: String,
    pub experiments: Option<StoredExperiments>,
}

impl CookieState {
    pub fn new_user(user_id: impl Into<String>) -> Self {
        CookieState {
            user_id: user_id.into(),
            experiments: None,
        }
    }
}

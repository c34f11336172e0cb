//! Metrics definitions for experiment resolution and configuration fetching.

use shared::metrics_defs::{MetricDef, MetricType};

pub const COOKIE_DECODE: MetricDef = MetricDef {
    name: "cookie.decode",
    metric_type: MetricType::Counter,
    description: "Experiment cookie decode attempts. Tagged with outcome: ok, missing, invalid, new_user.",
};

pub const OVERRIDES_APPLIED: MetricDef = MetricDef {
    name: "overrides.applied",
    metric_type: MetricType::Counter,
    description: "Query string feature overrides applied to the app domain",
};

pub const OVERRIDES_DROPPED: MetricDef = MetricDef {
    name: "overrides.dropped",
    metric_type: MetricType::Counter,
    description: "Query string feature overrides dropped because the value is not JSON",
};

pub const FETCH_APPLY: MetricDef = MetricDef {
    name: "fetch.apply",
    metric_type: MetricType::Counter,
    description: "Configuration applies. Tagged with path: success, defaults, skipped.",
};

pub const REMOTE_REQUEST_DURATION: MetricDef = MetricDef {
    name: "remote.request.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a load or announce call in seconds. Tagged with op, status.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    COOKIE_DECODE,
    OVERRIDES_APPLIED,
    OVERRIDES_DROPPED,
    FETCH_APPLY,
    REMOTE_REQUEST_DURATION,
];

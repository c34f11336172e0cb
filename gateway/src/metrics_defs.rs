use shared::metrics_defs::{MetricDef, MetricType};

pub const RESOLVE_DURATION: MetricDef = MetricDef {
    name: "features.resolve.duration",
    metric_type: MetricType::Histogram,
    description: "Time spent decoding the cookie and resolving features for a request, in seconds",
};

pub const COOKIE_WRITES: MetricDef = MetricDef {
    name: "cookie.writes",
    metric_type: MetricType::Counter,
    description: "Set-Cookie headers emitted. Tagged with action: set, clear.",
};

pub const REFRESHES: MetricDef = MetricDef {
    name: "refresh.runs",
    metric_type: MetricType::Counter,
    description: "Configuration refreshes run by the worker. Tagged with trigger, outcome.",
};

pub const ALL_METRICS: &[MetricDef] = &[RESOLVE_DURATION, COOKIE_WRITES, REFRESHES];

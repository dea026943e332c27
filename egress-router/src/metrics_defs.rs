use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUESTS: MetricDef = MetricDef {
    name: "relay.requests",
    metric_type: MetricType::Counter,
    description: "Queries handled by the relay. Tagged with operation, outcome.",
};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "relay.request.duration",
    metric_type: MetricType::Histogram,
    description: "Query duration in seconds. Tagged with operation, outcome.",
};

pub const PENDING_REQUESTS: MetricDef = MetricDef {
    name: "relay.pending_requests",
    metric_type: MetricType::Gauge,
    description: "Forwarded requests currently awaiting a reply",
};

pub const LATE_REPLIES: MetricDef = MetricDef {
    name: "relay.late_replies",
    metric_type: MetricType::Counter,
    description: "Replies dropped because their request had already completed or timed out",
};

pub const REGISTRATIONS: MetricDef = MetricDef {
    name: "registry.registrations",
    metric_type: MetricType::Counter,
    description: "Instance registration attempts. Tagged with outcome.",
};

pub const CONNECTED_INSTANCES: MetricDef = MetricDef {
    name: "registry.connected_instances",
    metric_type: MetricType::Gauge,
    description: "Identities with a live instance connection",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUESTS,
    REQUEST_DURATION,
    PENDING_REQUESTS,
    LATE_REPLIES,
    REGISTRATIONS,
    CONNECTED_INSTANCES,
];

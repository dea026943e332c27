//! Metrics definitions for the repository store.

use shared::metrics_defs::{MetricDef, MetricType};

pub const STORE_APPENDS: MetricDef = MetricDef {
    name: "store.appends",
    metric_type: MetricType::Counter,
    description: "Number of repository records written to the store",
};

pub const STORE_CONFLICTS: MetricDef = MetricDef {
    name: "store.conflicts",
    metric_type: MetricType::Counter,
    description: "Appends skipped because the name was already bound to another id",
};

pub const ALL_METRICS: &[MetricDef] = &[STORE_APPENDS, STORE_CONFLICTS];

use shared::metrics_defs::{MetricDef, MetricType};

pub const INCOMING_ITEMS: MetricDef = MetricDef {
    name: "incoming.items",
    metric_type: MetricType::Counter,
    description: "Items accepted into the sink queue. Tagged with protocol, reason.",
};

pub const REQUESTS_TOTAL: MetricDef = MetricDef {
    name: "requests.total",
    metric_type: MetricType::Counter,
    description: "Data requests completed, success or failure",
};

pub const REQUESTS_ACTIVE: MetricDef = MetricDef {
    name: "requests.active",
    metric_type: MetricType::Gauge,
    description: "Data requests currently being processed",
};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "End-to-end data request duration in seconds. Tagged with path.",
};

pub const DECODE_ERRORS: MetricDef = MetricDef {
    name: "decode.errors",
    metric_type: MetricType::Counter,
    description: "Request bodies rejected by a decoder",
};

pub const HTTP_NOT_FOUND: MetricDef = MetricDef {
    name: "http.not_found",
    metric_type: MetricType::Counter,
    description: "Requests for unknown paths. Tagged with http_code.",
};

pub const HEALTH_CHECKS: MetricDef = MetricDef {
    name: "health.checks",
    metric_type: MetricType::Counter,
    description: "Successful health checks",
};

pub const BACKPRESSURE_ERRORS: MetricDef = MetricDef {
    name: "sink.backpressure",
    metric_type: MetricType::Counter,
    description: "Submissions rejected because the queue stayed full",
};

pub const SINK_DROPPED_ITEMS: MetricDef = MetricDef {
    name: "sink.dropped_items",
    metric_type: MetricType::Counter,
    description: "Items dropped after an upstream POST failed",
};

pub const ALL_METRICS: &[MetricDef] = &[
    INCOMING_ITEMS,
    REQUESTS_TOTAL,
    REQUESTS_ACTIVE,
    REQUEST_DURATION,
    DECODE_ERRORS,
    HTTP_NOT_FOUND,
    HEALTH_CHECKS,
    BACKPRESSURE_ERRORS,
    SINK_DROPPED_ITEMS,
];

/// Register every metric description with the global recorder.
pub fn register_all() {
    for metric in ALL_METRICS {
        metric.describe();
    }
}

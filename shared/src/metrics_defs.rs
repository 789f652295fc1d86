//! Common types for documenting and registering the metrics a crate emits.

use metrics::{describe_counter, describe_gauge, describe_histogram};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "Counter",
            MetricType::Gauge => "Gauge",
            MetricType::Histogram => "Histogram",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

impl MetricDef {
    /// Register this metric's description with the global recorder.
    pub fn describe(&self) {
        match self.metric_type {
            MetricType::Counter => describe_counter!(self.name, self.description),
            MetricType::Gauge => describe_gauge!(self.name, self.description),
            MetricType::Histogram => describe_histogram!(self.name, self.description),
        }
    }
}

/// Render metric definitions as a markdown table.
pub fn markdown_table(metrics: &[MetricDef]) -> String {
    let mut lines = vec![
        "| Metric | Type | Description |".to_string(),
        "|--------|------|-------------|".to_string(),
    ];
    for m in metrics {
        lines.push(format!(
            "| `{}` | {} | {} |",
            m.name,
            m.metric_type.as_str(),
            m.description
        ));
    }
    lines.join("\n")
}

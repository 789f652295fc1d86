//! v1 JSON datapoints: a JSON array of `{"source", "metric", "value"}`.
//!
//! The v1 format predates metric types and dimensions; every point gets
//! the configured default type and the source string survives as the
//! `sf_source` dimension.

use super::Decoder;
use crate::data::{Datapoint, Item, MetricType, Value};
use crate::errors::DecodeError;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Deserialize)]
struct DatapointV1Wire {
    #[serde(default)]
    source: Option<String>,
    metric: String,
    value: Value,
}

pub struct JsonDecoderV1 {
    default_type: MetricType,
}

impl JsonDecoderV1 {
    pub fn new(default_type: MetricType) -> Self {
        Self { default_type }
    }
}

impl Decoder for JsonDecoderV1 {
    fn protocol(&self) -> &'static str {
        "sfx_json_v1"
    }

    fn decode(&self, body: &[u8]) -> Result<Vec<Item>, DecodeError> {
        let points: Vec<DatapointV1Wire> = serde_json::from_slice(body)?;

        points
            .into_iter()
            .map(|point| {
                if point.metric.is_empty() {
                    return Err(DecodeError::MissingField("metric"));
                }
                let mut dimensions = HashMap::new();
                if let Some(source) = point.source.filter(|source| !source.is_empty()) {
                    dimensions.insert("sf_source".to_string(), source);
                }
                Ok(Item::Datapoint(Datapoint {
                    metric: point.metric,
                    dimensions,
                    value: point.value,
                    metric_type: self.default_type,
                    timestamp: 0,
                }))
            })
            .collect()
    }
}

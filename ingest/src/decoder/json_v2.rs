//! v2 JSON datapoints and events, plus the serializers the sink uses to
//! render upstream request bodies in the same format.
//!
//! Datapoints arrive as a map keyed by metric type
//! (`{"gauge": [...], "counter": [...], "cumulative_counter": [...]}`),
//! events as a flat array. Re-encoding a decoded body yields a
//! semantically identical one.

use super::Decoder;
use crate::data::{
    Datapoint, Event, EventCategory, Item, MetricType, PropertyValue, Value,
};
use crate::errors::DecodeError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

fn is_zero(timestamp: &i64) -> bool {
    *timestamp == 0
}

#[derive(Serialize, Deserialize)]
struct DatapointV2Wire {
    metric: String,
    value: Value,
    #[serde(default, skip_serializing_if = "is_zero")]
    timestamp: i64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    dimensions: HashMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct EventV2Wire {
    #[serde(rename = "eventType")]
    event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    category: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    dimensions: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    properties: HashMap<String, PropertyValue>,
    #[serde(default, skip_serializing_if = "is_zero")]
    timestamp: i64,
}

pub struct JsonDecoderV2;

impl Decoder for JsonDecoderV2 {
    fn protocol(&self) -> &'static str {
        "sfx_json_v2"
    }

    fn decode(&self, body: &[u8]) -> Result<Vec<Item>, DecodeError> {
        // BTreeMap keeps decode order deterministic across type keys;
        // order within each list is the submission order that matters.
        let by_type: BTreeMap<String, Vec<DatapointV2Wire>> = serde_json::from_slice(body)?;

        let mut items = Vec::new();
        for (key, points) in by_type {
            let metric_type = MetricType::from_wire_name(&key)
                .ok_or_else(|| DecodeError::Invalid(format!("unknown metric type '{key}'")))?;
            for point in points {
                if point.metric.is_empty() {
                    return Err(DecodeError::MissingField("metric"));
                }
                items.push(Item::Datapoint(Datapoint {
                    metric: point.metric,
                    dimensions: point.dimensions,
                    value: point.value,
                    metric_type,
                    timestamp: point.timestamp,
                }));
            }
        }
        Ok(items)
    }
}

pub struct JsonEventDecoderV2;

impl Decoder for JsonEventDecoderV2 {
    fn protocol(&self) -> &'static str {
        "sfx_json_v2"
    }

    fn decode(&self, body: &[u8]) -> Result<Vec<Item>, DecodeError> {
        let events: Vec<EventV2Wire> = serde_json::from_slice(body)?;

        events
            .into_iter()
            .map(|event| {
                if event.event_type.is_empty() {
                    return Err(DecodeError::MissingField("eventType"));
                }
                let category = match event.category {
                    None => EventCategory::UserDefined,
                    Some(name) => EventCategory::from_wire_name(&name).ok_or_else(|| {
                        DecodeError::Invalid(format!("unknown event category '{name}'"))
                    })?,
                };
                Ok(Item::Event(Event {
                    event_type: event.event_type,
                    category,
                    dimensions: event.dimensions,
                    properties: event.properties,
                    timestamp: event.timestamp,
                }))
            })
            .collect()
    }
}

/// Render datapoints as a v2 JSON body (one type-keyed map).
pub fn render_datapoint_body(points: &[Datapoint]) -> Result<Vec<u8>, serde_json::Error> {
    let mut by_type: BTreeMap<&'static str, Vec<DatapointV2Wire>> = BTreeMap::new();
    for point in points {
        by_type
            .entry(point.metric_type.wire_name())
            .or_default()
            .push(DatapointV2Wire {
                metric: point.metric.clone(),
                value: point.value.clone(),
                timestamp: point.timestamp,
                dimensions: point.dimensions.clone(),
            });
    }
    serde_json::to_vec(&by_type)
}

/// Render events as a v2 JSON body (one flat array).
pub fn render_event_body(events: &[Event]) -> Result<Vec<u8>, serde_json::Error> {
    let wire: Vec<EventV2Wire> = events
        .iter()
        .map(|event| EventV2Wire {
            event_type: event.event_type.clone(),
            category: Some(event.category.wire_name().to_string()),
            dimensions: event.dimensions.clone(),
            properties: event.properties.clone(),
            timestamp: event.timestamp,
        })
        .collect();
    serde_json::to_vec(&wire)
}

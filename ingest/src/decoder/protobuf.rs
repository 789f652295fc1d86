//! v1/v2 protobuf decoders over length-delimited message streams.

use super::Decoder;
use crate::data::{Datapoint, Event, EventCategory, Item, MetricType, PropertyValue, Value};
use crate::errors::DecodeError;
use crate::proto;
use std::collections::HashMap;

pub struct ProtobufDecoderV1 {
    default_type: MetricType,
}

impl ProtobufDecoderV1 {
    pub fn new(default_type: MetricType) -> Self {
        Self { default_type }
    }
}

impl Decoder for ProtobufDecoderV1 {
    fn protocol(&self) -> &'static str {
        "sfx_protobuf_v1"
    }

    fn decode(&self, body: &[u8]) -> Result<Vec<Item>, DecodeError> {
        let messages: Vec<proto::DataPoint> = proto::decode_stream(body)?;
        messages
            .into_iter()
            .map(|message| datapoint_from_proto(message, Some(self.default_type)))
            .collect()
    }
}

pub struct ProtobufDecoderV2;

impl Decoder for ProtobufDecoderV2 {
    fn protocol(&self) -> &'static str {
        "sfx_protobuf_v2"
    }

    fn decode(&self, body: &[u8]) -> Result<Vec<Item>, DecodeError> {
        let messages: Vec<proto::DataPoint> = proto::decode_stream(body)?;
        messages
            .into_iter()
            .map(|message| datapoint_from_proto(message, None))
            .collect()
    }
}

pub struct ProtobufEventDecoderV2;

impl Decoder for ProtobufEventDecoderV2 {
    fn protocol(&self) -> &'static str {
        "sfx_protobuf_v2"
    }

    fn decode(&self, body: &[u8]) -> Result<Vec<Item>, DecodeError> {
        let messages: Vec<proto::EventMessage> = proto::decode_stream(body)?;
        messages.into_iter().map(event_from_proto).collect()
    }
}

/// `default_type` applies when the message omits its metric type (v1);
/// `None` falls back to the protobuf default of gauge (v2).
fn datapoint_from_proto(
    message: proto::DataPoint,
    default_type: Option<MetricType>,
) -> Result<Item, DecodeError> {
    let metric = message
        .metric
        .filter(|metric| !metric.is_empty())
        .ok_or(DecodeError::MissingField("metric"))?;

    let value = datum_to_value(message.value.ok_or(DecodeError::MissingField("value"))?)?;

    let metric_type = match message.metric_type {
        None => default_type.unwrap_or(MetricType::Gauge),
        Some(raw) => match proto::MetricType::try_from(raw) {
            Ok(proto::MetricType::Gauge) => MetricType::Gauge,
            Ok(proto::MetricType::Counter) => MetricType::Counter,
            Ok(proto::MetricType::CumulativeCounter) => MetricType::CumulativeCounter,
            Err(_) => {
                return Err(DecodeError::Invalid(format!(
                    "unsupported metric type {raw}"
                )))
            }
        },
    };

    let mut dimensions = dimensions_from_proto(message.dimensions)?;
    if let Some(source) = message.source.filter(|source| !source.is_empty()) {
        dimensions.insert("sf_source".to_string(), source);
    }

    Ok(Item::Datapoint(Datapoint {
        metric,
        dimensions,
        value,
        metric_type,
        timestamp: message.timestamp.unwrap_or(0),
    }))
}

fn event_from_proto(message: proto::EventMessage) -> Result<Item, DecodeError> {
    let event_type = message
        .event_type
        .filter(|event_type| !event_type.is_empty())
        .ok_or(DecodeError::MissingField("eventType"))?;

    let category = match message.category {
        None => EventCategory::UserDefined,
        Some(raw) => match proto::EventCategory::try_from(raw) {
            Ok(proto::EventCategory::UserDefined) => EventCategory::UserDefined,
            Ok(proto::EventCategory::Alert) => EventCategory::Alert,
            Ok(proto::EventCategory::Audit) => EventCategory::Audit,
            Ok(proto::EventCategory::Job) => EventCategory::Job,
            Ok(proto::EventCategory::Collectd) => EventCategory::Collectd,
            Ok(proto::EventCategory::Exception) => EventCategory::Exception,
            Err(_) => {
                return Err(DecodeError::Invalid(format!(
                    "unknown event category {raw}"
                )))
            }
        },
    };

    let mut properties = HashMap::new();
    for property in message.properties {
        let key = property
            .key
            .filter(|key| !key.is_empty())
            .ok_or(DecodeError::MissingField("property key"))?;
        let value = property
            .value
            .ok_or(DecodeError::MissingField("property value"))?;
        properties.insert(key, property_to_value(value)?);
    }

    Ok(Item::Event(Event {
        event_type,
        category,
        dimensions: dimensions_from_proto(message.dimensions)?,
        properties,
        timestamp: message.timestamp.unwrap_or(0),
    }))
}

fn dimensions_from_proto(
    dimensions: Vec<proto::Dimension>,
) -> Result<HashMap<String, String>, DecodeError> {
    dimensions
        .into_iter()
        .map(|dimension| {
            let key = dimension
                .key
                .filter(|key| !key.is_empty())
                .ok_or(DecodeError::MissingField("dimension key"))?;
            let value = dimension
                .value
                .ok_or(DecodeError::MissingField("dimension value"))?;
            Ok((key, value))
        })
        .collect()
}

fn datum_to_value(datum: proto::Datum) -> Result<Value, DecodeError> {
    if let Some(int_value) = datum.int_value {
        Ok(Value::Integer(int_value))
    } else if let Some(double_value) = datum.double_value {
        Ok(Value::Double(double_value))
    } else if let Some(str_value) = datum.str_value {
        Ok(Value::Str(str_value))
    } else {
        Err(DecodeError::MissingField("value"))
    }
}

fn property_to_value(value: proto::PropertyValue) -> Result<PropertyValue, DecodeError> {
    if let Some(bool_value) = value.bool_value {
        Ok(PropertyValue::Bool(bool_value))
    } else if let Some(int_value) = value.int_value {
        Ok(PropertyValue::Int(int_value))
    } else if let Some(double_value) = value.double_value {
        Ok(PropertyValue::Double(double_value))
    } else if let Some(str_value) = value.str_value {
        Ok(PropertyValue::Str(str_value))
    } else {
        Err(DecodeError::MissingField("property value"))
    }
}

//! Protobuf wire messages for the v1/v2 binary ingest formats.
//!
//! A protobuf request body is a stream of length-delimited messages: each
//! message is preceded by its varint-encoded length. There is no envelope
//! message around the stream.

use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct Datum {
    #[prost(string, optional, tag = "1")]
    pub str_value: Option<String>,
    #[prost(double, optional, tag = "2")]
    pub double_value: Option<f64>,
    #[prost(int64, optional, tag = "3")]
    pub int_value: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Dimension {
    #[prost(string, optional, tag = "1")]
    pub key: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub value: Option<String>,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum MetricType {
    Gauge = 0,
    Counter = 1,
    CumulativeCounter = 3,
}

#[derive(Clone, PartialEq, Message)]
pub struct DataPoint {
    #[prost(string, optional, tag = "1")]
    pub source: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub metric: Option<String>,
    #[prost(int64, optional, tag = "3")]
    pub timestamp: Option<i64>,
    #[prost(message, optional, tag = "4")]
    pub value: Option<Datum>,
    #[prost(enumeration = "MetricType", optional, tag = "5")]
    pub metric_type: Option<i32>,
    #[prost(message, repeated, tag = "6")]
    pub dimensions: Vec<Dimension>,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum EventCategory {
    UserDefined = 1_000_000,
    Alert = 100_000,
    Audit = 200_000,
    Job = 300_000,
    Collectd = 400_000,
    Exception = 700_000,
}

#[derive(Clone, PartialEq, Message)]
pub struct PropertyValue {
    #[prost(string, optional, tag = "1")]
    pub str_value: Option<String>,
    #[prost(double, optional, tag = "2")]
    pub double_value: Option<f64>,
    #[prost(int64, optional, tag = "3")]
    pub int_value: Option<i64>,
    #[prost(bool, optional, tag = "4")]
    pub bool_value: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Property {
    #[prost(string, optional, tag = "1")]
    pub key: Option<String>,
    #[prost(message, optional, tag = "2")]
    pub value: Option<PropertyValue>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EventMessage {
    #[prost(string, optional, tag = "1")]
    pub event_type: Option<String>,
    #[prost(enumeration = "EventCategory", optional, tag = "2")]
    pub category: Option<i32>,
    #[prost(message, repeated, tag = "3")]
    pub dimensions: Vec<Dimension>,
    #[prost(message, repeated, tag = "4")]
    pub properties: Vec<Property>,
    #[prost(int64, optional, tag = "5")]
    pub timestamp: Option<i64>,
}

/// Decode a body of back-to-back length-delimited messages.
pub fn decode_stream<M: Message + Default>(mut buf: &[u8]) -> Result<Vec<M>, prost::DecodeError> {
    let mut messages = Vec::new();
    while !buf.is_empty() {
        messages.push(M::decode_length_delimited(&mut buf)?);
    }
    Ok(messages)
}

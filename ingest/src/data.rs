//! Telemetry Data Model
//!
//! The types carried between decoders, the bounded queue, and the sink
//! workers. Decoders of every wire format normalize into these; the sink
//! renders them back out in the upstream's v2 JSON format.
//!
//! Values and property values derive serde directly because the v2 JSON
//! wire scalars are exactly these shapes; the untagged variant order
//! decides how bare JSON numbers parse (integers before doubles).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    Gauge,
    Counter,
    CumulativeCounter,
}

impl MetricType {
    /// The key used for this type in the v2 JSON type-keyed map.
    pub const fn wire_name(&self) -> &'static str {
        match self {
            MetricType::Gauge => "gauge",
            MetricType::Counter => "counter",
            MetricType::CumulativeCounter => "cumulative_counter",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "gauge" => Some(MetricType::Gauge),
            "counter" => Some(MetricType::Counter),
            "cumulative_counter" => Some(MetricType::CumulativeCounter),
            _ => None,
        }
    }
}

/// A datapoint value; integers win over doubles when a bare JSON number
/// fits both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Double(f64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Datapoint {
    pub metric: String,
    pub dimensions: HashMap<String, String>,
    pub value: Value,
    pub metric_type: MetricType,
    /// Milliseconds since epoch; 0 means "assign on ingest".
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    UserDefined,
    Alert,
    Audit,
    Job,
    Collectd,
    Exception,
}

impl EventCategory {
    pub const fn wire_name(&self) -> &'static str {
        match self {
            EventCategory::UserDefined => "USER_DEFINED",
            EventCategory::Alert => "ALERT",
            EventCategory::Audit => "AUDIT",
            EventCategory::Job => "JOB",
            EventCategory::Collectd => "COLLECTD",
            EventCategory::Exception => "EXCEPTION",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "USER_DEFINED" => Some(EventCategory::UserDefined),
            "ALERT" => Some(EventCategory::Alert),
            "AUDIT" => Some(EventCategory::Audit),
            "JOB" => Some(EventCategory::Job),
            "COLLECTD" => Some(EventCategory::Collectd),
            "EXCEPTION" => Some(EventCategory::Exception),
            _ => None,
        }
    }
}

/// An event property value. Booleans parse before integers so JSON `true`
/// never becomes a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: String,
    pub category: EventCategory,
    pub dimensions: HashMap<String, String>,
    pub properties: HashMap<String, PropertyValue>,
    /// Milliseconds since epoch; 0 means "assign on ingest".
    pub timestamp: i64,
}

/// Which half of the pipeline an item belongs to; batches never mix kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Datapoint,
    Event,
}

impl ItemKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Datapoint => "datapoint",
            ItemKind::Event => "event",
        }
    }
}

/// The tagged union flowing through the shared bounded queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Datapoint(Datapoint),
    Event(Event),
}

impl Item {
    pub fn kind(&self) -> ItemKind {
        match self {
            Item::Datapoint(_) => ItemKind::Datapoint,
            Item::Event(_) => ItemKind::Event,
        }
    }
}

//! collectd write-http JSON.
//!
//! A collectd record carries parallel `values`/`dstypes`/`dsnames`
//! arrays; each index becomes its own datapoint. The metric name is
//! assembled from plugin/type/type_instance (plus the dsname when it is
//! not the conventional lone "value"), with the identifying pieces kept
//! as dimensions.

use super::Decoder;
use crate::data::{Datapoint, Item, MetricType, Value};
use crate::errors::DecodeError;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Deserialize)]
struct CollectdRecord {
    values: Vec<f64>,
    dstypes: Vec<String>,
    dsnames: Vec<String>,
    #[serde(default)]
    time: f64,
    #[serde(default)]
    host: String,
    #[serde(default)]
    plugin: String,
    #[serde(default)]
    plugin_instance: String,
    #[serde(default, rename = "type")]
    type_name: String,
    #[serde(default)]
    type_instance: String,
}

pub struct CollectdJsonDecoder;

impl Decoder for CollectdJsonDecoder {
    fn protocol(&self) -> &'static str {
        "sfx_collectd_v1"
    }

    fn decode(&self, body: &[u8]) -> Result<Vec<Item>, DecodeError> {
        let records: Vec<CollectdRecord> = serde_json::from_slice(body)?;

        let mut items = Vec::new();
        for record in records {
            if record.values.len() != record.dstypes.len()
                || record.values.len() != record.dsnames.len()
            {
                return Err(DecodeError::Invalid(
                    "values, dstypes and dsnames must have the same length".to_string(),
                ));
            }

            let timestamp = (record.time * 1_000.0).round() as i64;
            for (index, value) in record.values.iter().enumerate() {
                let dsname = &record.dsnames[index];
                let metric = metric_name(&record, dsname);
                if metric.is_empty() {
                    return Err(DecodeError::Invalid(
                        "record carries no usable metric name".to_string(),
                    ));
                }
                items.push(Item::Datapoint(Datapoint {
                    metric,
                    dimensions: dimensions(&record, dsname),
                    value: Value::Double(*value),
                    metric_type: metric_type(&record.dstypes[index])?,
                    timestamp,
                }));
            }
        }
        Ok(items)
    }
}

fn metric_name(record: &CollectdRecord, dsname: &str) -> String {
    let mut parts: Vec<&str> = [
        record.plugin.as_str(),
        record.type_name.as_str(),
        record.type_instance.as_str(),
    ]
    .into_iter()
    .filter(|part| !part.is_empty())
    .collect();
    if dsname != "value" && !dsname.is_empty() {
        parts.push(dsname);
    }
    parts.join(".")
}

fn dimensions(record: &CollectdRecord, dsname: &str) -> HashMap<String, String> {
    let mut dimensions = HashMap::new();
    for (key, value) in [
        ("host", &record.host),
        ("plugin", &record.plugin),
        ("plugin_instance", &record.plugin_instance),
    ] {
        if !value.is_empty() {
            dimensions.insert(key.to_string(), value.clone());
        }
    }
    if !dsname.is_empty() {
        dimensions.insert("dsname".to_string(), dsname.to_string());
    }
    dimensions
}

fn metric_type(dstype: &str) -> Result<MetricType, DecodeError> {
    match dstype {
        "counter" | "derive" => Ok(MetricType::CumulativeCounter),
        "gauge" | "absolute" => Ok(MetricType::Gauge),
        other => Err(DecodeError::Invalid(format!("unknown dstype '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WRITE_HTTP_BODY: &str = r#"[{
        "values": [197, 5.5],
        "dstypes": ["derive", "gauge"],
        "dsnames": ["read", "pending"],
        "time": 1434477504.484,
        "interval": 10.0,
        "host": "i-b13d1e5f",
        "plugin": "disk",
        "plugin_instance": "sda",
        "type": "disk_ops",
        "type_instance": ""
    }]"#;

    #[test]
    fn test_decode_expands_per_value() {
        let items = CollectdJsonDecoder.decode(WRITE_HTTP_BODY.as_bytes()).unwrap();
        assert_eq!(items.len(), 2);

        match &items[0] {
            Item::Datapoint(dp) => {
                assert_eq!(dp.metric, "disk.disk_ops.read");
                assert_eq!(dp.value, Value::Double(197.0));
                assert_eq!(dp.metric_type, MetricType::CumulativeCounter);
                assert_eq!(dp.timestamp, 1434477504484);
                assert_eq!(dp.dimensions.get("host").unwrap(), "i-b13d1e5f");
                assert_eq!(dp.dimensions.get("plugin").unwrap(), "disk");
                assert_eq!(dp.dimensions.get("plugin_instance").unwrap(), "sda");
                assert_eq!(dp.dimensions.get("dsname").unwrap(), "read");
            }
            other => panic!("expected datapoint, got {other:?}"),
        }
        match &items[1] {
            Item::Datapoint(dp) => {
                assert_eq!(dp.metric, "disk.disk_ops.pending");
                assert_eq!(dp.metric_type, MetricType::Gauge);
            }
            other => panic!("expected datapoint, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_single_value_record() {
        let items = CollectdJsonDecoder
            .decode(
                br#"[{"values": [42.5], "dstypes": ["gauge"], "dsnames": ["value"],
                      "time": 10.0, "host": "h", "plugin": "memory",
                      "type": "memory", "type_instance": "used"}]"#,
            )
            .unwrap();

        assert_eq!(items.len(), 1);
        match &items[0] {
            Item::Datapoint(dp) => {
                // the lone "value" dsname stays out of the metric name
                assert_eq!(dp.metric, "memory.memory.used");
                assert_eq!(dp.timestamp, 10_000);
            }
            other => panic!("expected datapoint, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_length_mismatch() {
        assert!(CollectdJsonDecoder
            .decode(
                br#"[{"values": [1, 2], "dstypes": ["gauge"], "dsnames": ["value"],
                      "time": 1, "plugin": "p", "type": "t"}]"#,
            )
            .is_err());
    }

    #[test]
    fn test_decode_unknown_dstype() {
        assert!(CollectdJsonDecoder
            .decode(
                br#"[{"values": [1], "dstypes": ["weird"], "dsnames": ["value"],
                      "time": 1, "plugin": "p", "type": "t"}]"#,
            )
            .is_err());
    }
}

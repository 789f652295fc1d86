//! Wire-format decoders for the ingress endpoints.
//!
//! Each decoder is a stateless capability: it turns one request body into
//! an ordered list of items, or fails the whole request. The ingress
//! service registers them in a table keyed by endpoint path, with the
//! protobuf variant selected by content type.

mod collectd;
mod json_v1;
mod json_v2;
mod protobuf;

pub use collectd::CollectdJsonDecoder;
pub use json_v1::JsonDecoderV1;
pub use json_v2::{render_datapoint_body, render_event_body, JsonDecoderV2, JsonEventDecoderV2};
pub use protobuf::{ProtobufDecoderV1, ProtobufDecoderV2, ProtobufEventDecoderV2};

use crate::data::Item;
use crate::errors::DecodeError;

/// A stateless parser turning one request body into pipeline items.
///
/// Item order must follow body order; a malformed field fails the whole
/// request (no partial success).
pub trait Decoder: Send + Sync {
    /// Protocol tag used for per-protocol counters and log fields.
    fn protocol(&self) -> &'static str;

    fn decode(&self, body: &[u8]) -> Result<Vec<Item>, DecodeError>;
}

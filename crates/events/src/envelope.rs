//! Wire-level message shapes.
//!
//! The broker body is the JSON payload only; identifiers and routing metadata
//! travel as headers so consumers can dedup without parsing the body.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use courier_core::{EventId, EventType, RoutingKey};

use crate::broker::BrokerError;

/// Header names shared by every broker adapter.
pub mod headers {
    pub const MESSAGE_ID: &str = "message_id";
    pub const EVENT_TYPE: &str = "event_type";
    pub const AGGREGATE_TYPE: &str = "aggregate_type";
    pub const AGGREGATE_ID: &str = "aggregate_id";
    pub const CREATED_AT: &str = "created_at";
    pub const PAYLOAD: &str = "payload";
}

/// A message on its way to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub message_id: EventId,
    pub event_type: EventType,
    pub routing_key: RoutingKey,
    pub aggregate_type: Option<String>,
    pub aggregate_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub payload: JsonValue,
}

impl OutboundMessage {
    /// Serialized message body.
    pub fn body(&self) -> Result<Vec<u8>, BrokerError> {
        serde_json::to_vec(&self.payload).map_err(|e| BrokerError::Serialization(e.to_string()))
    }

    /// Header pairs, absent aggregate coordinates omitted.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![
            (headers::MESSAGE_ID, self.message_id.to_string()),
            (headers::EVENT_TYPE, self.event_type.to_string()),
            (headers::CREATED_AT, self.created_at.to_rfc3339()),
        ];
        if let Some(t) = &self.aggregate_type {
            out.push((headers::AGGREGATE_TYPE, t.clone()));
        }
        if let Some(id) = &self.aggregate_id {
            out.push((headers::AGGREGATE_ID, id.clone()));
        }
        out
    }
}

/// A message received from the broker by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: EventId,
    pub event_type: String,
    pub routing_key: String,
    /// Where the message came from (exchange / stream name).
    pub source: String,
    pub payload: JsonValue,
    /// Broker-specific token used to acknowledge the delivery.
    pub receipt: String,
    /// True when the broker knows this delivery was handed out before.
    pub redelivered: bool,
}

impl Delivery {
    /// Rebuild a delivery from header pairs and a JSON body.
    pub fn from_parts<'a>(
        source: impl Into<String>,
        routing_key: impl Into<String>,
        receipt: impl Into<String>,
        fields: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, BrokerError> {
        let mut message_id = None;
        let mut event_type = None;
        let mut payload = None;

        for (k, v) in fields {
            match k {
                headers::MESSAGE_ID => {
                    message_id = Some(v.parse::<EventId>().map_err(|e| {
                        BrokerError::Malformed(format!("bad {}: {e}", headers::MESSAGE_ID))
                    })?)
                }
                headers::EVENT_TYPE => event_type = Some(v.to_string()),
                headers::PAYLOAD => {
                    payload = Some(serde_json::from_str::<JsonValue>(v).map_err(|e| {
                        BrokerError::Malformed(format!("payload is not JSON: {e}"))
                    })?)
                }
                _ => {}
            }
        }

        Ok(Self {
            message_id: message_id
                .ok_or_else(|| BrokerError::Malformed(format!("missing {}", headers::MESSAGE_ID)))?,
            event_type: event_type
                .ok_or_else(|| BrokerError::Malformed(format!("missing {}", headers::EVENT_TYPE)))?,
            routing_key: routing_key.into(),
            source: source.into(),
            payload: payload
                .ok_or_else(|| BrokerError::Malformed(format!("missing {}", headers::PAYLOAD)))?,
            receipt: receipt.into(),
            redelivered: false,
        })
    }
}

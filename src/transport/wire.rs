//! Wire format for the trade stream
//!
//! Text frames, one JSON object per frame:
//! - outbound: `{ "type": ..., "timestamp": <ms>, ...payload }`
//! - inbound:  `{ "type": ..., "data": {...}?, ...other }`

use chrono::Utc;
use serde_json::{Map, Value};

use crate::error::{StreamError, StreamResult};
use crate::trades::RawTrade;

pub const PING: &str = "ping";
pub const PONG: &str = "pong";
pub const SUBSCRIBE: &str = "subscribe";
pub const UNSUBSCRIBE: &str = "unsubscribe";
pub const TRADE_STATUS: &str = "trade_status";

/// Handler key that receives every inbound frame regardless of type
pub const WILDCARD: &str = "*";

/// A frame waiting to be stamped and written to the socket
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    msg_type: String,
    payload: Map<String, Value>,
}

impl OutboundFrame {
    /// Build a frame. Object payloads are flattened next to `type`; any other
    /// non-null payload is carried under `data`.
    pub fn new(msg_type: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        Self {
            msg_type: msg_type.into(),
            payload,
        }
    }

    pub fn ping() -> Self {
        Self::new(PING, Value::Null)
    }

    pub fn msg_type(&self) -> &str {
        &self.msg_type
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn to_json(&self) -> String {
        self.to_json_at(Utc::now().timestamp_millis())
    }

    /// `type` and `timestamp` always win over same-named payload keys.
    pub fn to_json_at(&self, timestamp_ms: i64) -> String {
        let mut obj = Map::with_capacity(self.payload.len() + 2);
        obj.insert("type".to_string(), Value::String(self.msg_type.clone()));
        obj.insert("timestamp".to_string(), Value::from(timestamp_ms));
        for (k, v) in &self.payload {
            if k != "type" && k != "timestamp" {
                obj.insert(k.clone(), v.clone());
            }
        }
        Value::Object(obj).to_string()
    }
}

/// A parsed inbound frame. Anything with a string `type` is accepted;
/// schema checks beyond that are left to the handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    msg_type: String,
    data: Value,
    raw: Value,
}

impl InboundFrame {
    pub fn parse(text: &str) -> StreamResult<Self> {
        let raw: Value = serde_json::from_str(text)
            .map_err(|e| StreamError::Protocol(format!("invalid json: {e}")))?;
        Self::from_value(raw)
    }

    pub fn from_value(raw: Value) -> StreamResult<Self> {
        let Some(obj) = raw.as_object() else {
            return Err(StreamError::Protocol("frame is not a json object".into()));
        };
        let msg_type = match obj.get("type") {
            Some(Value::String(t)) if !t.is_empty() => t.clone(),
            Some(_) => return Err(StreamError::Protocol("'type' is not a string".into())),
            None => return Err(StreamError::Protocol("missing 'type'".into())),
        };
        let data = obj.get("data").cloned().unwrap_or(Value::Null);
        Ok(Self {
            msg_type,
            data,
            raw,
        })
    }

    pub fn msg_type(&self) -> &str {
        &self.msg_type
    }

    /// The `data` field, or `Null` when the frame carried none
    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// `data` when it is an object, otherwise the frame itself. Older
    /// backends put event fields at the top level.
    pub fn payload(&self) -> &Value {
        if self.data.is_object() {
            &self.data
        } else {
            &self.raw
        }
    }

    pub fn message(&self) -> StreamResult<InboundMessage> {
        let payload = self.payload().clone();
        let msg = match self.msg_type.as_str() {
            "tick" => InboundMessage::Tick(payload),
            "candle" | "candles" => InboundMessage::Candle(payload),
            "signal" | "signals" => InboundMessage::Signal(payload),
            "bot_status" => InboundMessage::BotStatus(payload),
            PONG => InboundMessage::Pong,
            TRADE_STATUS => {
                let trade: RawTrade = serde_json::from_value(payload).map_err(|e| {
                    StreamError::Protocol(format!("malformed trade_status: {e}"))
                })?;
                InboundMessage::TradeStatus(trade)
            }
            other => InboundMessage::Unknown(other.to_string()),
        };
        Ok(msg)
    }
}

/// Typed view over the inbound message kinds this client knows about.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Tick(Value),
    Candle(Value),
    Signal(Value),
    TradeStatus(RawTrade),
    BotStatus(Value),
    Pong,
    /// Server-added type this client does not model; still dispatched by name
    Unknown(String),
}

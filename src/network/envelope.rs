//! Envelope Codec
//!
//! Every frame on the push channel is a JSON object of the shape
//! `{"type": ..., "data": ..., "timestamp": ...}`. Outbound frames are built
//! from [`ClientCommand`]; inbound frames decode into [`Envelope<Value>`] and
//! are classified by [`InboundKind`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{PushError, PushResult};
use crate::utils::helpers::current_timestamp_millis;

/// Generic wire envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub data: T,
    /// Sender-assigned epoch milliseconds. Informational only; anything
    /// that is not a number reads as 0.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: i64,
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .unwrap_or(0),
        _ => 0,
    })
}

impl<T> Envelope<T> {
    pub fn new(message_type: impl Into<String>, data: T) -> Self {
        Self {
            message_type: message_type.into(),
            data,
            timestamp: current_timestamp_millis(),
        }
    }
}

/// Control messages the client sends to the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    SubscribeWallet {
        wallet: String,
    },
    SubscribeSweep {
        #[serde(rename = "sweepId")]
        sweep_id: String,
    },
    UnsubscribeSweep {
        #[serde(rename = "sweepId")]
        sweep_id: String,
    },
    SubscribeConsolidation {
        #[serde(rename = "consolidationId")]
        consolidation_id: String,
    },
    UnsubscribeConsolidation {
        #[serde(rename = "consolidationId")]
        consolidation_id: String,
    },
    Ping {},
}

impl ClientCommand {
    /// Wire name of the command
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::SubscribeWallet { .. } => "subscribe_wallet",
            ClientCommand::SubscribeSweep { .. } => "subscribe_sweep",
            ClientCommand::UnsubscribeSweep { .. } => "unsubscribe_sweep",
            ClientCommand::SubscribeConsolidation { .. } => "subscribe_consolidation",
            ClientCommand::UnsubscribeConsolidation { .. } => "unsubscribe_consolidation",
            ClientCommand::Ping {} => "ping",
        }
    }
}

#[derive(Serialize)]
struct OutboundFrame<'a> {
    #[serde(flatten)]
    command: &'a ClientCommand,
    timestamp: i64,
}

/// Event types the backend pushes to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundKind {
    TransactionUpdate,
    PriceUpdate,
    SubscriptionTrigger,
    ConsolidationUpdate,
}

impl InboundKind {
    pub const ALL: [InboundKind; 4] = [
        InboundKind::TransactionUpdate,
        InboundKind::PriceUpdate,
        InboundKind::SubscriptionTrigger,
        InboundKind::ConsolidationUpdate,
    ];

    pub fn from_wire(message_type: &str) -> Option<Self> {
        match message_type {
            "transaction_update" => Some(InboundKind::TransactionUpdate),
            "price_update" => Some(InboundKind::PriceUpdate),
            "subscription_trigger" => Some(InboundKind::SubscriptionTrigger),
            "consolidation_update" => Some(InboundKind::ConsolidationUpdate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InboundKind::TransactionUpdate => "transaction_update",
            InboundKind::PriceUpdate => "price_update",
            InboundKind::SubscriptionTrigger => "subscription_trigger",
            InboundKind::ConsolidationUpdate => "consolidation_update",
        }
    }
}

/// Encode a command stamped with the current time
pub fn encode(command: &ClientCommand) -> PushResult<String> {
    encode_at(command, current_timestamp_millis())
}

/// Encode a command with an explicit timestamp
pub fn encode_at(command: &ClientCommand, timestamp: i64) -> PushResult<String> {
    let frame = OutboundFrame { command, timestamp };
    serde_json::to_string(&frame).map_err(PushError::Encode)
}

/// Encode an arbitrary outbound message
pub fn encode_raw(message_type: &str, data: Value) -> PushResult<String> {
    serde_json::to_string(&Envelope::new(message_type, data)).map_err(PushError::Encode)
}

/// Decode an inbound text frame
pub fn decode(text: &str) -> PushResult<Envelope<Value>> {
    serde_json::from_str(text).map_err(PushError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_subscribe_sweep() {
        let cmd = ClientCommand::SubscribeSweep {
            sweep_id: "abc".to_string(),
        };
        let text = encode_at(&cmd, 1_700_000_000_000).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "subscribe_sweep",
                "data": { "sweepId": "abc" },
                "timestamp": 1_700_000_000_000i64
            })
        );
    }

    #[test]
    fn test_encode_ping_has_empty_object() {
        let text = encode_at(&ClientCommand::Ping {}, 5).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "ping");
        assert_eq!(value["data"], json!({}));
    }

    #[test]
    fn test_command_names_match_wire() {
        let cmd = ClientCommand::UnsubscribeConsolidation {
            consolidation_id: "c-1".to_string(),
        };
        let value: Value = serde_json::from_str(&encode(&cmd).unwrap()).unwrap();
        assert_eq!(value["type"], cmd.name());
        assert_eq!(value["data"]["consolidationId"], "c-1");
    }

    #[test]
    fn test_decode_without_timestamp() {
        let env = decode(r#"{"type":"unknown_future_type","data":{}}"#).unwrap();
        assert_eq!(env.message_type, "unknown_future_type");
        assert_eq!(env.timestamp, 0);
        assert!(InboundKind::from_wire(&env.message_type).is_none());
    }

    #[test]
    fn test_decode_price_update() {
        let text = r#"{"type":"price_update","data":{"token":"ETH","usd":3120.5},"timestamp":42}"#;
        let env = decode(text).unwrap();
        assert_eq!(InboundKind::from_wire(&env.message_type), Some(InboundKind::PriceUpdate));
        assert_eq!(env.data["token"], "ETH");
        assert_eq!(env.timestamp, 42);
    }

    #[test]
    fn test_decode_tolerates_odd_timestamps() {
        let env =
            decode(r#"{"type":"price_update","data":{"token":"ETH"},"timestamp":null}"#).unwrap();
        assert_eq!(env.timestamp, 0);
        assert_eq!(env.data["token"], "ETH");

        let env =
            decode(r#"{"type":"price_update","data":{},"timestamp":1700000000000.0}"#).unwrap();
        assert_eq!(env.timestamp, 1_700_000_000_000);

        let env = decode(r#"{"type":"price_update","data":{},"timestamp":"yesterday"}"#).unwrap();
        assert_eq!(env.timestamp, 0);
    }

    #[test]
    fn test_inbound_kinds_round_trip_wire_names() {
        for kind in InboundKind::ALL {
            assert_eq!(InboundKind::from_wire(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_decode_garbage_is_error() {
        assert!(matches!(decode("not json"), Err(PushError::Decode(_))));
        assert!(matches!(decode(r#"{"data":1}"#), Err(PushError::Decode(_))));
    }
}

//! Typed views of server-pushed payloads
//!
//! The connection layer carries payloads as raw JSON. These types are for
//! consumers that want a structured view; decode them with
//! [`PushMessage::decode`](crate::network::event_bus::PushMessage::decode).
//! Unknown fields are ignored so backend additions do not break decoding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Overall state of a cross-chain consolidation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationStatus {
    Pending,
    Executing,
    Bridging,
    Completed,
    PartialSuccess,
    Failed,
    #[serde(other)]
    Unknown,
}

impl ConsolidationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConsolidationStatus::Completed
                | ConsolidationStatus::PartialSuccess
                | ConsolidationStatus::Failed
        )
    }
}

impl fmt::Display for ConsolidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsolidationStatus::Pending => write!(f, "PENDING"),
            ConsolidationStatus::Executing => write!(f, "EXECUTING"),
            ConsolidationStatus::Bridging => write!(f, "BRIDGING"),
            ConsolidationStatus::Completed => write!(f, "COMPLETED"),
            ConsolidationStatus::PartialSuccess => write!(f, "PARTIAL_SUCCESS"),
            ConsolidationStatus::Failed => write!(f, "FAILED"),
            ConsolidationStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// `consolidation_update` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationProgress {
    pub consolidation_id: String,
    pub status: ConsolidationStatus,
    #[serde(default)]
    pub progress_percent: f64,
    #[serde(default)]
    pub completed_chains: u32,
    #[serde(default)]
    pub total_chains: u32,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// `transaction_update` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStatus {
    pub hash: String,
    pub chain: String,
    pub status: String,
    #[serde(default)]
    pub sweep_id: Option<String>,
}

/// `price_update` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceTick {
    pub token: String,
    #[serde(default)]
    pub chain: Option<String>,
    pub price_usd: f64,
}

//! Domain types shared by watchers, the store and the dispatcher

use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, LogData, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::bytes32_to_hex;

/// Chain identifier, the same string the gateway emits as `destinationChain`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChainId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ChainId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Deterministic request identifier, see [`crate::hash::compute_request_id`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub B256);

impl RequestId {
    pub const ZERO: RequestId = RequestId(B256::ZERO);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0 .0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bytes32_to_hex(self.as_bytes()))
    }
}

impl FromStr for RequestId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        B256::from_str(s)
            .map(RequestId)
            .map_err(|e| format!("invalid request id {}: {}", s, e))
    }
}

/// Lifecycle status of a transfer request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Observed,
    Dispatching,
    Executed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Observed => "observed",
            RequestStatus::Dispatching => "dispatching",
            RequestStatus::Executed => "executed",
            RequestStatus::Failed => "failed",
        }
    }

    /// Edges of the lifecycle graph. `Executed` has no outgoing edge.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Observed, Dispatching)
                | (Failed, Dispatching)
                | (Dispatching, Executed)
                | (Dispatching, Observed)
                | (Dispatching, Failed)
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "observed" => Ok(RequestStatus::Observed),
            "dispatching" => Ok(RequestStatus::Dispatching),
            "executed" => Ok(RequestStatus::Executed),
            "failed" => Ok(RequestStatus::Failed),
            other => Err(format!("unknown request status: {}", other)),
        }
    }
}

/// One cross-chain transfer observed on a source gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub id: RequestId,
    pub source_chain: ChainId,
    pub dest_chain: ChainId,
    pub source_tx: B256,
    pub log_index: u64,
    pub source_height: u64,
    /// Gateway contract that emitted the event
    pub gateway: Address,
    pub sender: Address,
    pub recipient: Address,
    /// Token symbol, e.g. `aUSDC`
    pub asset: String,
    /// Base units, never rescaled
    pub amount: U256,
    pub source_confirmed_at: DateTime<Utc>,
    pub status: RequestStatus,
    pub attempts: u32,
    pub retry_after: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub dest_tx: Option<B256>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRequest {
    /// Eligible for a dispatch pass at `now`.
    pub fn is_pending_at(&self, now: DateTime<Utc>) -> bool {
        let due = self.retry_after.map_or(true, |at| at <= now);
        match self.status {
            RequestStatus::Observed => due,
            // Failed only comes back after an operator requeue sets retry_after
            RequestStatus::Failed => self.retry_after.is_some() && due,
            RequestStatus::Dispatching | RequestStatus::Executed => false,
        }
    }
}

/// Per-chain scan position
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatermarkCursor {
    pub height: u64,
    /// Last event recorded at `height`, if any
    pub log_index: Option<u64>,
}

impl WatermarkCursor {
    pub fn at(height: u64) -> Self {
        Self {
            height,
            log_index: None,
        }
    }
}

/// Undecoded gateway log as returned by a chain client
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub height: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    pub address: Address,
    pub log: LogData,
}

/// Inbound call the destination gateway executes for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPayload {
    pub request_id: RequestId,
    pub source_chain: ChainId,
    pub sender: Address,
    pub recipient: Address,
    pub asset: String,
    pub amount: U256,
}

impl From<&TransferRequest> for ExecutionPayload {
    fn from(request: &TransferRequest) -> Self {
        Self {
            request_id: request.id,
            source_chain: request.source_chain.clone(),
            sender: request.sender,
            recipient: request.recipient,
            asset: request.asset.clone(),
            amount: request.amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxHandle {
    pub chain: ChainId,
    pub tx_hash: B256,
}

/// Result of waiting on a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed { height: u64 },
    Reverted,
    Timeout,
}

/// Per-status totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub observed: usize,
    pub dispatching: usize,
    pub executed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: RequestStatus) {
        match status {
            RequestStatus::Observed => self.observed += 1,
            RequestStatus::Dispatching => self.dispatching += 1,
            RequestStatus::Executed => self.executed += 1,
            RequestStatus::Failed => self.failed += 1,
        }
    }
}

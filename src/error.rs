//! Error taxonomy for the relayer core
//!
//! Library code returns [`RelayError`]; the binary and the configuration
//! loader wrap it in `eyre` reports.

use alloy::primitives::B256;
use thiserror::Error;

use crate::types::{ChainId, RequestId};

pub type Result<T, E = RelayError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Endpoint unreachable (connection refused, transport timeout, 5xx)
    #[error("rpc unavailable on {chain}: {reason}")]
    RpcUnavailable { chain: ChainId, reason: String },

    /// Endpoint answered with an error payload or an undecodable response
    #[error("rpc error on {chain}: {reason}")]
    RpcError { chain: ChainId, reason: String },

    #[error("malformed event {tx_hash}:{log_index} on {chain}: {reason}")]
    MalformedEvent {
        chain: ChainId,
        tx_hash: B256,
        log_index: u64,
        reason: String,
    },

    #[error("execution of request {0} reverted")]
    SubmissionReverted(RequestId),

    #[error("execution of request {0} was not confirmed in time")]
    SubmissionTimeout(RequestId),

    #[error("request {id} exhausted retries after {attempts} attempts")]
    ExhaustedRetries { id: RequestId, attempts: u32 },

    #[error("unknown chain {0}")]
    UnknownChain(ChainId),

    #[error("invalid relay topology: {0}")]
    InvalidTopology(String),

    #[error("relay loop already started")]
    AlreadyStarted,

    #[error("store error: {0}")]
    Store(String),
}

impl RelayError {
    /// Errors that leave state untouched and are simply retried on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::RpcUnavailable { .. } | RelayError::RpcError { .. }
        )
    }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::RpcUnavailable { .. } => "rpc_unavailable",
            RelayError::RpcError { .. } => "rpc_error",
            RelayError::MalformedEvent { .. } => "malformed_event",
            RelayError::SubmissionReverted(_) => "reverted",
            RelayError::SubmissionTimeout(_) => "timeout",
            RelayError::ExhaustedRetries { .. } => "exhausted",
            RelayError::UnknownChain(_) => "unknown_chain",
            RelayError::InvalidTopology(_) => "topology",
            RelayError::AlreadyStarted => "already_started",
            RelayError::Store(_) => "store",
        }
    }
}

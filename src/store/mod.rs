//! Request storage
//!
//! The store owns the lifecycle of every [`TransferRequest`]. Watchers only
//! insert; the dispatcher moves status through compare-and-swap so that
//! concurrent passes cannot both claim a request.

pub mod mem;

use alloy::primitives::B256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    ChainId, RequestId, RequestStatus, StatusCounts, TransferRequest, WatermarkCursor,
};

pub use mem::InMemoryStore;

/// Bookkeeping written by the holder of a `Dispatching` claim
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptRecord {
    pub error: Option<String>,
    pub retry_after: Option<DateTime<Utc>>,
    pub dest_tx: Option<B256>,
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert unless the id is already known. Returns whether it was inserted.
    async fn insert_if_absent(&self, request: TransferRequest) -> Result<bool>;

    async fn get(&self, id: &RequestId) -> Result<Option<TransferRequest>>;

    /// Requests for `dest` due at `now`, oldest confirmation first, ties by id
    async fn list_pending(&self, dest: &ChainId, now: DateTime<Utc>)
        -> Result<Vec<TransferRequest>>;

    async fn list_by_status(&self, status: RequestStatus) -> Result<Vec<TransferRequest>>;

    /// Atomically move `id` from `from` to `to`. Returns false, changing
    /// nothing, when the current status is not `from` or the edge is not
    /// part of the lifecycle graph. Claiming (`-> Dispatching`) bumps
    /// `attempts` and clears `retry_after`.
    async fn transition(&self, id: &RequestId, from: RequestStatus, to: RequestStatus)
        -> Result<bool>;

    /// Annotate a request that is currently `Dispatching`
    async fn record_attempt(&self, id: &RequestId, record: AttemptRecord) -> Result<bool>;

    /// Make a `Failed` request eligible again with a fresh retry budget
    async fn requeue(&self, id: &RequestId, now: DateTime<Utc>) -> Result<bool>;

    async fn cursor(&self, chain: &ChainId) -> Result<Option<WatermarkCursor>>;

    /// Move the cursor forward. A cursor behind the stored one is rejected.
    async fn advance_cursor(&self, chain: &ChainId, cursor: WatermarkCursor) -> Result<bool>;

    async fn counts(&self) -> Result<StatusCounts>;
}

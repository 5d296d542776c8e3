use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::{AttemptRecord, RequestStore};
use crate::error::Result;
use crate::types::{
    ChainId, RequestId, RequestStatus, StatusCounts, TransferRequest, WatermarkCursor,
};

type Entry = Arc<Mutex<TransferRequest>>;

/// InMemoryStore keeps requests and cursors for the lifetime of the process.
///
/// The map lock is only held to find or add an entry; status changes lock
/// the single request they touch.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    requests: Arc<RwLock<HashMap<RequestId, Entry>>>,
    cursors: Arc<RwLock<HashMap<ChainId, WatermarkCursor>>>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("requests", &self.requests.read().len())
            .finish()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &RequestId) -> Option<Entry> {
        self.requests.read().get(id).cloned()
    }

    fn collect<F>(&self, keep: F) -> Vec<TransferRequest>
    where
        F: Fn(&TransferRequest) -> bool,
    {
        let entries: Vec<Entry> = self.requests.read().values().cloned().collect();
        let mut found: Vec<TransferRequest> = entries
            .iter()
            .filter_map(|entry| {
                let request = entry.lock();
                keep(&request).then(|| request.clone())
            })
            .collect();
        found.sort_by(|a, b| {
            a.source_confirmed_at
                .cmp(&b.source_confirmed_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        found
    }
}

#[async_trait]
impl RequestStore for InMemoryStore {
    #[tracing::instrument(skip_all, fields(id = %request.id))]
    async fn insert_if_absent(&self, request: TransferRequest) -> Result<bool> {
        let mut guard = self.requests.write();
        if guard.contains_key(&request.id) {
            return Ok(false);
        }
        guard.insert(request.id, Arc::new(Mutex::new(request)));
        Ok(true)
    }

    async fn get(&self, id: &RequestId) -> Result<Option<TransferRequest>> {
        Ok(self.entry(id).map(|entry| entry.lock().clone()))
    }

    async fn list_pending(
        &self,
        dest: &ChainId,
        now: DateTime<Utc>,
    ) -> Result<Vec<TransferRequest>> {
        Ok(self.collect(|request| &request.dest_chain == dest && request.is_pending_at(now)))
    }

    async fn list_by_status(&self, status: RequestStatus) -> Result<Vec<TransferRequest>> {
        Ok(self.collect(|request| request.status == status))
    }

    #[tracing::instrument(skip(self))]
    async fn transition(
        &self,
        id: &RequestId,
        from: RequestStatus,
        to: RequestStatus,
    ) -> Result<bool> {
        let Some(entry) = self.entry(id) else {
            return Ok(false);
        };
        let mut request = entry.lock();
        if request.status != from || !from.can_transition_to(to) {
            debug!(current = %request.status, "Transition rejected");
            return Ok(false);
        }
        request.status = to;
        if to == RequestStatus::Dispatching {
            request.attempts += 1;
            request.retry_after = None;
        }
        request.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_attempt(&self, id: &RequestId, record: AttemptRecord) -> Result<bool> {
        let Some(entry) = self.entry(id) else {
            return Ok(false);
        };
        let mut request = entry.lock();
        if request.status != RequestStatus::Dispatching {
            return Ok(false);
        }
        if record.error.is_some() {
            request.last_error = record.error;
        }
        if record.dest_tx.is_some() {
            request.dest_tx = record.dest_tx;
        }
        request.retry_after = record.retry_after;
        request.updated_at = Utc::now();
        Ok(true)
    }

    #[tracing::instrument(skip(self))]
    async fn requeue(&self, id: &RequestId, now: DateTime<Utc>) -> Result<bool> {
        let Some(entry) = self.entry(id) else {
            return Ok(false);
        };
        let mut request = entry.lock();
        if request.status != RequestStatus::Failed {
            return Ok(false);
        }
        request.attempts = 0;
        request.retry_after = Some(now);
        request.updated_at = now;
        Ok(true)
    }

    async fn cursor(&self, chain: &ChainId) -> Result<Option<WatermarkCursor>> {
        Ok(self.cursors.read().get(chain).copied())
    }

    #[tracing::instrument(skip(self))]
    async fn advance_cursor(&self, chain: &ChainId, cursor: WatermarkCursor) -> Result<bool> {
        let mut guard = self.cursors.write();
        match guard.get(chain) {
            Some(current) if *current > cursor => Ok(false),
            _ => {
                guard.insert(chain.clone(), cursor);
                Ok(true)
            }
        }
    }

    async fn counts(&self) -> Result<StatusCounts> {
        let entries: Vec<Entry> = self.requests.read().values().cloned().collect();
        let mut counts = StatusCounts::default();
        for entry in entries {
            counts.add(entry.lock().status);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, B256, U256};
    use chrono::Duration;

    fn request(id: u8, dest: &str, confirmed_at: DateTime<Utc>) -> TransferRequest {
        TransferRequest {
            id: RequestId(B256::repeat_byte(id)),
            source_chain: ChainId::new("Ethereum"),
            dest_chain: ChainId::new(dest),
            source_tx: B256::repeat_byte(id),
            log_index: 0,
            source_height: 100,
            gateway: Address::repeat_byte(0x01),
            sender: Address::repeat_byte(0x02),
            recipient: Address::repeat_byte(0x03),
            asset: "aUSDC".into(),
            amount: U256::from(10_000_000u64),
            source_confirmed_at: confirmed_at,
            status: RequestStatus::Observed,
            attempts: 0,
            retry_after: None,
            last_error: None,
            dest_tx: None,
            updated_at: confirmed_at,
        }
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        assert!(store.insert_if_absent(request(1, "Telcoin Network", now)).await.unwrap());

        let mut replay = request(1, "Telcoin Network", now + Duration::seconds(30));
        replay.amount = U256::from(1u64);
        assert!(!store.insert_if_absent(replay).await.unwrap());

        let stored = store.get(&RequestId(B256::repeat_byte(1))).await.unwrap().unwrap();
        assert_eq!(stored.amount, U256::from(10_000_000u64));
        assert_eq!(stored.source_confirmed_at, now);
    }

    #[tokio::test]
    async fn test_cas_mismatch_is_noop() {
        let store = InMemoryStore::new();
        let id = RequestId(B256::repeat_byte(1));
        store.insert_if_absent(request(1, "Telcoin Network", Utc::now())).await.unwrap();

        assert!(!store
            .transition(&id, RequestStatus::Dispatching, RequestStatus::Executed)
            .await
            .unwrap());
        let unchanged = store.get(&id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, RequestStatus::Observed);
        assert_eq!(unchanged.attempts, 0);

        assert!(!store
            .transition(&RequestId(B256::ZERO), RequestStatus::Observed, RequestStatus::Dispatching)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_claim_counts_attempts_and_executed_is_final() {
        let store = InMemoryStore::new();
        let id = RequestId(B256::repeat_byte(1));
        store.insert_if_absent(request(1, "Telcoin Network", Utc::now())).await.unwrap();

        assert!(store.transition(&id, RequestStatus::Observed, RequestStatus::Dispatching).await.unwrap());
        assert_eq!(store.get(&id).await.unwrap().unwrap().attempts, 1);
        assert!(store.transition(&id, RequestStatus::Dispatching, RequestStatus::Executed).await.unwrap());

        for (from, to) in [
            (RequestStatus::Executed, RequestStatus::Observed),
            (RequestStatus::Executed, RequestStatus::Dispatching),
            (RequestStatus::Executed, RequestStatus::Failed),
        ] {
            assert!(!store.transition(&id, from, to).await.unwrap());
        }
        assert_eq!(store.get(&id).await.unwrap().unwrap().status, RequestStatus::Executed);
    }

    #[tokio::test]
    async fn test_list_pending_order_and_filters() {
        let store = InMemoryStore::new();
        let t0 = Utc::now();
        store.insert_if_absent(request(3, "Telcoin Network", t0)).await.unwrap();
        store.insert_if_absent(request(2, "Telcoin Network", t0)).await.unwrap();
        store.insert_if_absent(request(1, "Telcoin Network", t0 + Duration::seconds(1))).await.unwrap();
        store.insert_if_absent(request(4, "Ethereum", t0)).await.unwrap();

        let mut backing_off = request(5, "Telcoin Network", t0);
        backing_off.retry_after = Some(t0 + Duration::minutes(5));
        store.insert_if_absent(backing_off).await.unwrap();

        let pending = store
            .list_pending(&ChainId::new("Telcoin Network"), t0 + Duration::seconds(2))
            .await
            .unwrap();
        let ids: Vec<u8> = pending.iter().map(|r| r.id.as_bytes()[0]).collect();
        assert_eq!(ids, vec![2, 3, 1]);

        let later = store
            .list_pending(&ChainId::new("Telcoin Network"), t0 + Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(later.len(), 4);
    }

    #[tokio::test]
    async fn test_record_attempt_requires_claim() {
        let store = InMemoryStore::new();
        let id = RequestId(B256::repeat_byte(1));
        store.insert_if_absent(request(1, "Telcoin Network", Utc::now())).await.unwrap();

        let record = AttemptRecord {
            error: Some("reverted".into()),
            ..AttemptRecord::default()
        };
        assert!(!store.record_attempt(&id, record.clone()).await.unwrap());

        store.transition(&id, RequestStatus::Observed, RequestStatus::Dispatching).await.unwrap();
        assert!(store.record_attempt(&id, record).await.unwrap());
        assert_eq!(
            store.get(&id).await.unwrap().unwrap().last_error.as_deref(),
            Some("reverted")
        );
    }

    #[tokio::test]
    async fn test_requeue_only_failed() {
        let store = InMemoryStore::new();
        let id = RequestId(B256::repeat_byte(1));
        let now = Utc::now();
        store.insert_if_absent(request(1, "Telcoin Network", now)).await.unwrap();
        assert!(!store.requeue(&id, now).await.unwrap());

        store.transition(&id, RequestStatus::Observed, RequestStatus::Dispatching).await.unwrap();
        store.transition(&id, RequestStatus::Dispatching, RequestStatus::Failed).await.unwrap();
        let dest = ChainId::new("Telcoin Network");
        assert!(store.list_pending(&dest, now).await.unwrap().is_empty());

        assert!(store.requeue(&id, now).await.unwrap());
        let pending = store.list_pending(&dest, now).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, RequestStatus::Failed);
        assert_eq!(pending[0].attempts, 0);
        assert!(store.transition(&id, RequestStatus::Failed, RequestStatus::Dispatching).await.unwrap());
    }

    #[tokio::test]
    async fn test_cursor_never_regresses() {
        let store = InMemoryStore::new();
        let chain = ChainId::new("Ethereum");
        assert_eq!(store.cursor(&chain).await.unwrap(), None);

        assert!(store.advance_cursor(&chain, WatermarkCursor::at(98)).await.unwrap());
        assert!(!store.advance_cursor(&chain, WatermarkCursor::at(50)).await.unwrap());
        assert!(store
            .advance_cursor(&chain, WatermarkCursor { height: 98, log_index: Some(2) })
            .await
            .unwrap());
        assert_eq!(
            store.cursor(&chain).await.unwrap(),
            Some(WatermarkCursor { height: 98, log_index: Some(2) })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_have_one_winner() {
        let store = InMemoryStore::new();
        let id = RequestId(B256::repeat_byte(9));
        store.insert_if_absent(request(9, "Telcoin Network", Utc::now())).await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..32 {
            let store = store.clone();
            tasks.spawn(async move {
                store
                    .transition(&id, RequestStatus::Observed, RequestStatus::Dispatching)
                    .await
                    .unwrap()
            });
        }
        let mut winners = 0;
        while let Some(won) = tasks.join_next().await {
            if won.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.get(&id).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_counts() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        for id in 1..=3 {
            store.insert_if_absent(request(id, "Telcoin Network", now)).await.unwrap();
        }
        let id = RequestId(B256::repeat_byte(1));
        store.transition(&id, RequestStatus::Observed, RequestStatus::Dispatching).await.unwrap();
        let counts = store.counts().await.unwrap();
        assert_eq!(counts.observed, 2);
        assert_eq!(counts.dispatching, 1);
    }
}

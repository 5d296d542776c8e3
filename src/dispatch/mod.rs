//! Destination dispatch
//!
//! Every destination chain is a lane. Lanes run in parallel; inside a lane
//! requests are executed one after another so the relayer key's nonces stay
//! ordered. A request is only worked on after winning the
//! `-> Dispatching` compare-and-swap, so overlapping passes never execute the
//! same request twice.

pub mod retry;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::ChainClient;
use crate::error::{RelayError, Result};
use crate::metrics;
use crate::store::{AttemptRecord, RequestStore};
use crate::types::{
    ChainId, Confirmation, ExecutionPayload, RequestStatus, TransferRequest,
};

pub use retry::RetryConfig;

/// A destination chain and the confirmations its executions need
#[derive(Clone)]
pub struct Lane {
    pub client: Arc<dyn ChainClient>,
    pub min_confirmations: u64,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub retry: RetryConfig,
    /// Upper bound on waiting for one submission's confirmation
    pub submission_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            submission_timeout: Duration::from_secs(60),
        }
    }
}

/// Per-lane summary of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub chain: ChainId,
    pub executed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Requests another pass had already claimed
    pub skipped: usize,
}

/// Result of one attempt against the destination
enum Attempt {
    Submitted(Confirmation),
    /// An earlier submission landed; nothing was sent this time
    AlreadyExecuted,
}

/// What happened to one request in a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Executed,
    RetryScheduled,
    Failed,
    Skipped,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn RequestStore>,
    lanes: Arc<BTreeMap<ChainId, Lane>>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn RequestStore>,
        lanes: impl IntoIterator<Item = Lane>,
        config: DispatchConfig,
    ) -> Self {
        let lanes = lanes
            .into_iter()
            .map(|lane| (lane.client.chain().clone(), lane))
            .collect();
        Self {
            store,
            lanes: Arc::new(lanes),
            config,
        }
    }

    pub fn destinations(&self) -> impl Iterator<Item = &ChainId> {
        self.lanes.keys()
    }

    /// Run every lane concurrently and wait for all of them
    pub async fn dispatch_all(&self, cancel: &CancellationToken) -> Vec<Result<DispatchReport>> {
        let mut tasks = JoinSet::new();
        for chain in self.lanes.keys() {
            let dispatcher = self.clone();
            let chain = chain.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { dispatcher.dispatch_chain(&chain, &cancel).await });
        }

        let mut reports = Vec::with_capacity(self.lanes.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(error = %e, "Dispatch task panicked");
                    reports.push(Err(RelayError::Store(format!("dispatch task failed: {}", e))));
                }
            }
        }
        reports
    }

    /// Drain the pending queue of one destination chain
    pub async fn dispatch_chain(
        &self,
        dest: &ChainId,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport> {
        let lane = self
            .lanes
            .get(dest)
            .ok_or_else(|| RelayError::UnknownChain(dest.clone()))?;
        let pending = self.store.list_pending(dest, Utc::now()).await?;
        let mut report = DispatchReport {
            chain: dest.clone(),
            ..DispatchReport::default()
        };
        if pending.is_empty() {
            return Ok(report);
        }
        debug!(chain = %dest, pending = pending.len(), "Dispatching pending requests");

        for request in pending {
            if cancel.is_cancelled() {
                debug!(chain = %dest, "Stop requested, not claiming further requests");
                break;
            }
            match self.dispatch_one(lane, &request, cancel).await? {
                DispatchOutcome::Executed => report.executed += 1,
                DispatchOutcome::RetryScheduled => report.retried += 1,
                DispatchOutcome::Failed => report.failed += 1,
                DispatchOutcome::Skipped => report.skipped += 1,
            }
        }
        Ok(report)
    }

    /// Claim, execute and settle one request.
    ///
    /// Errors are store failures only; chain failures are settled into the
    /// request's status.
    pub async fn dispatch_one(
        &self,
        lane: &Lane,
        request: &TransferRequest,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome> {
        let id = request.id;
        if !self
            .store
            .transition(&id, request.status, RequestStatus::Dispatching)
            .await?
        {
            debug!(request_id = %id, "Request claimed by another pass");
            return Ok(DispatchOutcome::Skipped);
        }
        // Re-read for the attempt count written by the claim
        let Some(claimed) = self.store.get(&id).await? else {
            return Err(RelayError::Store(format!("claimed request {} vanished", id)));
        };

        let result = self.execute(lane, &claimed, cancel).await;
        let chain = lane.client.chain();
        let failure = match result {
            Ok(Attempt::Submitted(Confirmation::Confirmed { height })) => {
                return self.settle_executed(&claimed, Some(height)).await;
            }
            Ok(Attempt::AlreadyExecuted) => return self.settle_executed(&claimed, None).await,
            Ok(Attempt::Submitted(Confirmation::Reverted)) => RelayError::SubmissionReverted(id),
            Ok(Attempt::Submitted(Confirmation::Timeout)) => RelayError::SubmissionTimeout(id),
            Err(e) => e,
        };
        metrics::record_submission(chain.as_str(), failure.kind());

        let now = Utc::now();
        if self.config.retry.should_retry(claimed.attempts) {
            let retry_after = self.config.retry.next_retry_after(claimed.attempts, now);
            warn!(
                chain = %chain,
                request_id = %id,
                attempt = claimed.attempts,
                max_retries = self.config.retry.max_retries,
                retry_after = %retry_after,
                error = %failure,
                "Execution failed, retry scheduled"
            );
            self.store
                .record_attempt(
                    &id,
                    AttemptRecord {
                        error: Some(failure.to_string()),
                        retry_after: Some(retry_after),
                        dest_tx: None,
                    },
                )
                .await?;
            self.store
                .transition(&id, RequestStatus::Dispatching, RequestStatus::Observed)
                .await?;
            Ok(DispatchOutcome::RetryScheduled)
        } else {
            let exhausted = RelayError::ExhaustedRetries {
                id,
                attempts: claimed.attempts,
            };
            error!(chain = %chain, error = %exhausted, last_error = %failure, "Request failed permanently");
            self.store
                .record_attempt(
                    &id,
                    AttemptRecord {
                        error: Some(failure.to_string()),
                        retry_after: None,
                        dest_tx: None,
                    },
                )
                .await?;
            self.store
                .transition(&id, RequestStatus::Dispatching, RequestStatus::Failed)
                .await?;
            metrics::record_failed(chain.as_str());
            Ok(DispatchOutcome::Failed)
        }
    }

    /// One attempt against the destination chain
    async fn execute(
        &self,
        lane: &Lane,
        request: &TransferRequest,
        cancel: &CancellationToken,
    ) -> Result<Attempt> {
        let client = &lane.client;

        // Any earlier submission may have landed after its wait gave up,
        // including one made before an operator requeue
        if request.dest_tx.is_some() && client.is_executed(&request.id).await? {
            info!(
                chain = %client.chain(),
                request_id = %request.id,
                dest_tx = ?request.dest_tx,
                "Request already executed on destination"
            );
            return Ok(Attempt::AlreadyExecuted);
        }

        let handle = client
            .submit_transaction(&ExecutionPayload::from(request))
            .await?;
        self.store
            .record_attempt(
                &request.id,
                AttemptRecord {
                    dest_tx: Some(handle.tx_hash),
                    ..AttemptRecord::default()
                },
            )
            .await?;

        let confirmation = tokio::select! {
            confirmation = client.wait_for_confirmation(
                &handle,
                lane.min_confirmations,
                self.config.submission_timeout,
            ) => confirmation,
            _ = cancel.cancelled() => {
                debug!(request_id = %request.id, tx_hash = %handle.tx_hash, "Confirmation wait interrupted by stop");
                Ok(Confirmation::Timeout)
            }
        };
        confirmation.map(Attempt::Submitted)
    }

    /// `height` is the block of this pass's confirmed submission, `None` when
    /// an earlier submission was found executed
    async fn settle_executed(
        &self,
        request: &TransferRequest,
        height: Option<u64>,
    ) -> Result<DispatchOutcome> {
        let chain = &request.dest_chain;
        if !self
            .store
            .transition(&request.id, RequestStatus::Dispatching, RequestStatus::Executed)
            .await?
        {
            return Err(RelayError::Store(format!(
                "lost the claim on request {} while executing",
                request.id
            )));
        }
        let latency = (Utc::now() - request.source_confirmed_at).num_milliseconds() as f64 / 1000.0;
        if height.is_some() {
            metrics::record_submission(chain.as_str(), "confirmed");
        }
        metrics::record_executed(chain.as_str(), latency);
        info!(
            chain = %chain,
            request_id = %request.id,
            attempt = request.attempts,
            height = ?height,
            recipient = %request.recipient,
            amount = %request.amount,
            "Request executed"
        );
        Ok(DispatchOutcome::Executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::memory::ScriptedOutcome;
    use crate::chain::InMemoryChain;
    use crate::hash::compute_request_id;
    use crate::store::InMemoryStore;
    use crate::types::RequestId;
    use alloy::primitives::{Address, B256, U256};

    struct Fixture {
        dest: Arc<InMemoryChain>,
        store: Arc<InMemoryStore>,
        dispatcher: Dispatcher,
    }

    fn fixture(max_retries: u32) -> Fixture {
        fixture_on("Telcoin Network", max_retries)
    }

    fn fixture_on(dest_chain: &str, max_retries: u32) -> Fixture {
        let dest = Arc::new(InMemoryChain::new(dest_chain, Address::repeat_byte(0x02)));
        dest.deploy_token("aUSDC", "Axelar Wrapped aUSDC", 6);
        let store = Arc::new(InMemoryStore::new());
        let dispatcher = Dispatcher::new(
            store.clone(),
            [Lane {
                client: dest.clone(),
                min_confirmations: 1,
            }],
            DispatchConfig {
                retry: RetryConfig {
                    max_retries,
                    initial_backoff: Duration::ZERO,
                    ..RetryConfig::default()
                },
                submission_timeout: Duration::from_millis(20),
            },
        );
        Fixture {
            dest,
            store,
            dispatcher,
        }
    }

    async fn observe(f: &Fixture, n: u8) -> RequestId {
        let now = Utc::now();
        let tx = B256::repeat_byte(n);
        let id = compute_request_id("Ethereum", &tx, 0);
        f.store
            .insert_if_absent(TransferRequest {
                id,
                source_chain: ChainId::new("Ethereum"),
                dest_chain: f.dest.chain().clone(),
                source_tx: tx,
                log_index: 0,
                source_height: n as u64,
                gateway: Address::repeat_byte(0x01),
                sender: Address::repeat_byte(0xaa),
                recipient: Address::repeat_byte(0xbb),
                asset: "aUSDC".into(),
                amount: U256::from(10_000_000u64),
                source_confirmed_at: now,
                status: RequestStatus::Observed,
                attempts: 0,
                retry_after: None,
                last_error: None,
                dest_tx: None,
                updated_at: now,
            })
            .await
            .unwrap();
        id
    }

    async fn pass(f: &Fixture) -> DispatchReport {
        f.dispatcher
            .dispatch_chain(f.dest.chain(), &CancellationToken::new())
            .await
            .unwrap()
    }

    fn confirmed_submissions(chain: &str) -> f64 {
        metrics::SUBMISSIONS
            .with_label_values(&[chain, "confirmed"])
            .get()
    }

    #[tokio::test]
    async fn test_confirmed_execution() {
        let f = fixture(3);
        let id = observe(&f, 1).await;

        let report = pass(&f).await;
        assert_eq!(report.executed, 1);

        let request = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Executed);
        assert_eq!(request.attempts, 1);
        assert!(request.dest_tx.is_some());
        assert_eq!(
            f.dest.balance_of("aUSDC", Address::repeat_byte(0xbb)),
            U256::from(10_000_000u64)
        );
        assert_eq!(pass(&f).await, DispatchReport { chain: ChainId::new("Telcoin Network"), ..Default::default() });
    }

    #[tokio::test]
    async fn test_timeouts_then_success() {
        let f = fixture(3);
        let id = observe(&f, 1).await;
        f.dest
            .script_outcomes([ScriptedOutcome::Timeout, ScriptedOutcome::Timeout]);

        assert_eq!(pass(&f).await.retried, 1);
        assert_eq!(pass(&f).await.retried, 1);
        assert_eq!(pass(&f).await.executed, 1);

        let request = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Executed);
        assert_eq!(request.attempts, 3);
        assert_eq!(f.dest.submissions().len(), 3);
    }

    #[tokio::test]
    async fn test_persistent_revert_exhausts_retries() {
        let f = fixture(2);
        let id = observe(&f, 1).await;
        f.dest.script_outcomes([ScriptedOutcome::Revert; 5]);

        for _ in 0..5 {
            pass(&f).await;
        }

        let request = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Failed);
        assert_eq!(request.attempts, 3);
        assert!(request.last_error.unwrap().contains("reverted"));
        assert_eq!(f.dest.submissions().len(), 3);
    }

    #[tokio::test]
    async fn test_zero_retries_fails_after_first_attempt() {
        let f = fixture(0);
        let id = observe(&f, 1).await;
        f.dest.script_outcomes([ScriptedOutcome::Revert]);

        assert_eq!(pass(&f).await.failed, 1);
        assert_eq!(f.store.get(&id).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_late_landing_is_not_executed_twice() {
        let f = fixture(3);
        let id = observe(&f, 1).await;
        f.dest.script_outcomes([ScriptedOutcome::LandsLate]);

        assert_eq!(pass(&f).await.retried, 1);
        assert_eq!(pass(&f).await.executed, 1);

        assert_eq!(f.store.get(&id).await.unwrap().unwrap().status, RequestStatus::Executed);
        assert_eq!(f.dest.submissions().len(), 1);
        assert_eq!(
            f.dest.balance_of("aUSDC", Address::repeat_byte(0xbb)),
            U256::from(10_000_000u64)
        );
    }

    #[tokio::test]
    async fn test_submission_outage_counts_as_attempt() {
        let f = fixture(3);
        let id = observe(&f, 1).await;
        f.dest.set_available(false);

        assert_eq!(pass(&f).await.retried, 1);
        let request = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Observed);
        assert_eq!(request.attempts, 1);
        assert!(request.last_error.unwrap().contains("rpc unavailable"));
    }

    #[tokio::test]
    async fn test_backoff_defers_retry() {
        let f = fixture(3);
        let dispatcher = Dispatcher::new(
            f.store.clone(),
            [Lane {
                client: f.dest.clone(),
                min_confirmations: 1,
            }],
            DispatchConfig {
                retry: RetryConfig::default(),
                submission_timeout: Duration::from_millis(20),
            },
        );
        let id = observe(&f, 1).await;
        f.dest.script_outcomes([ScriptedOutcome::Revert]);
        let dest = ChainId::new("Telcoin Network");
        let cancel = CancellationToken::new();

        assert_eq!(dispatcher.dispatch_chain(&dest, &cancel).await.unwrap().retried, 1);
        let second = dispatcher.dispatch_chain(&dest, &cancel).await.unwrap();
        assert_eq!(second.executed + second.retried, 0);
        assert!(f.store.get(&id).await.unwrap().unwrap().retry_after.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_passes_execute_once() {
        let f = fixture(3);
        for n in 1..=5 {
            observe(&f, n).await;
        }

        let cancel = CancellationToken::new();
        let dest = ChainId::new("Telcoin Network");
        let (a, b) = tokio::join!(
            f.dispatcher.dispatch_chain(&dest, &cancel),
            f.dispatcher.dispatch_chain(&dest, &cancel)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.executed + b.executed, 5);
        assert_eq!(f.dest.submissions().len(), 5);
        assert_eq!(f.store.counts().await.unwrap().executed, 5);
    }

    #[tokio::test]
    async fn test_cancelled_pass_claims_nothing() {
        let f = fixture(3);
        let id = observe(&f, 1).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = f
            .dispatcher
            .dispatch_chain(&ChainId::new("Telcoin Network"), &cancel)
            .await
            .unwrap();
        assert_eq!(report.executed + report.retried + report.skipped, 0);
        assert_eq!(f.store.get(&id).await.unwrap().unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_requeued_failure_runs_again() {
        let f = fixture(0);
        let id = observe(&f, 1).await;
        f.dest.script_outcomes([ScriptedOutcome::Revert]);
        assert_eq!(pass(&f).await.failed, 1);

        assert!(f.store.requeue(&id, Utc::now()).await.unwrap());
        assert_eq!(pass(&f).await.executed, 1);
        assert_eq!(f.store.get(&id).await.unwrap().unwrap().status, RequestStatus::Executed);
    }

    #[tokio::test]
    async fn test_requeue_after_late_landing_does_not_resubmit() {
        let f = fixture_on("Requeue Lane", 0);
        let id = observe(&f, 1).await;
        f.dest.script_outcomes([ScriptedOutcome::LandsLate]);

        assert_eq!(pass(&f).await.failed, 1);
        let failed = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(failed.status, RequestStatus::Failed);
        assert!(failed.dest_tx.is_some());
        assert!(f.dest.is_executed(&id).await.unwrap());

        assert!(f.store.requeue(&id, Utc::now()).await.unwrap());
        assert_eq!(pass(&f).await.executed, 1);

        let request = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Executed);
        assert_eq!(request.attempts, 1);
        assert_eq!(f.dest.submissions().len(), 1);
        assert_eq!(
            f.dest.balance_of("aUSDC", Address::repeat_byte(0xbb)),
            U256::from(10_000_000u64)
        );
    }

    #[tokio::test]
    async fn test_already_executed_is_not_counted_as_submission() {
        let f = fixture_on("Late Lane", 3);
        let id = observe(&f, 1).await;
        f.dest.script_outcomes([ScriptedOutcome::LandsLate]);

        assert_eq!(pass(&f).await.retried, 1);
        let before = confirmed_submissions("Late Lane");
        assert_eq!(pass(&f).await.executed, 1);

        assert_eq!(f.store.get(&id).await.unwrap().unwrap().status, RequestStatus::Executed);
        assert_eq!(confirmed_submissions("Late Lane"), before);
        assert_eq!(f.dest.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_destination() {
        let f = fixture(3);
        let err = f
            .dispatcher
            .dispatch_chain(&ChainId::new("Polygon"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownChain(_)));
    }
}

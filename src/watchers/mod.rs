//! Source chain watchers
//!
//! One [`EventWatcher`] per source chain. Each tick scans the confirmed range
//! above the chain's watermark, records new transfer requests, and only then
//! moves the watermark.

pub mod decode;

use std::collections::HashSet;
use std::sync::Arc;

use alloy::primitives::Address;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::chain::ChainClient;
use crate::error::{RelayError, Result};
use crate::metrics;
use crate::store::RequestStore;
use crate::types::{ChainId, WatermarkCursor};

pub use decode::decode_transfer;

/// Event watcher configuration
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Blocks an event must be buried under before it is recorded
    pub confirmations: u64,
    /// Maximum block range per tick (to avoid RPC limits)
    pub max_block_range: u64,
    /// Watermark used when the chain has no cursor yet
    pub start_height: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            confirmations: 1,
            max_block_range: 10_000,
            start_height: 0,
        }
    }
}

/// Outcome of a tick that scanned a non-empty range
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub chain: ChainId,
    pub from: u64,
    pub to: u64,
    pub observed: usize,
    pub duplicates: usize,
    pub skipped: usize,
}

pub struct EventWatcher {
    client: Arc<dyn ChainClient>,
    store: Arc<dyn RequestStore>,
    /// (destination chain, source gateway) pairs relayed from this chain
    routes: HashSet<(ChainId, Address)>,
    config: WatcherConfig,
}

impl EventWatcher {
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Arc<dyn RequestStore>,
        routes: impl IntoIterator<Item = (ChainId, Address)>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            client,
            store,
            routes: routes.into_iter().collect(),
            config,
        }
    }

    pub fn chain(&self) -> &ChainId {
        self.client.chain()
    }

    /// Scan the next confirmed range. `Ok(None)` when there is nothing new.
    ///
    /// Any RPC or store error leaves the watermark where it was.
    pub async fn tick(&self) -> Result<Option<ScanReport>> {
        let chain = self.client.chain().clone();
        let latest = self.client.latest_height().await?;
        let safe = latest.saturating_sub(self.config.confirmations);

        let last = match self.store.cursor(&chain).await? {
            Some(cursor) => cursor.height,
            None => self.config.start_height,
        };
        let from = last.saturating_add(1);
        if from > safe {
            debug!(chain = %chain, latest, safe, last, "No confirmed blocks to scan");
            return Ok(None);
        }
        let to = safe.min(from.saturating_add(self.config.max_block_range.max(1) - 1));

        let events = self.client.get_events(from, to).await?;
        let confirmed_at = Utc::now();
        let mut report = ScanReport {
            chain: chain.clone(),
            from,
            to,
            ..ScanReport::default()
        };

        for event in &events {
            let request = match decode_transfer(&chain, event, confirmed_at) {
                Ok(request) => request,
                Err(e) => {
                    error!(chain = %chain, height = event.height, error = %e, "Skipping malformed gateway event");
                    metrics::record_event(chain.as_str(), "malformed");
                    report.skipped += 1;
                    continue;
                }
            };

            if !self.routes.contains(&(request.dest_chain.clone(), request.gateway)) {
                warn!(
                    chain = %chain,
                    dest_chain = %request.dest_chain,
                    gateway = %request.gateway,
                    tx_hash = %request.source_tx,
                    "Skipping transfer to an unrouted destination"
                );
                metrics::record_event(chain.as_str(), "unroutable");
                report.skipped += 1;
                continue;
            }

            let (id, dest, amount) = (request.id, request.dest_chain.clone(), request.amount);
            if self.store.insert_if_absent(request).await? {
                info!(
                    chain = %chain,
                    request_id = %id,
                    dest_chain = %dest,
                    amount = %amount,
                    height = event.height,
                    "Transfer request observed"
                );
                metrics::record_event(chain.as_str(), "observed");
                report.observed += 1;
            } else {
                debug!(chain = %chain, request_id = %id, "Transfer request already recorded");
                metrics::record_event(chain.as_str(), "duplicate");
                report.duplicates += 1;
            }
        }

        let cursor = WatermarkCursor {
            height: to,
            log_index: events
                .iter()
                .filter(|event| event.height == to)
                .map(|event| event.log_index)
                .max(),
        };
        if !self.store.advance_cursor(&chain, cursor).await? {
            return Err(RelayError::Store(format!(
                "watermark for {} moved behind {}",
                chain, to
            )));
        }
        metrics::record_blocks_scanned(chain.as_str(), from, to);

        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::InMemoryChain;
    use crate::store::InMemoryStore;
    use crate::types::RequestStatus;
    use alloy::primitives::{Bytes, LogData, B256, U256};

    const RECIPIENT: &str = "0x00000000000000000000000000000000000000bb";

    struct Fixture {
        chain: Arc<InMemoryChain>,
        store: Arc<InMemoryStore>,
        watcher: EventWatcher,
        sender: Address,
    }

    fn fixture(confirmations: u64, max_block_range: u64) -> Fixture {
        let chain = Arc::new(InMemoryChain::new("Ethereum", Address::repeat_byte(0x01)));
        chain.deploy_token("aUSDC", "Axelar Wrapped aUSDC", 6);
        let sender = Address::repeat_byte(0xaa);
        chain
            .give_token(sender, "aUSDC", U256::from(100_000_000u64))
            .unwrap();
        let store = Arc::new(InMemoryStore::new());
        let watcher = EventWatcher::new(
            chain.clone(),
            store.clone(),
            [(ChainId::new("Telcoin Network"), chain.gateway())],
            WatcherConfig {
                confirmations,
                max_block_range,
                start_height: 0,
            },
        );
        Fixture {
            chain,
            store,
            watcher,
            sender,
        }
    }

    fn send(f: &Fixture, dest: &str) -> B256 {
        f.chain
            .send_token(f.sender, dest, RECIPIENT, "aUSDC", U256::from(10_000_000u64))
            .unwrap()
    }

    #[tokio::test]
    async fn test_waits_for_confirmations() {
        let f = fixture(2, 10_000);
        f.chain.advance_to(99);
        send(&f, "Telcoin Network");
        assert_eq!(f.chain.height(), 100);

        let report = f.watcher.tick().await.unwrap().unwrap();
        assert_eq!((report.from, report.to, report.observed), (1, 98, 0));
        assert_eq!(f.store.counts().await.unwrap().observed, 0);

        assert!(f.watcher.tick().await.unwrap().is_none());

        f.chain.mine_blocks(2);
        let report = f.watcher.tick().await.unwrap().unwrap();
        assert_eq!((report.from, report.to, report.observed), (99, 100, 1));
        let cursor = f.store.cursor(&ChainId::new("Ethereum")).await.unwrap().unwrap();
        assert_eq!(cursor, WatermarkCursor { height: 100, log_index: Some(0) });
    }

    #[tokio::test]
    async fn test_rescan_does_not_duplicate() {
        let f = fixture(0, 10_000);
        send(&f, "Telcoin Network");
        f.watcher.tick().await.unwrap();

        // A second watcher without a cursor replays the same range
        let replay_store = Arc::new(InMemoryStore::new());
        for request in f.store.list_by_status(RequestStatus::Observed).await.unwrap() {
            replay_store.insert_if_absent(request).await.unwrap();
        }
        let replay = EventWatcher::new(
            f.chain.clone(),
            replay_store.clone(),
            [(ChainId::new("Telcoin Network"), f.chain.gateway())],
            WatcherConfig {
                confirmations: 0,
                ..WatcherConfig::default()
            },
        );
        let report = replay.tick().await.unwrap().unwrap();
        assert_eq!((report.observed, report.duplicates), (0, 1));
        assert_eq!(replay_store.counts().await.unwrap().observed, 1);
    }

    #[tokio::test]
    async fn test_malformed_event_is_skipped_and_cursor_advances() {
        let f = fixture(0, 10_000);
        f.chain.emit_log(LogData::new_unchecked(
            vec![B256::repeat_byte(0x99)],
            Bytes::from_static(&[0xde, 0xad]),
        ));
        send(&f, "Telcoin Network");

        let report = f.watcher.tick().await.unwrap().unwrap();
        assert_eq!((report.observed, report.skipped), (1, 1));
        assert_eq!(
            f.store.cursor(&ChainId::new("Ethereum")).await.unwrap().map(|c| c.height),
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_unrouted_destination_is_skipped() {
        let f = fixture(0, 10_000);
        send(&f, "Polygon");
        let report = f.watcher.tick().await.unwrap().unwrap();
        assert_eq!((report.observed, report.skipped), (0, 1));
        assert_eq!(f.store.counts().await.unwrap().observed, 0);
    }

    #[tokio::test]
    async fn test_rpc_outage_keeps_cursor() {
        let f = fixture(0, 10_000);
        send(&f, "Telcoin Network");
        f.chain.set_available(false);

        let err = f.watcher.tick().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(f.store.cursor(&ChainId::new("Ethereum")).await.unwrap(), None);

        f.chain.set_available(true);
        let report = f.watcher.tick().await.unwrap().unwrap();
        assert_eq!(report.observed, 1);
    }

    #[tokio::test]
    async fn test_scans_in_chunks() {
        let f = fixture(0, 10);
        f.chain.advance_to(25);
        let first = f.watcher.tick().await.unwrap().unwrap();
        let second = f.watcher.tick().await.unwrap().unwrap();
        let third = f.watcher.tick().await.unwrap().unwrap();
        assert_eq!((first.from, first.to), (1, 10));
        assert_eq!((second.from, second.to), (11, 20));
        assert_eq!((third.from, third.to), (21, 25));
        assert!(f.watcher.tick().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_height_skips_history() {
        let f = fixture(0, 10_000);
        send(&f, "Telcoin Network");
        f.chain.advance_to(10);
        let watcher = EventWatcher::new(
            f.chain.clone(),
            f.store.clone(),
            [(ChainId::new("Telcoin Network"), f.chain.gateway())],
            WatcherConfig {
                confirmations: 0,
                max_block_range: 10_000,
                start_height: 5,
            },
        );
        let report = watcher.tick().await.unwrap().unwrap();
        assert_eq!((report.from, report.observed), (6, 0));
    }

    #[tokio::test]
    async fn test_start_height_at_top_of_range() {
        let f = fixture(0, 10_000);
        let watcher = |start_height| {
            EventWatcher::new(
                f.chain.clone(),
                f.store.clone(),
                [(ChainId::new("Telcoin Network"), f.chain.gateway())],
                WatcherConfig {
                    confirmations: 0,
                    max_block_range: 10_000,
                    start_height,
                },
            )
        };

        // Nothing confirmed that high yet
        assert!(watcher(u64::MAX).tick().await.unwrap().is_none());

        f.chain.advance_to(u64::MAX);
        let report = watcher(u64::MAX - 2).tick().await.unwrap().unwrap();
        assert_eq!((report.from, report.to), (u64::MAX - 1, u64::MAX));
    }
}

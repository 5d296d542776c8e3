//! EVM chain client over JSON-RPC
//!
//! Reads go through the configured RPC URLs in order; a transient failure on
//! one endpoint falls through to the next. Executions are signed with the
//! relayer key and sent to the chain's own gateway.

use std::str::FromStr;
use std::time::Duration;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, TransactionReceipt};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolEvent;
use alloy::transports::http::reqwest::Url;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{eyre, WrapErr};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::ChainClient;
use crate::config::ChainConfig;
use crate::contracts::RelayGateway;
use crate::dispatch::retry::{classify_error, ErrorClass};
use crate::error::{RelayError, Result};
use crate::metrics;
use crate::types::{ChainId, Confirmation, ExecutionPayload, RawEvent, RequestId, TxHandle};

pub struct EvmChainClient {
    chain: ChainId,
    /// Gateway that executes inbound transfers
    gateway: Address,
    /// Gateways whose outbound events are watched
    watched: Vec<Address>,
    urls: Vec<Url>,
    providers: Vec<RootProvider<Http<Client>>>,
    signer: PrivateKeySigner,
    poll_interval: Duration,
}

impl EvmChainClient {
    pub fn new(
        config: &ChainConfig,
        watched: Vec<Address>,
        signer: PrivateKeySigner,
    ) -> eyre::Result<Self> {
        if config.rpc_urls.is_empty() {
            return Err(eyre!("At least one RPC URL is required for {}", config.name));
        }
        let urls = config
            .rpc_urls
            .iter()
            .map(|url| {
                Url::parse(url).wrap_err_with(|| format!("Invalid RPC URL: {}", url))
            })
            .collect::<eyre::Result<Vec<_>>>()?;
        let providers = urls
            .iter()
            .map(|url| ProviderBuilder::new().on_http(url.clone()))
            .collect();
        let gateway = Address::from_str(&config.gateway_address)
            .wrap_err_with(|| format!("Invalid gateway address for {}", config.name))?;

        Ok(Self {
            chain: ChainId::new(config.name.clone()),
            gateway,
            watched,
            urls,
            providers,
            signer,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        })
    }

    /// Build the client and verify the endpoint answers
    pub async fn connect(
        config: &ChainConfig,
        watched: Vec<Address>,
        signer: PrivateKeySigner,
    ) -> eyre::Result<Self> {
        let client = Self::new(config, watched, signer)?;
        let height = client.latest_height().await?;
        info!(
            chain = %client.chain,
            gateway = %client.gateway,
            watched = client.watched.len(),
            endpoints = client.providers.len(),
            height,
            "Chain connected"
        );
        Ok(client)
    }

    /// Map an RPC failure onto the error taxonomy and account for it
    fn rpc_failure(&self, endpoint: usize, method: &str, reason: String) -> RelayError {
        let err = match classify_error(&reason) {
            ErrorClass::Transient => RelayError::RpcUnavailable {
                chain: self.chain.clone(),
                reason,
            },
            ErrorClass::Permanent | ErrorClass::Unknown => RelayError::RpcError {
                chain: self.chain.clone(),
                reason,
            },
        };
        warn!(
            chain = %self.chain,
            endpoint,
            method,
            error = %err,
            "RPC call failed"
        );
        metrics::record_rpc_error(self.chain.as_str(), err.kind());
        err
    }

    fn no_endpoints(&self) -> RelayError {
        RelayError::RpcUnavailable {
            chain: self.chain.clone(),
            reason: "no RPC endpoint answered".to_string(),
        }
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<TransactionReceipt>> {
        let mut last = None;
        for (idx, provider) in self.providers.iter().enumerate() {
            match provider.get_transaction_receipt(tx_hash).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) => {
                    let err = self.rpc_failure(idx, "eth_getTransactionReceipt", e.to_string());
                    if !matches!(err, RelayError::RpcUnavailable { .. }) {
                        return Err(err);
                    }
                    last = Some(err);
                }
            }
        }
        Err(last.unwrap_or_else(|| self.no_endpoints()))
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    fn chain(&self) -> &ChainId {
        &self.chain
    }

    async fn latest_height(&self) -> Result<u64> {
        let mut last = None;
        for (idx, provider) in self.providers.iter().enumerate() {
            match provider.get_block_number().await {
                Ok(height) => return Ok(height),
                Err(e) => {
                    let err = self.rpc_failure(idx, "eth_blockNumber", e.to_string());
                    if !matches!(err, RelayError::RpcUnavailable { .. }) {
                        return Err(err);
                    }
                    last = Some(err);
                }
            }
        }
        Err(last.unwrap_or_else(|| self.no_endpoints()))
    }

    async fn get_events(&self, from: u64, to: u64) -> Result<Vec<RawEvent>> {
        let filter = Filter::new()
            .address(self.watched.clone())
            .event_signature(RelayGateway::TokenSent::SIGNATURE_HASH)
            .from_block(from)
            .to_block(to);

        let mut last = None;
        let mut logs = None;
        for (idx, provider) in self.providers.iter().enumerate() {
            match provider.get_logs(&filter).await {
                Ok(found) => {
                    logs = Some(found);
                    break;
                }
                Err(e) => {
                    let err = self.rpc_failure(idx, "eth_getLogs", e.to_string());
                    if !matches!(err, RelayError::RpcUnavailable { .. }) {
                        return Err(err);
                    }
                    last = Some(err);
                }
            }
        }
        let Some(logs) = logs else {
            return Err(last.unwrap_or_else(|| self.no_endpoints()));
        };

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            let (Some(height), Some(tx_hash), Some(log_index)) =
                (log.block_number, log.transaction_hash, log.log_index)
            else {
                return Err(RelayError::RpcError {
                    chain: self.chain.clone(),
                    reason: "eth_getLogs returned a log without a block position".to_string(),
                });
            };
            events.push(RawEvent {
                height,
                tx_hash,
                log_index,
                address: log.inner.address,
                log: log.inner.data,
            });
        }
        events.sort_by_key(|event| (event.height, event.log_index));
        debug!(chain = %self.chain, from, to, count = events.len(), "Fetched gateway logs");
        Ok(events)
    }

    async fn submit_transaction(&self, payload: &ExecutionPayload) -> Result<TxHandle> {
        let mut last = None;
        for (idx, url) in self.urls.iter().enumerate() {
            let wallet = EthereumWallet::from(self.signer.clone());
            let provider = ProviderBuilder::new()
                .with_recommended_fillers()
                .wallet(wallet)
                .on_http(url.clone());
            let gateway = RelayGateway::new(self.gateway, &provider);

            debug!(
                chain = %self.chain,
                request_id = %payload.request_id,
                recipient = %payload.recipient,
                asset = %payload.asset,
                amount = %payload.amount,
                "Submitting executeTokenTransfer"
            );
            let call = gateway.executeTokenTransfer(
                payload.request_id.0,
                payload.source_chain.to_string(),
                payload.sender,
                payload.recipient,
                payload.asset.clone(),
                payload.amount,
            );

            match call.send().await {
                Ok(pending) => {
                    let tx_hash = *pending.tx_hash();
                    info!(chain = %self.chain, request_id = %payload.request_id, tx_hash = %tx_hash, "Execution sent");
                    return Ok(TxHandle {
                        chain: self.chain.clone(),
                        tx_hash,
                    });
                }
                Err(e) => {
                    let err = self.rpc_failure(idx, "eth_sendRawTransaction", e.to_string());
                    if !matches!(err, RelayError::RpcUnavailable { .. }) {
                        return Err(err);
                    }
                    last = Some(err);
                }
            }
        }
        Err(last.unwrap_or_else(|| self.no_endpoints()))
    }

    async fn wait_for_confirmation(
        &self,
        tx: &TxHandle,
        min_confirmations: u64,
        timeout: Duration,
    ) -> Result<Confirmation> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.receipt(tx.tx_hash).await {
                Ok(Some(receipt)) => {
                    if !receipt.status() {
                        return Ok(Confirmation::Reverted);
                    }
                    if let Some(mined) = receipt.block_number {
                        match self.latest_height().await {
                            Ok(latest) => {
                                let confirmations = latest.saturating_sub(mined) + 1;
                                if confirmations >= min_confirmations {
                                    return Ok(Confirmation::Confirmed { height: mined });
                                }
                                debug!(tx_hash = %tx.tx_hash, confirmations, min_confirmations, "Waiting for confirmations");
                            }
                            Err(RelayError::RpcUnavailable { .. }) => {}
                            Err(e) => return Err(e),
                        }
                    }
                }
                Ok(None) => {}
                // Keep polling through endpoint outages until the deadline
                Err(RelayError::RpcUnavailable { .. }) => {}
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Confirmation::Timeout);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn is_executed(&self, id: &RequestId) -> Result<bool> {
        let mut last = None;
        for (idx, provider) in self.providers.iter().enumerate() {
            let gateway = RelayGateway::new(self.gateway, provider);
            match gateway.isCommandExecuted(id.0).call().await {
                Ok(executed) => return Ok(executed._0),
                Err(e) => {
                    let err = self.rpc_failure(idx, "isCommandExecuted", e.to_string());
                    if !matches!(err, RelayError::RpcUnavailable { .. }) {
                        return Err(err);
                    }
                    last = Some(err);
                }
            }
        }
        Err(last.unwrap_or_else(|| self.no_endpoints()))
    }
}

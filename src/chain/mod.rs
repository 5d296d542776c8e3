//! Chain access
//!
//! [`ChainClient`] is the only way the relayer touches a chain. The EVM
//! implementation talks JSON-RPC through alloy; [`memory::InMemoryChain`]
//! simulates a gateway chain for local runs and tests.

pub mod evm;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use eyre::{Result as EyreResult, WrapErr};
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::types::{ChainId, Confirmation, ExecutionPayload, RawEvent, RequestId, TxHandle};

pub use evm::EvmChainClient;
pub use memory::InMemoryChain;

#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain(&self) -> &ChainId;

    async fn latest_height(&self) -> Result<u64>;

    /// Gateway events in `[from, to]`, ordered by (height, log index)
    async fn get_events(&self, from: u64, to: u64) -> Result<Vec<RawEvent>>;

    async fn submit_transaction(&self, payload: &ExecutionPayload) -> Result<TxHandle>;

    /// Resolves once the transaction has `min_confirmations`, reverted, or
    /// `timeout` elapsed.
    async fn wait_for_confirmation(
        &self,
        tx: &TxHandle,
        min_confirmations: u64,
        timeout: Duration,
    ) -> Result<Confirmation>;

    /// Whether the destination gateway already executed this request
    async fn is_executed(&self, id: &RequestId) -> Result<bool>;
}

/// A chain as the relay loop sees it
#[derive(Clone)]
pub struct ChainHandle {
    pub client: Arc<dyn ChainClient>,
    /// Depth below the tip an event must reach before it is recorded
    pub required_confirmations: u64,
    /// Confirmations required on submitted executions
    pub execution_confirmations: u64,
    /// Initial watermark when no cursor exists
    pub start_height: u64,
}

impl ChainHandle {
    pub fn new(client: Arc<dyn ChainClient>, required_confirmations: u64) -> Self {
        Self {
            client,
            required_confirmations,
            execution_confirmations: 1,
            start_height: 0,
        }
    }

    pub fn chain(&self) -> &ChainId {
        self.client.chain()
    }
}

/// Connect every configured chain. An unreachable chain aborts startup.
pub async fn connect_all(config: &Config) -> EyreResult<Vec<ChainHandle>> {
    let signer: PrivateKeySigner = config
        .private_key
        .parse()
        .wrap_err("RELAYER_PRIVATE_KEY is not a valid secp256k1 key")?;
    info!(relayer = %signer.address(), "Relayer signer loaded");

    let mut handles = Vec::with_capacity(config.chains.len());
    for chain in &config.chains {
        let watched = config.watched_gateways(&chain.name)?;
        let client = EvmChainClient::connect(chain, watched, signer.clone())
            .await
            .wrap_err_with(|| format!("Failed to connect to chain {}", chain.name))?;

        handles.push(ChainHandle {
            client: Arc::new(client),
            required_confirmations: chain.confirmations,
            execution_confirmations: chain.execution_confirmations,
            start_height: chain.start_height,
        });
    }
    Ok(handles)
}

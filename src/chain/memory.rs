//! Simulated gateway chain
//!
//! Produces blocks on demand, holds token balances, and runs the gateway's
//! `executeTokenTransfer` semantics. Submissions can be scripted to revert,
//! time out, or land without a visible receipt, and the endpoint can be taken
//! offline. Used as the local devnet and throughout the test suite.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use alloy::primitives::{Address, LogData, B256, U256};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::ChainClient;
use crate::contracts::RelayGateway;
use crate::error::{RelayError, Result};
use crate::hash::keccak256;
use crate::types::{ChainId, Confirmation, ExecutionPayload, RawEvent, RequestId, TxHandle};

const RECEIPT_POLL: Duration = Duration::from_millis(5);

/// What happens to the next submitted execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// Mined and applied
    Confirm,
    /// Mined with a failed status
    Revert,
    /// Never mined
    Timeout,
    /// Applied on chain, but no receipt is ever returned for it
    LandsLate,
}

#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub name: String,
    pub decimals: u8,
    pub total_supply: U256,
}

#[derive(Debug, Clone, Copy)]
struct MinedTx {
    height: u64,
    success: bool,
}

#[derive(Default)]
struct ChainState {
    height: u64,
    offline: bool,
    nonce: u64,
    logs: Vec<RawEvent>,
    tokens: HashMap<String, TokenInfo>,
    balances: HashMap<(String, Address), U256>,
    executed: HashSet<RequestId>,
    receipts: HashMap<B256, MinedTx>,
    script: VecDeque<ScriptedOutcome>,
    submissions: Vec<ExecutionPayload>,
}

impl ChainState {
    fn mine(&mut self) -> u64 {
        self.height += 1;
        self.height
    }

    fn next_tx_hash(&mut self, chain: &ChainId) -> B256 {
        self.nonce += 1;
        B256::from(keccak256(format!("{}:{}", chain, self.nonce).as_bytes()))
    }

    fn push_log(&mut self, address: Address, tx_hash: B256, log: LogData) -> u64 {
        let height = self.mine();
        self.logs.push(RawEvent {
            height,
            tx_hash,
            log_index: 0,
            address,
            log,
        });
        height
    }

    /// Gateway-side execution; false means the call reverts.
    fn execute(&mut self, payload: &ExecutionPayload) -> bool {
        if self.executed.contains(&payload.request_id) {
            return false;
        }
        let Some(token) = self.tokens.get_mut(&payload.asset) else {
            return false;
        };
        token.total_supply += payload.amount;
        *self
            .balances
            .entry((payload.asset.clone(), payload.recipient))
            .or_default() += payload.amount;
        self.executed.insert(payload.request_id);
        true
    }
}

/// In-process chain with a single gateway contract
pub struct InMemoryChain {
    chain: ChainId,
    gateway: Address,
    state: Mutex<ChainState>,
}

impl InMemoryChain {
    pub fn new(chain: impl Into<ChainId>, gateway: Address) -> Self {
        Self {
            chain: chain.into(),
            gateway,
            state: Mutex::new(ChainState::default()),
        }
    }

    pub fn gateway(&self) -> Address {
        self.gateway
    }

    pub fn height(&self) -> u64 {
        self.state.lock().height
    }

    pub fn mine_blocks(&self, count: u64) -> u64 {
        let mut state = self.state.lock();
        state.height += count;
        state.height
    }

    /// Mine empty blocks until `height` is reached
    pub fn advance_to(&self, height: u64) -> u64 {
        let mut state = self.state.lock();
        state.height = state.height.max(height);
        state.height
    }

    /// Register a token on the gateway with zero supply
    pub fn deploy_token(&self, symbol: &str, name: &str, decimals: u8) {
        self.state.lock().tokens.insert(
            symbol.to_string(),
            TokenInfo {
                name: name.to_string(),
                decimals,
                total_supply: U256::ZERO,
            },
        );
    }

    pub fn token(&self, symbol: &str) -> Option<TokenInfo> {
        self.state.lock().tokens.get(symbol).cloned()
    }

    /// Mint `amount` of `symbol` to `to`
    pub fn give_token(&self, to: Address, symbol: &str, amount: U256) -> Result<()> {
        let mut state = self.state.lock();
        let Some(token) = state.tokens.get_mut(symbol) else {
            return Err(self.reverted(format!("token {} not deployed", symbol)));
        };
        token.total_supply += amount;
        *state.balances.entry((symbol.to_string(), to)).or_default() += amount;
        Ok(())
    }

    pub fn balance_of(&self, symbol: &str, owner: Address) -> U256 {
        self.state
            .lock()
            .balances
            .get(&(symbol.to_string(), owner))
            .copied()
            .unwrap_or_default()
    }

    /// `gateway.sendToken`: burns the sender's tokens and mines a block
    /// holding the `TokenSent` log. Returns the transaction hash.
    pub fn send_token(
        &self,
        sender: Address,
        destination_chain: &str,
        destination_address: &str,
        symbol: &str,
        amount: U256,
    ) -> Result<B256> {
        let mut state = self.state.lock();
        let key = (symbol.to_string(), sender);
        let balance = state.balances.get(&key).copied().unwrap_or_default();
        if balance < amount {
            return Err(self.reverted("insufficient balance".to_string()));
        }
        state.balances.insert(key, balance - amount);
        if let Some(token) = state.tokens.get_mut(symbol) {
            token.total_supply -= amount;
        }

        let log = RelayGateway::TokenSent {
            sender,
            destinationChain: destination_chain.to_string(),
            destinationAddress: destination_address.to_string(),
            symbol: symbol.to_string(),
            amount,
        }
        .encode_log_data();
        let tx_hash = state.next_tx_hash(&self.chain);
        let height = state.push_log(self.gateway, tx_hash, log);
        debug!(chain = %self.chain, height, tx = %tx_hash, "TokenSent emitted");
        Ok(tx_hash)
    }

    /// Mine a block holding an arbitrary gateway log
    pub fn emit_log(&self, log: LogData) -> B256 {
        let mut state = self.state.lock();
        let tx_hash = state.next_tx_hash(&self.chain);
        state.push_log(self.gateway, tx_hash, log);
        tx_hash
    }

    /// Take the endpoint offline (`false`) or bring it back
    pub fn set_available(&self, available: bool) {
        self.state.lock().offline = !available;
    }

    /// Queue outcomes for the next submissions; unscripted submissions confirm
    pub fn script_outcomes(&self, outcomes: impl IntoIterator<Item = ScriptedOutcome>) {
        self.state.lock().script.extend(outcomes);
    }

    /// Every payload submitted so far, in order
    pub fn submissions(&self) -> Vec<ExecutionPayload> {
        self.state.lock().submissions.clone()
    }

    fn reverted(&self, reason: String) -> RelayError {
        RelayError::RpcError {
            chain: self.chain.clone(),
            reason: format!("execution reverted: {}", reason),
        }
    }

    fn ensure_online(&self, state: &ChainState) -> Result<()> {
        if state.offline {
            return Err(RelayError::RpcUnavailable {
                chain: self.chain.clone(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChainClient for InMemoryChain {
    fn chain(&self) -> &ChainId {
        &self.chain
    }

    async fn latest_height(&self) -> Result<u64> {
        let state = self.state.lock();
        self.ensure_online(&state)?;
        Ok(state.height)
    }

    async fn get_events(&self, from: u64, to: u64) -> Result<Vec<RawEvent>> {
        let state = self.state.lock();
        self.ensure_online(&state)?;
        Ok(state
            .logs
            .iter()
            .filter(|event| event.height >= from && event.height <= to)
            .cloned()
            .collect())
    }

    async fn submit_transaction(&self, payload: &ExecutionPayload) -> Result<TxHandle> {
        let mut state = self.state.lock();
        self.ensure_online(&state)?;

        state.submissions.push(payload.clone());
        let tx_hash = state.next_tx_hash(&self.chain);
        let outcome = state.script.pop_front().unwrap_or(ScriptedOutcome::Confirm);
        match outcome {
            ScriptedOutcome::Confirm => {
                let success = state.execute(payload);
                let height = state.mine();
                state.receipts.insert(tx_hash, MinedTx { height, success });
            }
            ScriptedOutcome::Revert => {
                let height = state.mine();
                state.receipts.insert(
                    tx_hash,
                    MinedTx {
                        height,
                        success: false,
                    },
                );
            }
            ScriptedOutcome::Timeout => {}
            ScriptedOutcome::LandsLate => {
                state.execute(payload);
                state.mine();
            }
        }
        debug!(chain = %self.chain, tx = %tx_hash, ?outcome, "Execution submitted");

        Ok(TxHandle {
            chain: self.chain.clone(),
            tx_hash,
        })
    }

    async fn wait_for_confirmation(
        &self,
        tx: &TxHandle,
        min_confirmations: u64,
        timeout: Duration,
    ) -> Result<Confirmation> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let state = self.state.lock();
                self.ensure_online(&state)?;
                if let Some(mined) = state.receipts.get(&tx.tx_hash) {
                    if !mined.success {
                        return Ok(Confirmation::Reverted);
                    }
                    if state.height.saturating_sub(mined.height) + 1 >= min_confirmations {
                        return Ok(Confirmation::Confirmed {
                            height: mined.height,
                        });
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Confirmation::Timeout);
            }
            tokio::time::sleep(RECEIPT_POLL.min(deadline - now)).await;
        }
    }

    async fn is_executed(&self, id: &RequestId) -> Result<bool> {
        let state = self.state.lock();
        self.ensure_online(&state)?;
        Ok(state.executed.contains(id))
    }
}

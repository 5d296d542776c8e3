//! Hash computation for request identities
//!
//! A request is identified by where its event sits on the source chain, so
//! re-scanning the same range always yields the same id.

use alloy::primitives::B256;
use tiny_keccak::{Hasher, Keccak};

use crate::types::RequestId;

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// keccak256(u32be(len(source_chain)) ++ source_chain ++ tx_hash ++ u64be(log_index))
///
/// The length prefix keeps chain names from bleeding into the tx hash bytes.
pub fn compute_request_id(source_chain: &str, tx_hash: &B256, log_index: u64) -> RequestId {
    let name = source_chain.as_bytes();
    let mut data = Vec::with_capacity(4 + name.len() + 32 + 8);
    data.extend_from_slice(&(name.len() as u32).to_be_bytes());
    data.extend_from_slice(name);
    data.extend_from_slice(tx_hash.as_slice());
    data.extend_from_slice(&log_index.to_be_bytes());
    RequestId(B256::from(keccak256(&data)))
}

/// Convert bytes32 to a 0x-prefixed hex string
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

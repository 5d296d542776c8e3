//! Decoding of gateway `TokenSent` logs into transfer requests

use std::str::FromStr;

use alloy::primitives::Address;
use alloy::sol_types::SolEvent;
use chrono::{DateTime, Utc};

use crate::contracts::RelayGateway;
use crate::error::{RelayError, Result};
use crate::hash::compute_request_id;
use crate::types::{ChainId, RawEvent, RequestStatus, TransferRequest};

/// Decode `event` observed on `source` into a fresh `Observed` request.
///
/// Deterministic apart from `confirmed_at`, which the caller supplies.
pub fn decode_transfer(
    source: &ChainId,
    event: &RawEvent,
    confirmed_at: DateTime<Utc>,
) -> Result<TransferRequest> {
    let malformed = |reason: String| RelayError::MalformedEvent {
        chain: source.clone(),
        tx_hash: event.tx_hash,
        log_index: event.log_index,
        reason,
    };

    let sent = RelayGateway::TokenSent::decode_log_data(&event.log, true)
        .map_err(|e| malformed(format!("not a TokenSent log: {}", e)))?;

    let recipient = parse_recipient(&sent.destinationAddress).ok_or_else(|| {
        malformed(format!(
            "destination address {:?} is not a 20-byte hex address",
            sent.destinationAddress
        ))
    })?;
    if sent.destinationChain.trim().is_empty() {
        return Err(malformed("empty destination chain".to_string()));
    }
    if sent.symbol.is_empty() {
        return Err(malformed("empty token symbol".to_string()));
    }
    if sent.amount.is_zero() {
        return Err(malformed("zero amount".to_string()));
    }

    Ok(TransferRequest {
        id: compute_request_id(source.as_str(), &event.tx_hash, event.log_index),
        source_chain: source.clone(),
        dest_chain: ChainId::new(sent.destinationChain),
        source_tx: event.tx_hash,
        log_index: event.log_index,
        source_height: event.height,
        gateway: event.address,
        sender: sent.sender,
        recipient,
        asset: sent.symbol,
        amount: sent.amount,
        source_confirmed_at: confirmed_at,
        status: RequestStatus::Observed,
        attempts: 0,
        retry_after: None,
        last_error: None,
        dest_tx: None,
        updated_at: confirmed_at,
    })
}

fn parse_recipient(raw: &str) -> Option<Address> {
    let trimmed = raw.trim();
    if trimmed.len() != 42 || !trimmed.starts_with("0x") {
        return None;
    }
    Address::from_str(trimmed).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Bytes, LogData, B256, U256};

    fn event(destination_address: &str, amount: u64) -> RawEvent {
        let log = RelayGateway::TokenSent {
            sender: Address::repeat_byte(0xaa),
            destinationChain: "Telcoin Network".into(),
            destinationAddress: destination_address.into(),
            symbol: "aUSDC".into(),
            amount: U256::from(amount),
        }
        .encode_log_data();
        RawEvent {
            height: 100,
            tx_hash: B256::repeat_byte(0x42),
            log_index: 1,
            address: Address::repeat_byte(0x01),
            log,
        }
    }

    #[test]
    fn test_decode_token_sent() {
        let now = Utc::now();
        let source = ChainId::new("Ethereum");
        let request = decode_transfer(
            &source,
            &event("0x00000000000000000000000000000000000000bB", 10_000_000),
            now,
        )
        .unwrap();

        assert_eq!(request.dest_chain, ChainId::new("Telcoin Network"));
        assert_eq!(request.recipient, Address::with_last_byte(0xbb));
        assert_eq!(request.sender, Address::repeat_byte(0xaa));
        assert_eq!(request.amount, U256::from(10_000_000u64));
        assert_eq!(request.asset, "aUSDC");
        assert_eq!(request.source_height, 100);
        assert_eq!(request.status, RequestStatus::Observed);
        assert_eq!(
            request.id,
            compute_request_id("Ethereum", &B256::repeat_byte(0x42), 1)
        );
    }

    #[test]
    fn test_bad_recipient_is_malformed() {
        let err = decode_transfer(&ChainId::new("Ethereum"), &event("bob", 5), Utc::now())
            .unwrap_err();
        assert!(matches!(err, RelayError::MalformedEvent { log_index: 1, .. }));
    }

    #[test]
    fn test_zero_amount_is_malformed() {
        let err = decode_transfer(
            &ChainId::new("Ethereum"),
            &event("0x00000000000000000000000000000000000000bb", 0),
            Utc::now(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("zero amount"));
    }

    #[test]
    fn test_foreign_log_is_malformed() {
        let mut raw = event("0x00000000000000000000000000000000000000bb", 5);
        raw.log = LogData::new_unchecked(vec![B256::repeat_byte(0x99)], Bytes::from_static(&[1, 2, 3]));
        let err = decode_transfer(&ChainId::new("Ethereum"), &raw, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("not a TokenSent log"));
    }
}

//! Detects and decodes native and ERC-20 `transfer(address,uint256)` calls
//! out of a raw transaction, tolerant of truncated calldata.
//!
//! Grounded on `evm_transfer_monitor/utils/token_parser.py`'s
//! `parse_erc20_transfer`: the zero-padding and right-pad-on-truncation
//! rules below are taken from that function, not re-derived.

use alloy_primitives::{hex, Address, U256};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use evm_monitor_primitives::{ChainConfig, RawTx, Transfer};

/// The 4-byte selector for `transfer(address,uint256)`.
const TRANSFER_SELECTOR: &str = "a9059cbb";

/// Native assets on every chain this monitor supports use 18 decimals.
const NATIVE_DECIMALS: u32 = 18;

/// Minimum calldata length, in hex characters, for a decodable `transfer`
/// call: 4-byte selector + 32-byte address argument.
const MIN_HEX_LEN: usize = 72;

/// Full calldata length, in hex characters, when both arguments are intact.
const FULL_HEX_LEN: usize = 136;

/// Classifies a transaction and decodes it into a [`Transfer`] candidate.
///
/// Returns `None` for anything that isn't a native transfer with a positive
/// value or a well-formed `transfer` call to a known token contract. A
/// `None` here is never surfaced as an error (see `DecodeError` in spec §7);
/// it is simply "not a transfer this monitor cares about."
///
/// Self-transfers (`from == to`) are rejected here (invariant I5); the
/// policy filter enforces it again independently.
pub fn decode(tx: &RawTx, chain: &ChainConfig, found_at: DateTime<Utc>) -> Option<Transfer> {
    if tx.value > U256::ZERO {
        return decode_native(tx, chain, found_at);
    }
    decode_token(tx, chain, found_at)
}

fn decode_native(tx: &RawTx, chain: &ChainConfig, found_at: DateTime<Utc>) -> Option<Transfer> {
    let to = tx.to?;
    if tx.from == to {
        return None;
    }
    Some(Transfer {
        tx_hash: tx.hash,
        block_number: tx.block_number,
        block_hash: tx.block_hash,
        from: tx.from,
        to,
        asset_symbol: chain.native_symbol.clone(),
        amount: wei_to_decimal(tx.value, NATIVE_DECIMALS),
        is_native: true,
        token_contract: None,
        decimals: NATIVE_DECIMALS,
        gas_used: None,
        gas_price: tx.gas_price.map(|p| wei_to_decimal(p, NATIVE_DECIMALS)),
        fee: None,
        found_at,
    })
}

fn decode_token(tx: &RawTx, chain: &ChainConfig, found_at: DateTime<Utc>) -> Option<Transfer> {
    let contract = tx.to?;
    let token = chain.token_by_address(contract)?;

    if tx.input.is_empty() {
        return None;
    }
    let hex_data = hex::encode(&tx.input);

    if hex_data.len() < MIN_HEX_LEN {
        tracing::debug!(len = hex_data.len(), "input too short to be a transfer call");
        return None;
    }
    if !hex_data[..8].eq_ignore_ascii_case(TRANSFER_SELECTOR) {
        return None;
    }

    // Address argument is the first 32-byte word: 24 hex chars of zero
    // padding followed by the 40 hex char recipient.
    let address_param = &hex_data[8..72];
    let recipient_hex = &address_param[24..64];
    let recipient = parse_address(recipient_hex)?;

    let amount_hex = if hex_data.len() >= FULL_HEX_LEN {
        hex_data[72..FULL_HEX_LEN].to_string()
    } else if hex_data.len() > MIN_HEX_LEN {
        let mut partial = hex_data[72..].to_string();
        while partial.len() < 64 {
            partial.push('0');
        }
        partial
    } else {
        tracing::debug!("transfer call has no amount argument");
        return None;
    };

    let raw_amount = U256::from_str_radix(&amount_hex, 16).ok()?;

    if tx.from == recipient {
        return None;
    }

    Some(Transfer {
        tx_hash: tx.hash,
        block_number: tx.block_number,
        block_hash: tx.block_hash,
        from: tx.from,
        to: recipient,
        asset_symbol: token.symbol.clone(),
        amount: wei_to_decimal(raw_amount, token.decimals),
        is_native: false,
        token_contract: Some(contract),
        decimals: token.decimals,
        gas_used: None,
        gas_price: tx.gas_price.map(|p| wei_to_decimal(p, NATIVE_DECIMALS)),
        fee: None,
        found_at,
    })
}

/// Parses a 40-hex-char address argument slice, rejecting anything that
/// isn't valid hex (the `_is_valid_address` check in the source).
fn parse_address(recipient_hex: &str) -> Option<Address> {
    debug_assert_eq!(recipient_hex.len(), 40);
    let bytes = hex::decode(recipient_hex).ok()?;
    Some(Address::from_slice(&bytes))
}

/// Converts a raw integer amount to a human-scale [`BigDecimal`] by dividing
/// by `10^decimals`, matching `amount_wei / (10 ** decimals)` in the source.
fn wei_to_decimal(raw: U256, decimals: u32) -> BigDecimal {
    let raw_decimal: BigDecimal = raw.to_string().parse().expect("U256 decimal string is valid");
    let divisor = BigDecimal::new(1.into(), -(decimals as i64));
    raw_decimal / divisor
}

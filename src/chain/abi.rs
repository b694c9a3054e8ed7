//! Minimal ABI plumbing: runtime-computed selectors and topics, call-data
//! encoding for the handful of read methods the scrapers use, and word
//! decoding for their return values.

use alloy_primitives::{keccak256, Address, B256, U256};
use anyhow::{anyhow, bail, Result};
use std::sync::LazyLock;

/// Canonical ERC-721 / ERC-20 `Transfer` topic.
pub static TRANSFER_TOPIC: LazyLock<B256> =
    LazyLock::new(|| event_topic("Transfer(address,address,uint256)"));

/// First topic for an event signature.
pub fn event_topic(signature: &str) -> B256 {
    keccak256(signature.as_bytes())
}

/// Four-byte function selector for a signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Call data for a no-argument function.
pub fn encode_call0(signature: &str) -> Vec<u8> {
    selector(signature).to_vec()
}

/// Call data for a single-uint256 function, e.g. `tokenURI(uint256)`.
pub fn encode_call_u256(signature: &str, arg: U256) -> Vec<u8> {
    let mut data = selector(signature).to_vec();
    data.extend_from_slice(&arg.to_be_bytes::<32>());
    data
}

pub fn decode_u256(output: &[u8]) -> Result<U256> {
    if output.len() < 32 {
        bail!("abi output too short for uint256: {} bytes", output.len());
    }
    Ok(U256::from_be_slice(&output[..32]))
}

pub fn decode_u8(output: &[u8]) -> Result<u8> {
    let word = decode_u256(output)?;
    u8::try_from(word).map_err(|_| anyhow!("uint does not fit u8: {word}"))
}

/// Address stored right-aligned in a 32-byte word.
pub fn address_from_word(word: &B256) -> Address {
    Address::from_slice(&word[12..])
}

/// Decode a string return value. Dynamic ABI strings carry an offset and a
/// length word; some old token contracts instead return a right-padded
/// `bytes32`, which is a single word.
pub fn decode_string(output: &[u8]) -> Result<String> {
    if output.is_empty() {
        bail!("empty abi output");
    }

    if output.len() == 32 {
        let trimmed: Vec<u8> = output.iter().copied().take_while(|b| *b != 0).collect();
        return Ok(String::from_utf8_lossy(&trimmed).into_owned());
    }

    if output.len() < 64 {
        bail!("abi output too short for string: {} bytes", output.len());
    }
    let offset = usize::try_from(decode_u256(output)?)
        .map_err(|_| anyhow!("string offset out of range"))?;
    let len_word = output
        .get(offset..offset + 32)
        .ok_or_else(|| anyhow!("string length word out of bounds"))?;
    let len = usize::try_from(U256::from_be_slice(len_word))
        .map_err(|_| anyhow!("string length out of range"))?;
    let bytes = output
        .get(offset + 32..offset + 32 + len)
        .ok_or_else(|| anyhow!("string body out of bounds"))?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Lossy conversion used when normalizing raw token amounts; reference
/// prices downstream are f64 anyway.
pub fn u256_to_f64(value: U256) -> f64 {
    value.to_string().parse::<f64>().unwrap_or(f64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::b256;

    #[test]
    fn transfer_topic_matches_canonical_hash() {
        assert_eq!(
            *TRANSFER_TOPIC,
            b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef")
        );
    }

    #[test]
    fn well_known_selectors() {
        assert_eq!(selector("decimals()"), [0x31, 0x3c, 0xe5, 0x67]);
        assert_eq!(selector("symbol()"), [0x95, 0xd8, 0x9b, 0x41]);
        assert_eq!(selector("tokenURI(uint256)"), [0xc8, 0x7b, 0x56, 0xdd]);
    }

    #[test]
    fn decodes_dynamic_string() {
        let mut output = vec![0u8; 64];
        output[31] = 0x20; // offset
        output[63] = 4; // length
        output.extend_from_slice(b"WETH");
        output.extend_from_slice(&[0u8; 28]);
        assert_eq!(decode_string(&output).unwrap(), "WETH");
    }

    #[test]
    fn decodes_bytes32_string() {
        let mut word = [0u8; 32];
        word[..4].copy_from_slice(b"USDx");
        assert_eq!(decode_string(&word).unwrap(), "USDx");
    }

    #[test]
    fn encodes_token_uri_call() {
        let data = encode_call_u256("tokenURI(uint256)", U256::from(7u64));
        assert_eq!(data.len(), 36);
        assert_eq!(&data[..4], &[0xc8, 0x7b, 0x56, 0xdd]);
        assert_eq!(data[35], 7);
    }

    #[test]
    fn u256_to_f64_is_exact_for_small_values() {
        assert_eq!(u256_to_f64(U256::from(1_000_000_000_000_000_000u128)), 1e18);
    }
}

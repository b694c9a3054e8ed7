//! Wire types for the JSON-RPC chain client.
//!
//! Quantities arrive as 0x-prefixed hex strings; the `hexq` helpers parse
//! them during deserialization so the rest of the crate works with plain
//! integers.

use alloy_primitives::{Address, Bytes, B256};
use serde::Deserialize;

/// Hex-quantity deserializers for JSON-RPC number fields.
pub(crate) mod hexq {
    use serde::{Deserialize, Deserializer};

    pub fn u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let s = String::deserialize(d)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub fn u64_opt<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        match s {
            Some(s) => parse(&s).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }

    pub fn parse(s: &str) -> Result<u64, String> {
        u64::from_str_radix(s.trim_start_matches("0x"), 16)
            .map_err(|e| format!("invalid hex quantity {s:?}: {e}"))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    #[serde(deserialize_with = "hexq::u64")]
    pub block_number: u64,
    #[serde(deserialize_with = "hexq::u64")]
    pub transaction_index: u64,
    #[serde(deserialize_with = "hexq::u64")]
    pub log_index: u64,
    pub transaction_hash: B256,
    #[serde(default)]
    pub removed: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRecord {
    pub hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    /// `None` while the transaction is still pending.
    #[serde(default, deserialize_with = "hexq::u64_opt")]
    pub block_number: Option<u64>,
    #[serde(default, deserialize_with = "hexq::u64_opt")]
    pub transaction_index: Option<u64>,
    #[serde(default)]
    pub input: Bytes,
}

impl TxRecord {
    pub fn is_pending(&self) -> bool {
        self.block_number.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub transaction_hash: B256,
    pub contract_address: Option<Address>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainBlock {
    #[serde(deserialize_with = "hexq::u64")]
    pub number: u64,
    #[serde(deserialize_with = "hexq::u64")]
    pub timestamp: u64,
    #[serde(default)]
    pub transactions: Vec<TxRecord>,
}

/// Inputs of one filtered-log batch request.
#[derive(Debug, Clone)]
pub struct TxFilterCriteria {
    pub start_block_num: u64,
    /// Transactions in the start block with a lower index are dropped;
    /// the index itself is included so an interrupted tick resumes at the
    /// same transaction.
    pub start_tx_index: u64,
    /// Max blocks per filter request.
    pub limit_blocks: u64,
    /// Reorg safety margin: blocks closer to head than this are not
    /// scraped.
    pub behind_highest_block: u64,
    pub addresses: Vec<Address>,
    pub topics: Vec<B256>,
}

/// One transaction carrying at least one matching log.
#[derive(Debug, Clone)]
pub struct FilteredTx {
    pub block_num: u64,
    pub tx_index: u64,
    pub tx_hash: B256,
    pub logs: Vec<LogEntry>,
}

/// A batched filter result in ascending `(block, tx_index)` order.
#[derive(Debug, Clone, Default)]
pub struct FilterBatch {
    pub txs: Vec<FilteredTx>,
    pub num_blocks: u64,
    pub num_logs: usize,
    /// Highest block covered by this batch; the caller's next cursor is
    /// `(last_block_num + 1, 0)`.
    pub last_block_num: u64,
    /// True when the batch reached `head - behind_highest_block`.
    pub synced: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_parses_rpc_shape() {
        let raw = r#"{
            "address": "0x74312363e45dcaba76c59ec49a7aa8a65a67eed3",
            "topics": [
                "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
            ],
            "data": "0x0000000000000000000000000000000000000000000000000de0b6b3a7640000",
            "blockNumber": "0xd7b2ad",
            "transactionIndex": "0x2a",
            "logIndex": "0x5",
            "transactionHash": "0x50d7cde2b22dc166ba51c10c283ebb93f0e2bd3a2cd07af53b87a587f1a0c2d5",
            "removed": false
        }"#;
        let log: LogEntry = serde_json::from_str(raw).unwrap();
        assert_eq!(log.block_number, 0xd7b2ad);
        assert_eq!(log.transaction_index, 42);
        assert_eq!(log.data.len(), 32);
    }

    #[test]
    fn pending_tx_has_no_block_number() {
        let raw = r#"{
            "hash": "0x50d7cde2b22dc166ba51c10c283ebb93f0e2bd3a2cd07af53b87a587f1a0c2d5",
            "from": "0x0000000000000000000000000000000000000001",
            "to": null,
            "blockNumber": null,
            "transactionIndex": null,
            "input": "0x"
        }"#;
        let tx: TxRecord = serde_json::from_str(raw).unwrap();
        assert!(tx.is_pending());
        assert!(tx.to.is_none());
    }
}

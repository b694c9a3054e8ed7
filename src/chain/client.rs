//! JSON-RPC chain client.
//!
//! `ChainApi` is the seam the scrapers program against; `HttpChainClient`
//! is the production implementation over plain `eth_*` calls.

use alloy_primitives::{Address, B256};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use super::types::{hexq, ChainBlock, FilterBatch, FilteredTx, LogEntry, TxFilterCriteria, TxReceipt, TxRecord};

#[async_trait]
pub trait ChainApi: Send + Sync {
    async fn block_number(&self) -> Result<u64>;
    async fn block_by_number(&self, number: u64) -> Result<ChainBlock>;
    async fn transaction_by_hash(&self, hash: B256) -> Result<TxRecord>;
    async fn transaction_receipt(&self, hash: B256) -> Result<TxReceipt>;
    async fn logs(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[Address],
        topics: &[B256],
    ) -> Result<Vec<LogEntry>>;
    /// `eth_call`; `block` of `None` means latest state.
    async fn call(&self, to: Address, data: Vec<u8>, block: Option<u64>) -> Result<Vec<u8>>;
    async fn code_at(&self, address: Address, block: u64) -> Result<Vec<u8>>;
    async fn chain_id(&self) -> Result<u64>;
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<Value>,
}

#[derive(Clone)]
pub struct HttpChainClient {
    client: reqwest::Client,
    url: String,
}

impl HttpChainClient {
    pub fn new(url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build chain http client")?;
        Ok(Self { client, url })
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });

        let response: JsonRpcResponse = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?
            .json()
            .await
            .with_context(|| format!("parse {method} response"))?;

        if let Some(err) = response.error {
            return Err(anyhow!("{method} rpc error: {err}"));
        }
        response
            .result
            .ok_or_else(|| anyhow!("{method}: no result in rpc response"))
    }

    async fn rpc_typed<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let result = self.rpc(method, params).await?;
        if result.is_null() {
            return Err(anyhow!("{method}: null result"));
        }
        serde_json::from_value(result).with_context(|| format!("decode {method} result"))
    }

    async fn rpc_quantity(&self, method: &str, params: Value) -> Result<u64> {
        let result: String = self.rpc_typed(method, params).await?;
        hexq::parse(&result).map_err(|e| anyhow!(e))
    }

    async fn rpc_bytes(&self, method: &str, params: Value) -> Result<Vec<u8>> {
        let result: String = self.rpc_typed(method, params).await?;
        hex::decode(result.trim_start_matches("0x"))
            .with_context(|| format!("decode {method} hex output"))
    }
}

fn quantity(block: u64) -> String {
    format!("0x{block:x}")
}

#[async_trait]
impl ChainApi for HttpChainClient {
    async fn block_number(&self) -> Result<u64> {
        self.rpc_quantity("eth_blockNumber", json!([])).await
    }

    async fn block_by_number(&self, number: u64) -> Result<ChainBlock> {
        self.rpc_typed("eth_getBlockByNumber", json!([quantity(number), true]))
            .await
    }

    async fn transaction_by_hash(&self, hash: B256) -> Result<TxRecord> {
        self.rpc_typed("eth_getTransactionByHash", json!([hash])).await
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<TxReceipt> {
        self.rpc_typed("eth_getTransactionReceipt", json!([hash])).await
    }

    async fn logs(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[Address],
        topics: &[B256],
    ) -> Result<Vec<LogEntry>> {
        let mut filter = json!({
            "fromBlock": quantity(from_block),
            "toBlock": quantity(to_block),
        });
        if !addresses.is_empty() {
            filter["address"] = json!(addresses);
        }
        if !topics.is_empty() {
            // Position 0 is an OR-list over the event topics.
            filter["topics"] = json!([topics]);
        }
        self.rpc_typed("eth_getLogs", json!([filter])).await
    }

    async fn call(&self, to: Address, data: Vec<u8>, block: Option<u64>) -> Result<Vec<u8>> {
        let block = match block {
            Some(number) => quantity(number),
            None => "latest".to_string(),
        };
        let params = json!([
            { "to": to, "data": format!("0x{}", hex::encode(data)) },
            block,
        ]);
        self.rpc_bytes("eth_call", params).await
    }

    async fn code_at(&self, address: Address, block: u64) -> Result<Vec<u8>> {
        self.rpc_bytes("eth_getCode", json!([address, quantity(block)]))
            .await
    }

    async fn chain_id(&self) -> Result<u64> {
        self.rpc_quantity("eth_chainId", json!([])).await
    }
}

/// Filter one batch of matching transactions, starting at the criteria's
/// cursor and staying `behind_highest_block` behind head.
///
/// Matching logs are grouped per transaction and returned in ascending
/// `(block, tx_index)` order. Transactions in the start block below the
/// start index are dropped; the start index itself is kept so a tick that
/// died mid-transaction resumes on the same one.
pub async fn filter_trade_txs(
    chain: &dyn ChainApi,
    criteria: &TxFilterCriteria,
) -> Result<FilterBatch> {
    let head = chain.block_number().await?;
    let highest = head.saturating_sub(criteria.behind_highest_block);
    let from = criteria.start_block_num;

    if from > highest {
        // Nothing final enough to scrape yet; leave the cursor where it is.
        return Ok(FilterBatch {
            last_block_num: from.saturating_sub(1),
            synced: true,
            ..FilterBatch::default()
        });
    }

    let to = highest.min(from.saturating_add(criteria.limit_blocks));
    let logs = chain
        .logs(from, to, &criteria.addresses, &criteria.topics)
        .await?;

    let mut by_tx: BTreeMap<(u64, u64), FilteredTx> = BTreeMap::new();
    let mut num_logs = 0usize;
    for log in logs {
        if log.removed {
            continue;
        }
        if log.block_number == criteria.start_block_num
            && log.transaction_index < criteria.start_tx_index
        {
            continue;
        }
        num_logs += 1;
        by_tx
            .entry((log.block_number, log.transaction_index))
            .or_insert_with(|| FilteredTx {
                block_num: log.block_number,
                tx_index: log.transaction_index,
                tx_hash: log.transaction_hash,
                logs: Vec::new(),
            })
            .logs
            .push(log);
    }

    let batch = FilterBatch {
        txs: by_tx.into_values().collect(),
        num_blocks: to - from + 1,
        num_logs,
        last_block_num: to,
        synced: to == highest,
    };
    debug!(
        from,
        to,
        txs = batch.txs.len(),
        logs = batch.num_logs,
        synced = batch.synced,
        "filtered trade transactions"
    );
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Bytes, U256};
    use parking_lot::Mutex;

    /// Chain stub: a fixed head plus canned logs.
    struct StubChain {
        head: u64,
        logs: Mutex<Vec<LogEntry>>,
    }

    fn log(block: u64, tx_index: u64, log_index: u64) -> LogEntry {
        LogEntry {
            address: Address::ZERO,
            topics: vec![B256::ZERO],
            data: Bytes::new(),
            block_number: block,
            transaction_index: tx_index,
            log_index,
            transaction_hash: B256::from(U256::from(block * 1000 + tx_index)),
            removed: false,
        }
    }

    #[async_trait]
    impl ChainApi for StubChain {
        async fn block_number(&self) -> Result<u64> {
            Ok(self.head)
        }
        async fn block_by_number(&self, _n: u64) -> Result<ChainBlock> {
            unimplemented!()
        }
        async fn transaction_by_hash(&self, _h: B256) -> Result<TxRecord> {
            unimplemented!()
        }
        async fn transaction_receipt(&self, _h: B256) -> Result<TxReceipt> {
            unimplemented!()
        }
        async fn logs(
            &self,
            from: u64,
            to: u64,
            _addresses: &[Address],
            _topics: &[B256],
        ) -> Result<Vec<LogEntry>> {
            Ok(self
                .logs
                .lock()
                .iter()
                .filter(|l| l.block_number >= from && l.block_number <= to)
                .cloned()
                .collect())
        }
        async fn call(&self, _to: Address, _data: Vec<u8>, _b: Option<u64>) -> Result<Vec<u8>> {
            unimplemented!()
        }
        async fn code_at(&self, _a: Address, _b: u64) -> Result<Vec<u8>> {
            unimplemented!()
        }
        async fn chain_id(&self) -> Result<u64> {
            Ok(1)
        }
    }

    fn criteria(start_block: u64, start_tx: u64) -> TxFilterCriteria {
        TxFilterCriteria {
            start_block_num: start_block,
            start_tx_index: start_tx,
            limit_blocks: 5000,
            behind_highest_block: 10,
            addresses: vec![],
            topics: vec![],
        }
    }

    #[tokio::test]
    async fn empty_batch_reports_covered_range() {
        let chain = StubChain {
            head: 200,
            logs: Mutex::new(vec![]),
        };
        let batch = filter_trade_txs(&chain, &criteria(100, 0)).await.unwrap();
        assert!(batch.txs.is_empty());
        assert_eq!(batch.last_block_num, 190);
        assert!(batch.synced);
        assert_eq!(batch.num_blocks, 91);
    }

    #[tokio::test]
    async fn cursor_ahead_of_safe_head_yields_no_progress() {
        let chain = StubChain {
            head: 200,
            logs: Mutex::new(vec![log(195, 0, 0)]),
        };
        let batch = filter_trade_txs(&chain, &criteria(195, 0)).await.unwrap();
        assert!(batch.txs.is_empty());
        // next cursor = last_block_num + 1 = unchanged start
        assert_eq!(batch.last_block_num, 194);
    }

    #[tokio::test]
    async fn groups_logs_per_tx_in_cursor_order() {
        let chain = StubChain {
            head: 200,
            logs: Mutex::new(vec![
                log(120, 3, 7),
                log(110, 4, 1),
                log(110, 4, 2),
                log(110, 9, 3),
            ]),
        };
        let batch = filter_trade_txs(&chain, &criteria(100, 0)).await.unwrap();
        let keys: Vec<(u64, u64)> = batch.txs.iter().map(|t| (t.block_num, t.tx_index)).collect();
        assert_eq!(keys, vec![(110, 4), (110, 9), (120, 3)]);
        assert_eq!(batch.txs[0].logs.len(), 2);
        assert_eq!(batch.num_logs, 4);
    }

    #[tokio::test]
    async fn start_tx_index_drops_earlier_txs_only_in_start_block() {
        let chain = StubChain {
            head: 200,
            logs: Mutex::new(vec![log(100, 1, 0), log(100, 5, 1), log(101, 0, 2)]),
        };
        let batch = filter_trade_txs(&chain, &criteria(100, 5)).await.unwrap();
        let keys: Vec<(u64, u64)> = batch.txs.iter().map(|t| (t.block_num, t.tx_index)).collect();
        // index 5 itself is kept: an interrupted tick resumes on it
        assert_eq!(keys, vec![(100, 5), (101, 0)]);
    }
}

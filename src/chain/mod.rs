//! EVM chain access: JSON-RPC client, ABI helpers, filtered-log batching,
//! and live log subscriptions.

pub mod abi;
pub mod client;
pub mod subscribe;
pub mod types;

pub use client::{filter_trade_txs, ChainApi, HttpChainClient};
pub use types::{ChainBlock, FilterBatch, FilteredTx, LogEntry, TxFilterCriteria, TxReceipt, TxRecord};

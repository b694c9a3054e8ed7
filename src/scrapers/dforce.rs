//! Dforce exchange scraper.
//!
//! Watches the exchange contract's `Swap` event. Token metadata is cached
//! per address; the cache is warmed by replaying a lookback window of
//! historical swaps before the live stream starts. Only swaps whose pair
//! has been subscribed are emitted.

use alloy_primitives::{address, Address, B256, U256};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{PairHandle, Scraper, ScraperCore, TRADE_CHANNEL_CAP};
use crate::chain::{abi, subscribe, ChainApi, LogEntry};
use crate::error::ScraperError;
use crate::types::{Asset, ExchangePair, Trade, ETHEREUM};
use async_trait::async_trait;
use chrono::Utc;

pub const DFORCE_EXCHANGE: &str = "Dforce";

/// Cache-warm window: roughly 20 days of blocks.
const TOKEN_LOOKBACK_BLOCKS: u64 = 6 * 60 * 24 * 20;
/// Trade backfill replayed before going live.
const TRADE_LOOKBACK_BLOCKS: u64 = 25_250;

static SWAP_TOPIC: LazyLock<B256> =
    LazyLock::new(|| abi::event_topic("Swap(address,address,uint256,uint256)"));

#[derive(Debug, Clone, PartialEq)]
struct RawSwap {
    input: Address,
    output: Address,
    input_amount: U256,
    output_amount: U256,
}

pub struct DforceScraper {
    core: Arc<ScraperCore<Trade>>,
    chain: Arc<dyn ChainApi>,
    ws_url: String,
    contract: Address,
    tokens: RwLock<HashMap<Address, Asset>>,
    pair_scrapers: RwLock<HashMap<String, ExchangePair>>,
}

impl DforceScraper {
    pub fn new(chain: Arc<dyn ChainApi>, ws_url: String, contract: Address) -> Arc<Self> {
        let (core, trade_tx) = ScraperCore::new(DFORCE_EXCHANGE, TRADE_CHANNEL_CAP);
        let scraper = Arc::new(Self {
            core,
            chain,
            ws_url,
            contract,
            tokens: RwLock::new(HashMap::new()),
            pair_scrapers: RwLock::new(HashMap::new()),
        });

        // The USDx symbol() returns bytes32 on-chain, seed it by hand so the
        // string decode path never sees it.
        scraper.tokens.write().insert(
            address!("eb269732ab75A6fD61Ea60b06fE994cD32a83549"),
            Asset {
                symbol: "USDx".into(),
                name: "dForce USDx".into(),
                address: "0xeb269732ab75A6fD61Ea60b06fE994cD32a83549".into(),
                blockchain: ETHEREUM.into(),
                decimals: 18,
            },
        );

        let producer = scraper.clone();
        tokio::spawn(async move { producer.main_loop(trade_tx).await });
        scraper
    }

    async fn main_loop(self: Arc<Self>, trade_tx: mpsc::Sender<Trade>) {
        let mut shutdown = self.core.shutdown_rx();
        let (sink_tx, mut sink_rx) = mpsc::channel::<LogEntry>(TRADE_CHANNEL_CAP);
        let (resubscribe_tx, mut resubscribe_rx) = mpsc::channel::<()>(4);

        if let Err(err) = self.warm_token_cache().await {
            warn!(error = %err, "token cache warm-up failed");
        }

        match subscribe::fetch_lookback(
            self.chain.as_ref(),
            TRADE_LOOKBACK_BLOCKS,
            &[self.contract],
            &[*SWAP_TOPIC],
        )
        .await
        {
            Ok(logs) => {
                for log in logs {
                    if let Err(ScraperError::ShutdownRequested) =
                        self.process_swap(&log, &trade_tx).await
                    {
                        self.core.cleanup(None);
                        return;
                    }
                }
            }
            Err(err) => warn!(error = %err, "dforce trade backfill failed"),
        }

        self.spawn_subscription(sink_tx.clone(), resubscribe_tx.clone());

        let exit_err = loop {
            tokio::select! {
                biased;
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break None,
                log = sink_rx.recv() => {
                    let Some(log) = log else {
                        break Some(ScraperError::Fatal("subscription sink closed".into()));
                    };
                    if let Err(ScraperError::ShutdownRequested) =
                        self.process_swap(&log, &trade_tx).await
                    {
                        break None;
                    }
                }
                signal = resubscribe_rx.recv() => {
                    if signal.is_some() && !self.core.closed() {
                        info!("resubscribing to swap events");
                        self.spawn_subscription(sink_tx.clone(), resubscribe_tx.clone());
                    }
                }
            }
        };

        self.core.cleanup(exit_err);
        drop(trade_tx);
    }

    fn spawn_subscription(&self, sink_tx: mpsc::Sender<LogEntry>, resubscribe_tx: mpsc::Sender<()>) {
        let ws_url = self.ws_url.clone();
        let contract = self.contract;
        let mut shutdown = self.core.shutdown_rx();
        tokio::spawn(async move {
            let result =
                subscribe::stream_logs(&ws_url, &[contract], &[*SWAP_TOPIC], &sink_tx, &mut shutdown)
                    .await;
            if let Err(err) = result {
                error!(error = %err, "swap subscription failed");
                let _ = resubscribe_tx.send(()).await;
            }
        });
    }

    /// Replay old swaps so the token cache covers every pair that traded
    /// in the lookback window.
    async fn warm_token_cache(&self) -> Result<()> {
        let logs = subscribe::fetch_lookback(
            self.chain.as_ref(),
            TOKEN_LOOKBACK_BLOCKS,
            &[self.contract],
            &[*SWAP_TOPIC],
        )
        .await?;

        for log in &logs {
            let Some(swap) = decode_swap(log) else {
                continue;
            };
            let input = self.load_token_data(swap.input).await;
            let output = self.load_token_data(swap.output).await;
            if let (Ok(input), Ok(output)) = (input, output) {
                debug!(
                    input = %input.symbol,
                    output = %output.symbol,
                    "warmed token pair"
                );
            }
        }
        info!(tokens = self.tokens.read().len(), "token cache warmed");
        Ok(())
    }

    async fn load_token_data(&self, token: Address) -> Result<Asset> {
        if let Some(asset) = self.tokens.read().get(&token) {
            return Ok(asset.clone());
        }

        let symbol_raw = self
            .chain
            .call(token, abi::encode_call0("symbol()"), None)
            .await
            .context("read token symbol")?;
        let symbol = abi::decode_string(&symbol_raw)?;

        let decimals_raw = self
            .chain
            .call(token, abi::encode_call0("decimals()"), None)
            .await
            .context("read token decimals")?;
        let decimals = abi::decode_u8(&decimals_raw)?;

        let name_raw = self
            .chain
            .call(token, abi::encode_call0("name()"), None)
            .await
            .context("read token name")?;
        let name = abi::decode_string(&name_raw)?;

        let asset = Asset {
            symbol,
            name,
            address: format!("{token:#x}"),
            blockchain: ETHEREUM.to_string(),
            decimals,
        };
        self.tokens.write().insert(token, asset.clone());
        Ok(asset)
    }

    async fn process_swap(
        &self,
        log: &LogEntry,
        trade_tx: &mpsc::Sender<Trade>,
    ) -> Result<(), ScraperError> {
        let Some(swap) = decode_swap(log) else {
            warn!(tx = %log.transaction_hash, "malformed swap log");
            return Ok(());
        };

        let buy_token = match self.load_token_data(swap.output).await {
            Ok(asset) => asset,
            Err(err) => {
                error!(token = %swap.output, error = %err, "error loading buy token");
                return Ok(());
            }
        };
        let sell_token = match self.load_token_data(swap.input).await {
            Ok(asset) => asset,
            Err(err) => {
                error!(token = %swap.input, error = %err, "error loading sell token");
                return Ok(());
            }
        };

        let (symbol, foreign_name, volume, price) =
            swap_data(&buy_token, &sell_token, swap.input_amount, swap.output_amount);

        // Emit only for pairs somebody registered interest in.
        let Some(pair) = self.pair_scrapers.read().get(&foreign_name).cloned() else {
            return Ok(());
        };

        let trade = Trade {
            symbol,
            pair: pair.foreign_name.clone(),
            price,
            volume,
            time: Utc::now(),
            foreign_trade_id: String::new(),
            source: DFORCE_EXCHANGE.to_string(),
            base_token: sell_token,
            quote_token: buy_token,
            verified_pair: true,
        };
        info!(pair = %trade.pair, price = trade.price, "got trade");
        self.core.send_or_shutdown(trade_tx, trade).await
    }
}

fn decode_swap(log: &LogEntry) -> Option<RawSwap> {
    if log.topics.first() != Some(&*SWAP_TOPIC) || log.data.len() < 128 {
        return None;
    }
    Some(RawSwap {
        input: abi::address_from_word(&B256::from_slice(&log.data[0..32])),
        output: abi::address_from_word(&B256::from_slice(&log.data[32..64])),
        input_amount: U256::from_be_slice(&log.data[64..96]),
        output_amount: U256::from_be_slice(&log.data[96..128]),
    })
}

/// Volume is the bought amount; price is sold-per-bought.
fn swap_data(
    buy_token: &Asset,
    sell_token: &Asset,
    input_amount: U256,
    output_amount: U256,
) -> (String, String, f64, f64) {
    let amount_out =
        abi::u256_to_f64(output_amount) / 10f64.powi(buy_token.decimals as i32);
    let amount_in =
        abi::u256_to_f64(input_amount) / 10f64.powi(sell_token.decimals as i32);

    let volume = amount_out;
    let price = amount_in / amount_out;
    let foreign_name = format!("{}-{}", buy_token.symbol, sell_token.symbol);
    (buy_token.symbol.clone(), foreign_name, volume, price)
}

#[async_trait]
impl Scraper for DforceScraper {
    fn exchange(&self) -> &str {
        DFORCE_EXCHANGE
    }

    async fn subscribe(&self, pair: ExchangePair) -> Result<PairHandle, ScraperError> {
        self.core.check_running()?;
        self.pair_scrapers
            .write()
            .insert(pair.foreign_name.clone(), pair.clone());
        Ok(PairHandle::new(pair, self.core.clone()))
    }

    /// Every ordered combination of cached tokens.
    async fn fetch_available_pairs(&self) -> Result<Vec<ExchangePair>, ScraperError> {
        let tokens: Vec<Asset> = self.tokens.read().values().cloned().collect();
        let mut seen = std::collections::HashSet::new();
        let mut pairs = Vec::new();
        for first in &tokens {
            for second in &tokens {
                if first.symbol == second.symbol {
                    continue;
                }
                for (a, b) in [(first, second), (second, first)] {
                    let foreign_name = format!("{}-{}", a.symbol, b.symbol);
                    if seen.insert(foreign_name.clone()) {
                        pairs.push(ExchangePair {
                            symbol: a.symbol.clone(),
                            foreign_name,
                            exchange: DFORCE_EXCHANGE.to_string(),
                            ..ExchangePair::default()
                        });
                    }
                }
            }
        }
        Ok(pairs)
    }

    fn normalize_pair(&self, pair: ExchangePair) -> Result<ExchangePair, ScraperError> {
        Ok(pair)
    }

    fn take_trade_channel(&self) -> Option<mpsc::Receiver<Trade>> {
        self.core.take_trade_channel()
    }

    fn error(&self) -> Option<ScraperError> {
        self.core.error()
    }

    async fn close(&self) -> Result<(), ScraperError> {
        self.core.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Bytes;

    fn token(symbol: &str, decimals: u8) -> Asset {
        Asset {
            symbol: symbol.into(),
            name: symbol.into(),
            address: String::new(),
            blockchain: ETHEREUM.into(),
            decimals,
        }
    }

    #[test]
    fn swap_data_normalizes_by_decimals() {
        // sell 300 USDx (18 decimals) for 0.1 WBTC (8 decimals)
        let buy = token("WBTC", 8);
        let sell = token("USDx", 18);
        let input = U256::from(300u64) * U256::from(10u64).pow(U256::from(18u64));
        let output = U256::from(10_000_000u64); // 0.1 * 1e8

        let (symbol, foreign_name, volume, price) = swap_data(&buy, &sell, input, output);
        assert_eq!(symbol, "WBTC");
        assert_eq!(foreign_name, "WBTC-USDx");
        assert_eq!(volume, 0.1);
        assert_eq!(price, 3000.0);
    }

    #[test]
    fn decodes_swap_log() {
        let input = address!("1111111111111111111111111111111111111111");
        let output = address!("2222222222222222222222222222222222222222");
        let mut data = Vec::new();
        data.extend_from_slice(&input.into_word().0);
        data.extend_from_slice(&output.into_word().0);
        data.extend_from_slice(&U256::from(500u64).to_be_bytes::<32>());
        data.extend_from_slice(&U256::from(700u64).to_be_bytes::<32>());

        let log = LogEntry {
            address: Address::ZERO,
            topics: vec![*SWAP_TOPIC],
            data: Bytes::from(data),
            block_number: 5,
            transaction_index: 0,
            log_index: 0,
            transaction_hash: B256::ZERO,
            removed: false,
        };
        let swap = decode_swap(&log).unwrap();
        assert_eq!(swap.input, input);
        assert_eq!(swap.output, output);
        assert_eq!(swap.input_amount, U256::from(500u64));
        assert_eq!(swap.output_amount, U256::from(700u64));
    }

    #[test]
    fn short_data_is_rejected() {
        let log = LogEntry {
            address: Address::ZERO,
            topics: vec![*SWAP_TOPIC],
            data: Bytes::from(vec![0u8; 64]),
            block_number: 5,
            transaction_index: 0,
            log_index: 0,
            transaction_hash: B256::ZERO,
            removed: false,
        };
        assert!(decode_swap(&log).is_none());
    }
}

//! Bancor network scraper.
//!
//! Watches the network contract's `Conversion` event over a websocket log
//! subscription (with a short REST backfill window), reorients each swap so
//! the canonical quote token sits on the `to` side, and normalizes amounts
//! by on-chain token decimals. Available pairs come from the public pool
//! registry, dispatching on each pool's declared converter type to read its
//! two connector tokens.

use alloy_primitives::{address, Address, B256, U256};
use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::{PairHandle, Scraper, ScraperCore, TRADE_CHANNEL_CAP};
use crate::chain::{abi, subscribe, ChainApi, LogEntry};
use crate::error::ScraperError;
use crate::types::{
    Asset, ExchangePair, Pair, Trade, ETHEREUM, PSEUDO_NATIVE_ADDR, WRAPPED_NATIVE_ADDR,
};
use async_trait::async_trait;
use chrono::Utc;

pub const BANCOR_EXCHANGE: &str = "Bancor";
const BANCOR_POOLS_URL: &str = "https://api-v2.bancor.network/pools";

const BANCOR_NETWORK_CONTRACT: Address = address!("2F9EC37d6CcFFf1caB21733BdaDEdE11c823cCB0");
/// Network token; swaps involving it are reoriented so pairs read XXX-BNT.
const BNT_TOKEN: Address = address!("1F573D6Fb3F13d689FF844B4cE37794d79a7FF1C");
const PSEUDO_NATIVE: Address = address!("EeeeeEeeeEeEeeEeEeEeeEEEeeeeEeeeeeeeEEeE");
const WRAPPED_NATIVE: Address = address!("C02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2");

/// Blocks replayed through the REST client before the live stream starts.
const LOOKBACK_BLOCKS: u64 = 250;

static CONVERSION_TOPIC: LazyLock<B256> = LazyLock::new(|| {
    abi::event_topic("Conversion(address,address,address,uint256,uint256,address)")
});

/// A decoded `Conversion` log.
#[derive(Debug, Clone, PartialEq)]
struct RawConversion {
    from_token: Address,
    to_token: Address,
    from_amount: U256,
    to_amount: U256,
    tx_hash: B256,
}

/// A conversion with amounts scaled down by token decimals.
#[derive(Debug, Clone)]
struct BancorSwap {
    pair: ExchangePair,
    from_amount: f64,
    to_amount: f64,
    id: String,
}

/// Registry pools declare a converter version; all versions expose the same
/// connector-token reads, the tag only gates which pools are handled.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ConverterType {
    Zero,
    One,
    Three,
    Four,
}

impl ConverterType {
    fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Zero),
            1 => Some(Self::One),
            3 => Some(Self::Three),
            4 => Some(Self::Four),
            _ => None,
        }
    }

    async fn read_connector_tokens(
        self,
        chain: &dyn ChainApi,
        converter: Address,
    ) -> Result<Vec<Address>> {
        let count_raw = chain
            .call(converter, abi::encode_call0("connectorTokenCount()"), None)
            .await?;
        let count = abi::decode_u256(&count_raw)?;
        if count != U256::from(2u64) {
            return Ok(Vec::new());
        }

        let mut tokens = Vec::with_capacity(2);
        for index in [1u64, 0u64] {
            let raw = chain
                .call(
                    converter,
                    abi::encode_call_u256("connectorTokens(uint256)", U256::from(index)),
                    None,
                )
                .await?;
            if raw.len() < 32 {
                return Err(anyhow!("short connectorTokens output"));
            }
            tokens.push(Address::from_slice(&raw[12..32]));
        }
        Ok(tokens)
    }
}

#[derive(Debug, Deserialize)]
struct BancorPools {
    data: Vec<BancorPool>,
}

#[derive(Debug, Deserialize)]
struct BancorPool {
    #[serde(rename = "type")]
    pool_type: i64,
    #[serde(default)]
    symbol: String,
    #[serde(rename = "converter_dlt_id")]
    converter_dlt_id: String,
}

pub struct BancorScraper {
    core: Arc<ScraperCore<Trade>>,
    chain: Arc<dyn ChainApi>,
    ws_url: String,
    http: reqwest::Client,
    canonical_quote: Address,
    pair_scrapers: RwLock<HashMap<String, ExchangePair>>,
}

impl BancorScraper {
    pub fn new(chain: Arc<dyn ChainApi>, ws_url: String) -> Arc<Self> {
        let (core, trade_tx) = ScraperCore::new(BANCOR_EXCHANGE, TRADE_CHANNEL_CAP);
        let scraper = Arc::new(Self {
            core,
            chain,
            ws_url,
            http: reqwest::Client::new(),
            canonical_quote: BNT_TOKEN,
            pair_scrapers: RwLock::new(HashMap::new()),
        });

        let producer = scraper.clone();
        tokio::spawn(async move { producer.main_loop(trade_tx).await });
        scraper
    }

    async fn main_loop(self: Arc<Self>, trade_tx: mpsc::Sender<Trade>) {
        let mut shutdown = self.core.shutdown_rx();
        let (sink_tx, mut sink_rx) = mpsc::channel::<LogEntry>(TRADE_CHANNEL_CAP);
        let (resubscribe_tx, mut resubscribe_rx) = mpsc::channel::<()>(4);

        // Replay the recent window before going live.
        match subscribe::fetch_lookback(
            self.chain.as_ref(),
            LOOKBACK_BLOCKS,
            &[BANCOR_NETWORK_CONTRACT],
            &[*CONVERSION_TOPIC],
        )
        .await
        {
            Ok(logs) => {
                for log in logs {
                    if let Err(ScraperError::ShutdownRequested) =
                        self.process_conversion(&log, &trade_tx).await
                    {
                        self.core.cleanup(None);
                        return;
                    }
                }
            }
            Err(err) => warn!(error = %err, "bancor lookback replay failed"),
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
                        self.process_conversion(&log, &trade_tx).await
                    {
                        break None;
                    }
                }
                signal = resubscribe_rx.recv() => {
                    if signal.is_some() && !self.core.closed() {
                        info!("resubscribing to conversion events");
                        self.spawn_subscription(sink_tx.clone(), resubscribe_tx.clone());
                    }
                }
            }
        };

        self.core.cleanup(exit_err);
        drop(trade_tx);
    }

    /// Reader task: one websocket connection. On failure it enqueues a
    /// resubscribe signal for the supervisor select above.
    fn spawn_subscription(&self, sink_tx: mpsc::Sender<LogEntry>, resubscribe_tx: mpsc::Sender<()>) {
        let ws_url = self.ws_url.clone();
        let mut shutdown = self.core.shutdown_rx();
        tokio::spawn(async move {
            let result = subscribe::stream_logs(
                &ws_url,
                &[BANCOR_NETWORK_CONTRACT],
                &[*CONVERSION_TOPIC],
                &sink_tx,
                &mut shutdown,
            )
            .await;
            if let Err(err) = result {
                error!(error = %err, "conversion subscription failed");
                let _ = resubscribe_tx.send(()).await;
            }
        });
    }

    async fn process_conversion(
        &self,
        log: &LogEntry,
        trade_tx: &mpsc::Sender<Trade>,
    ) -> Result<(), ScraperError> {
        let Some(raw) = decode_conversion(log) else {
            warn!(tx = %log.transaction_hash, "malformed conversion log");
            return Ok(());
        };
        let raw = reorient_swap(raw, self.canonical_quote);

        let swap = match self.normalize_swap(&raw).await {
            Ok(swap) => swap,
            Err(err) => {
                error!(tx = %raw.tx_hash, error = %err, "error normalizing swap");
                return Ok(());
            }
        };

        let (price, volume) = swap_price_volume(&swap);
        if !price.is_finite() || price <= 0.0 {
            warn!(tx = %swap.id, price, "dropping conversion with degenerate price");
            return Ok(());
        }

        let trade = Trade {
            symbol: swap.pair.symbol.clone(),
            pair: swap.pair.foreign_name.clone(),
            price,
            volume,
            time: Utc::now(),
            foreign_trade_id: swap.id.clone(),
            source: BANCOR_EXCHANGE.to_string(),
            base_token: swap.pair.underlying_pair.base_token.clone(),
            quote_token: swap.pair.underlying_pair.quote_token.clone(),
            verified_pair: true,
        };
        info!(pair = %trade.pair, price = trade.price, "got trade");
        self.core.send_or_shutdown(trade_tx, trade).await
    }

    async fn normalize_swap(&self, raw: &RawConversion) -> Result<BancorSwap> {
        let from_amount =
            abi::u256_to_f64(raw.from_amount) / 10f64.powi(self.token_decimals(raw.from_token).await? as i32);
        let to_amount =
            abi::u256_to_f64(raw.to_amount) / 10f64.powi(self.token_decimals(raw.to_token).await? as i32);

        let pair = self.read_pair(raw.from_token, raw.to_token).await?;
        Ok(BancorSwap {
            pair,
            from_amount,
            to_amount,
            id: format!("{:#x}", raw.tx_hash),
        })
    }

    async fn token_decimals(&self, token: Address) -> Result<u8> {
        if token == PSEUDO_NATIVE {
            return Ok(18);
        }
        let raw = self
            .chain
            .call(token, abi::encode_call0("decimals()"), None)
            .await
            .context("read token decimals")?;
        abi::decode_u8(&raw)
    }

    async fn token_symbol(&self, token: Address) -> Result<(Address, String)> {
        if token == PSEUDO_NATIVE {
            return Ok((WRAPPED_NATIVE, "WETH".to_string()));
        }
        let raw = self
            .chain
            .call(token, abi::encode_call0("symbol()"), None)
            .await
            .context("read token symbol")?;
        Ok((token, abi::decode_string(&raw)?))
    }

    /// Resolve both sides on-chain into an `ExchangePair`; the first
    /// address is the quote (from) side, the second the base (to) side.
    async fn read_pair(&self, quote: Address, base: Address) -> Result<ExchangePair> {
        let (quote_addr, quote_symbol) = self.token_symbol(quote).await?;
        let (base_addr, base_symbol) = self.token_symbol(base).await?;

        let quote_token = Asset {
            symbol: quote_symbol.clone(),
            address: format!("{quote_addr:#x}"),
            blockchain: ETHEREUM.to_string(),
            ..Asset::default()
        };
        let base_token = Asset {
            symbol: base_symbol.clone(),
            address: format!("{base_addr:#x}"),
            blockchain: ETHEREUM.to_string(),
            ..Asset::default()
        };

        Ok(ExchangePair {
            foreign_name: format!("{quote_symbol}-{base_symbol}"),
            symbol: quote_symbol,
            exchange: BANCOR_EXCHANGE.to_string(),
            verified: false,
            underlying_pair: Pair {
                base_token,
                quote_token,
            },
        })
    }
}

fn decode_conversion(log: &LogEntry) -> Option<RawConversion> {
    if log.topics.len() != 4 || log.topics[0] != *CONVERSION_TOPIC || log.data.len() < 64 {
        return None;
    }
    Some(RawConversion {
        from_token: abi::address_from_word(&log.topics[2]),
        to_token: abi::address_from_word(&log.topics[3]),
        from_amount: U256::from_be_slice(&log.data[0..32]),
        to_amount: U256::from_be_slice(&log.data[32..64]),
        tx_hash: log.transaction_hash,
    })
}

/// Flip a swap that spends the canonical quote token so the pair always
/// reads XXX-<quote>.
fn reorient_swap(raw: RawConversion, canonical_quote: Address) -> RawConversion {
    if raw.from_token != canonical_quote {
        return raw;
    }
    RawConversion {
        from_token: raw.to_token,
        to_token: raw.from_token,
        from_amount: raw.to_amount,
        to_amount: raw.from_amount,
        tx_hash: raw.tx_hash,
    }
}

/// Price convention: quote per unit spent; volume is the spent amount.
fn swap_price_volume(swap: &BancorSwap) -> (f64, f64) {
    (swap.to_amount / swap.from_amount, swap.from_amount)
}

#[async_trait]
impl Scraper for BancorScraper {
    fn exchange(&self) -> &str {
        BANCOR_EXCHANGE
    }

    async fn subscribe(&self, pair: ExchangePair) -> Result<PairHandle, ScraperError> {
        self.core.check_running()?;
        self.pair_scrapers
            .write()
            .insert(pair.foreign_name.clone(), pair.clone());
        Ok(PairHandle::new(pair, self.core.clone()))
    }

    async fn fetch_available_pairs(&self) -> Result<Vec<ExchangePair>, ScraperError> {
        let pools: BancorPools = self
            .http
            .get(BANCOR_POOLS_URL)
            .send()
            .await
            .map_err(ScraperError::transient)?
            .json()
            .await
            .map_err(ScraperError::transient)?;

        let mut pairs = Vec::new();
        for pool in &pools.data {
            let Some(converter_type) = ConverterType::from_code(pool.pool_type) else {
                warn!(pool = %pool.symbol, pool_type = pool.pool_type, "unknown converter type");
                continue;
            };
            let Ok(converter) = pool.converter_dlt_id.parse::<Address>() else {
                warn!(pool = %pool.symbol, "bad converter address");
                continue;
            };

            let tokens = match converter_type
                .read_connector_tokens(self.chain.as_ref(), converter)
                .await
            {
                Ok(tokens) => tokens,
                Err(err) => {
                    error!(pool = %pool.symbol, error = %err, "error reading connector tokens");
                    continue;
                }
            };
            if tokens.len() != 2 {
                continue;
            }

            match self.read_pair(tokens[0], tokens[1]).await {
                Ok(pair) => {
                    if !pair.symbol.is_empty()
                        && pair.foreign_name.split('-').nth(1).is_some_and(|s| !s.is_empty())
                    {
                        info!(pair = %pair.foreign_name, "found pair");
                        pairs.push(pair);
                    }
                }
                Err(err) => error!(pool = %pool.symbol, error = %err, "error resolving pool pair"),
            }
        }
        Ok(pairs)
    }

    fn normalize_pair(&self, mut pair: ExchangePair) -> Result<ExchangePair, ScraperError> {
        if pair.underlying_pair.base_token.address == PSEUDO_NATIVE_ADDR {
            pair.underlying_pair.base_token.address = WRAPPED_NATIVE_ADDR.to_string();
        }
        if pair.underlying_pair.quote_token.address == PSEUDO_NATIVE_ADDR {
            pair.underlying_pair.quote_token.address = WRAPPED_NATIVE_ADDR.to_string();
        }
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

    fn conversion_log(from: Address, to: Address, from_amount: u64, to_amount: u64) -> LogEntry {
        let mut data = Vec::with_capacity(96);
        data.extend_from_slice(&U256::from(from_amount).to_be_bytes::<32>());
        data.extend_from_slice(&U256::from(to_amount).to_be_bytes::<32>());
        data.extend_from_slice(&[0u8; 32]); // trader
        LogEntry {
            address: BANCOR_NETWORK_CONTRACT,
            topics: vec![
                *CONVERSION_TOPIC,
                B256::ZERO,
                from.into_word(),
                to.into_word(),
            ],
            data: Bytes::from(data),
            block_number: 1,
            transaction_index: 0,
            log_index: 0,
            transaction_hash: B256::repeat_byte(7),
            removed: false,
        }
    }

    #[test]
    fn decodes_conversion_log() {
        let from = address!("1111111111111111111111111111111111111111");
        let to = address!("2222222222222222222222222222222222222222");
        let raw = decode_conversion(&conversion_log(from, to, 500, 1000)).unwrap();
        assert_eq!(raw.from_token, from);
        assert_eq!(raw.to_token, to);
        assert_eq!(raw.from_amount, U256::from(500u64));
        assert_eq!(raw.to_amount, U256::from(1000u64));
    }

    #[test]
    fn rejects_foreign_event_topics() {
        let from = address!("1111111111111111111111111111111111111111");
        let to = address!("2222222222222222222222222222222222222222");
        let mut log = conversion_log(from, to, 1, 1);
        log.topics[0] = B256::repeat_byte(9);
        assert!(decode_conversion(&log).is_none());
    }

    #[test]
    fn reorients_swaps_spending_the_quote_token() {
        let other = address!("3333333333333333333333333333333333333333");
        let raw = RawConversion {
            from_token: BNT_TOKEN,
            to_token: other,
            from_amount: U256::from(10u64),
            to_amount: U256::from(20u64),
            tx_hash: B256::ZERO,
        };
        let reoriented = reorient_swap(raw, BNT_TOKEN);
        assert_eq!(reoriented.from_token, other);
        assert_eq!(reoriented.to_token, BNT_TOKEN);
        assert_eq!(reoriented.from_amount, U256::from(20u64));
        assert_eq!(reoriented.to_amount, U256::from(10u64));
    }

    #[test]
    fn swaps_not_touching_the_quote_side_stay_put() {
        let a = address!("3333333333333333333333333333333333333333");
        let b = address!("4444444444444444444444444444444444444444");
        let raw = RawConversion {
            from_token: a,
            to_token: b,
            from_amount: U256::from(10u64),
            to_amount: U256::from(20u64),
            tx_hash: B256::ZERO,
        };
        assert_eq!(reorient_swap(raw.clone(), BNT_TOKEN), raw);
    }

    #[test]
    fn price_is_quote_per_unit_spent() {
        let swap = BancorSwap {
            pair: ExchangePair::default(),
            from_amount: 4.0,
            to_amount: 10.0,
            id: String::new(),
        };
        let (price, volume) = swap_price_volume(&swap);
        assert_eq!(price, 2.5);
        assert_eq!(volume, 4.0);
    }
}

//! X2Y2 marketplace scraper.
//!
//! Advances a durable `(block, tx_index)` cursor through the chain,
//! emitting one NFT trade per sale transaction. Progress is checkpointed
//! after every transaction, transient failures are retried at the same
//! cursor under a budget, and exhausted cursors are either poison-skipped
//! or fatal depending on configuration. Delivery downstream is
//! at-least-once: a crash between emit and checkpoint replays the same
//! transaction on restart.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::chain::{abi, filter_trade_txs, ChainApi, FilteredTx, LogEntry, TxFilterCriteria, TxReceipt};
use crate::db::Store;
use crate::error::ScraperError;
use crate::nft::metadata::{self, MetadataLimits};
use crate::nft::price::TokenPriceSource;
use crate::scrapers::{getenv, ScraperCore, TRADE_CHANNEL_CAP};
use crate::types::{Asset, Nft, NftClass, NftTrade, ETHEREUM};
use chrono::{DateTime, TimeZone, Utc};

/// Default identifier of the persisted config/state records; overridable
/// via `SCRAPER_NAME_STATE` for multi-tenant runs.
pub const X2Y2_SCRAPER_NAME: &str = "X2Y2";

const X2Y2_CONTRACT: &str = "0x74312363e45DCaBA76c59ec49a7Aa8A65a67EeD3";
/// The market contract was deployed shortly before this height; scraping
/// starts here on a first-ever run.
const DEFAULT_START_BLOCK: u64 = 14_139_341;
/// All NFTs traded on the venue are treated as ERC-721 (1155 extends it).
const NFT_CONTRACT_TYPE: &str = "ERC721";

static PROFIT_TOPIC: LazyLock<B256> =
    LazyLock::new(|| abi::event_topic("EvProfit(bytes32,address,address,uint256)"));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct X2y2Config {
    /// Observed event-emitter on the connected chain.
    pub contract_addr: String,
    /// Max blocks per filter request.
    pub batch_size: u64,
    /// Seconds to sleep between successful batches.
    pub wait_per_batch: u64,
    /// Reorg safety margin: minimum lag behind chain head.
    pub following_distance_blocks: u64,
    /// When set, contract reads happen at the event's block instead of the
    /// latest state.
    pub use_archive_node_features: bool,
    /// Consecutive-failure budget per cursor before the skip policy kicks
    /// in.
    pub max_retry: u32,
    /// Exhausted budget: advance past the offending transaction when true,
    /// halt when false.
    pub skip_on_error: bool,
    /// Byte cap for external token metadata documents.
    pub max_metadata_size: usize,
    /// Seconds allowed per external metadata fetch.
    pub metadata_timeout: u64,
}

impl Default for X2y2Config {
    fn default() -> Self {
        Self {
            contract_addr: X2Y2_CONTRACT.to_string(),
            batch_size: 5000,
            wait_per_batch: 30,
            following_distance_blocks: 10,
            use_archive_node_features: false,
            max_retry: 5,
            skip_on_error: true,
            max_metadata_size: 50 * 1024,
            metadata_timeout: 30,
        }
    }
}

impl X2y2Config {
    fn metadata_limits(&self) -> MetadataLimits {
        MetadataLimits {
            max_size: self.max_metadata_size,
            timeout: Duration::from_secs(self.metadata_timeout),
        }
    }

    fn contract(&self) -> Result<Address, ScraperError> {
        self.contract_addr
            .parse()
            .map_err(|_| ScraperError::Fatal(format!("bad contract address {}", self.contract_addr)))
    }

    /// Block height used for contract reads tied to an event.
    fn read_block(&self, event_block: u64) -> Option<u64> {
        self.use_archive_node_features.then_some(event_block)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct X2y2State {
    #[serde(default)]
    pub last_block_num: u64,
    #[serde(default)]
    pub last_tx_index: u64,
    #[serde(default)]
    pub last_error: String,
    #[serde(default)]
    pub count_of_error: u32,
}

/// Decoded sale event: the payment currency and raw amount.
#[derive(Debug, Clone, PartialEq)]
struct ProfitEvent {
    currency: Address,
    amount: U256,
}

#[derive(Debug, Clone, Default)]
struct Erc721Transfer {
    nft_address: Address,
    name: Option<String>,
    symbol: Option<String>,
    from: Address,
    to: Address,
    token_id: U256,
    token_uri: Option<String>,
    token_attrs: serde_json::Map<String, serde_json::Value>,
}

struct ScraperInner {
    conf: X2y2Config,
    state: X2y2State,
}

pub struct X2y2Scraper {
    core: Arc<ScraperCore<NftTrade>>,
    chain: Arc<dyn ChainApi>,
    store: Store,
    price_source: Arc<dyn TokenPriceSource>,
    http: reqwest::Client,
    /// Identifier of the persisted config/state records.
    name: String,
    exchange: String,
    /// Exclusive cursor ownership: held for the whole duration of a tick.
    inner: Mutex<ScraperInner>,
}

impl X2y2Scraper {
    /// Load (or initialize) config and state. With `scrape` set the
    /// producer task starts immediately; tests drive ticks by hand
    /// instead.
    pub async fn new(
        store: Store,
        chain: Arc<dyn ChainApi>,
        price_source: Arc<dyn TokenPriceSource>,
        exchange: &str,
        scrape: bool,
    ) -> Result<Arc<Self>, ScraperError> {
        let name = getenv("SCRAPER_NAME_STATE", X2Y2_SCRAPER_NAME);

        let mut default_state = X2y2State {
            last_block_num: DEFAULT_START_BLOCK,
            ..X2y2State::default()
        };
        // Overrides the starting block on a first-ever run only; persisted
        // state always wins.
        if let Ok(raw) = std::env::var("LAST_BLOCK_NUM") {
            match raw.parse() {
                Ok(block) => default_state.last_block_num = block,
                Err(err) => error!(value = %raw, error = %err, "bad LAST_BLOCK_NUM"),
            }
        }

        let (conf, state) = match store.scraper_config::<X2y2Config>(&name).await {
            Ok(conf) => {
                let state = store.scraper_state(&name).await?;
                (conf, state)
            }
            Err(ScraperError::NotFound) => {
                // First run: persist the compiled-in defaults.
                let conf = X2y2Config::default();
                store.set_scraper_config(&name, &conf).await?;
                store.set_scraper_state(&name, &default_state).await?;
                (conf, default_state)
            }
            Err(err) => {
                error!(scraper = %name, error = %err, "unable to read scraper config");
                return Err(err);
            }
        };

        info!(scraper = %name, block = state.last_block_num, "scraper starts");

        let (core, trade_tx) = ScraperCore::new(exchange, TRADE_CHANNEL_CAP);
        let scraper = Arc::new(Self {
            core,
            chain,
            store,
            price_source,
            http: reqwest::Client::new(),
            name,
            exchange: exchange.to_string(),
            inner: Mutex::new(ScraperInner { conf, state }),
        });

        if scrape {
            let producer = scraper.clone();
            tokio::spawn(async move { producer.main_loop(trade_tx).await });
        } else {
            // Manual driving: the caller sends through its own channel.
            drop(trade_tx);
        }

        Ok(scraper)
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn take_trade_channel(&self) -> Option<mpsc::Receiver<NftTrade>> {
        self.core.take_trade_channel()
    }

    pub fn error(&self) -> Option<ScraperError> {
        self.core.error()
    }

    pub async fn close(&self) -> Result<(), ScraperError> {
        self.core.close().await
    }

    async fn main_loop(self: Arc<Self>, trade_tx: mpsc::Sender<NftTrade>) {
        let mut shutdown = self.core.shutdown_rx();
        {
            let inner = self.inner.lock().await;
            info!(
                scraper = %self.name,
                batch = inner.conf.batch_size,
                period_secs = inner.conf.wait_per_batch,
                "acquisition loop started"
            );
        }

        let exit_err = loop {
            match self.fetch_trades(&trade_tx).await {
                Ok(_) => {}
                Err(ScraperError::ShutdownRequested) => break None,
                Err(err @ ScraperError::Fatal(_)) => {
                    error!(scraper = %self.name, error = %err, "acquisition loop halting");
                    break Some(err);
                }
                // Retryable tick error; the cursor was persisted with its
                // incremented failure count, try again after the wait.
                Err(_) => {}
            }

            let wait = Duration::from_secs(self.inner.lock().await.conf.wait_per_batch);
            debug!(wait_secs = wait.as_secs(), "waiting for next batch");
            tokio::select! {
                biased;
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break None,
                _ = sleep(wait) => {}
            }
        };

        self.core.cleanup(exit_err);
        drop(trade_tx);
    }

    /// One tick: reload config/state, filter the next block range, process
    /// each matching transaction, checkpoint the cursor as it advances.
    pub async fn fetch_trades(
        &self,
        trade_tx: &mpsc::Sender<NftTrade>,
    ) -> Result<usize, ScraperError> {
        let mut inner = self.inner.lock().await;

        // Both documents may have been edited live.
        match self.store.scraper_config(&self.name).await {
            Ok(conf) => inner.conf = conf,
            Err(err) => {
                warn!(error = %err, "unable to load scraper config");
                return Err(ScraperError::transient(err));
            }
        }
        match self.store.scraper_state(&self.name).await {
            Ok(state) => inner.state = state,
            Err(err) => {
                warn!(error = %err, "unable to load scraper state");
                return Err(ScraperError::transient(err));
            }
        }
        let conf = inner.conf.clone();

        info!(
            from_block = inner.state.last_block_num,
            batch = conf.batch_size,
            "fetching trade transactions"
        );

        let criteria = TxFilterCriteria {
            start_block_num: inner.state.last_block_num,
            start_tx_index: inner.state.last_tx_index,
            limit_blocks: conf.batch_size,
            behind_highest_block: conf.following_distance_blocks,
            addresses: vec![conf.contract()?],
            topics: vec![*PROFIT_TOPIC],
        };
        let batch = match filter_trade_txs(self.chain.as_ref(), &criteria).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(error = %err, "unable to filter trades");
                return Err(ScraperError::transient(err));
            }
        };

        info!(
            txs = batch.txs.len(),
            logs = batch.num_logs,
            blocks = batch.num_blocks,
            to_block = batch.last_block_num,
            synced = batch.synced,
            "exploring trade transactions"
        );

        let mut num_trades = 0usize;
        for tx in &batch.txs {
            // Move the cursor onto this transaction before processing so a
            // crash between transactions resumes exactly here.
            inner.state.last_block_num = tx.block_num;
            inner.state.last_tx_index = tx.tx_index;
            inner.state.last_error.clear();

            let mut skipped = false;
            match self.process_tx(&conf, tx, trade_tx).await {
                Ok(was_skipped) => skipped = was_skipped,
                Err(ScraperError::ShutdownRequested) => {
                    return Err(ScraperError::ShutdownRequested)
                }
                Err(err) => {
                    inner.state.count_of_error += 1;

                    if inner.state.count_of_error <= conf.max_retry {
                        inner.state.last_error = format!(
                            "unable to process trade transaction({:#x}): {err}",
                            tx.tx_hash
                        );
                        error!("{}", inner.state.last_error);
                        self.persist_state(&inner.state).await?;
                        // Retryable from the outer loop's point of view even
                        // when the underlying failure was a decode error.
                        return Err(ScraperError::Transient(inner.state.last_error.clone()));
                    }

                    if !conf.skip_on_error {
                        let reason = format!(
                            "retry budget exhausted at block {}, tx index {}: {err}",
                            tx.block_num, tx.tx_index
                        );
                        self.persist_state(&inner.state).await?;
                        return Err(ScraperError::Fatal(reason));
                    }

                    warn!(
                        "SKIPPING PERMANENTLY! block: {}, tx index: {} - error: {err}",
                        tx.block_num, tx.tx_index
                    );
                    skipped = true;
                }
            }

            if !skipped {
                num_trades += 1;
            }

            // Successful advance resets the consecutive-failure budget.
            inner.state.count_of_error = 0;
            inner.state.last_tx_index = tx.tx_index + 1;
            self.persist_state(&inner.state).await?;
        }

        inner.state.last_block_num = batch.last_block_num + 1;
        inner.state.last_tx_index = 0;
        self.persist_state(&inner.state).await?;

        info!(num_trades, "processed trades");
        Ok(num_trades)
    }

    async fn persist_state(&self, state: &X2y2State) -> Result<(), ScraperError> {
        self.store
            .set_scraper_state(&self.name, state)
            .await
            .map_err(|err| {
                warn!(error = %err, "unable to store scraper state");
                err
            })
    }

    /// Inspect one sale transaction. `Ok(true)` means the transaction was
    /// examined and deliberately skipped (no trade to account for).
    async fn process_tx(
        &self,
        conf: &X2y2Config,
        tx: &FilteredTx,
        trade_tx: &mpsc::Sender<NftTrade>,
    ) -> Result<bool, ScraperError> {
        trace!(block = tx.block_num, tx_index = tx.tx_index, hash = %tx.tx_hash, "process tx");

        let first_log = tx
            .logs
            .first()
            .ok_or_else(|| ScraperError::Fatal("filtered tx carries no logs".into()))?;
        let event = decode_profit_event(first_log).map_err(|err| {
            error!(hash = %tx.tx_hash, error = %err, "unable to decode sale event");
            ScraperError::fatal(err)
        })?;

        let record = self
            .chain
            .transaction_by_hash(tx.tx_hash)
            .await
            .map_err(|err| {
                error!(hash = %tx.tx_hash, error = %err, "unable to read transaction");
                ScraperError::transient(err)
            })?;
        if record.is_pending() {
            error!(hash = %tx.tx_hash, "transaction still pending");
            return Err(ScraperError::Transient("transaction pending".into()));
        }

        let receipt = self
            .chain
            .transaction_receipt(tx.tx_hash)
            .await
            .map_err(|err| {
                error!(hash = %tx.tx_hash, error = %err, "unable to read receipt");
                ScraperError::transient(err)
            })?;

        // Zero address means the sale settled in the native coin.
        let mut currency_symbol = "ETH".to_string();
        let mut currency_decimals = 18u8;
        if event.currency != Address::ZERO {
            let (symbol, decimals) = self
                .fetch_erc20_metadata(conf, event.currency, tx.block_num)
                .await?;
            currency_decimals = decimals;
            if let Some(symbol) = symbol {
                currency_symbol = symbol;
            }
        }

        let transfers = self.find_erc721_transfers(conf, &receipt).await;
        if transfers.is_empty() {
            trace!(hash = %tx.tx_hash, "skipped: no nft transfer in receipt");
            return Ok(true);
        }
        if transfers.len() > 1 {
            // Can't apportion one sale price across several items.
            trace!(hash = %tx.tx_hash, transfers = transfers.len(), "skipped: multiple nft transfers");
            return Ok(true);
        }

        let normalized_price =
            abi::u256_to_f64(event.amount) / 10f64.powi(currency_decimals as i32);
        let token_price = self
            .price_source
            .token_price_usd(tx.block_num, event.currency, &currency_symbol)
            .await
            .map_err(|err| {
                error!(hash = %tx.tx_hash, error = %err, "unable to price sale currency");
                ScraperError::transient(err)
            })?;
        let usd_price = normalized_price * token_price;

        self.notify_trade(conf, tx, &transfers[0], &event, usd_price, &currency_symbol, currency_decimals, trade_tx)
            .await?;
        Ok(false)
    }

    #[allow(clippy::too_many_arguments)]
    async fn notify_trade(
        &self,
        conf: &X2y2Config,
        tx: &FilteredTx,
        transfer: &Erc721Transfer,
        event: &ProfitEvent,
        usd_price: f64,
        currency_symbol: &str,
        currency_decimals: u8,
        trade_tx: &mpsc::Sender<NftTrade>,
    ) -> Result<(), ScraperError> {
        let class = self.create_or_read_nft_class(transfer).await?;
        let nft = self.create_or_read_nft(conf, &class, transfer).await?;

        let timestamp = match self.chain.block_by_number(tx.block_num).await {
            Ok(block) => Utc
                .timestamp_opt(block.timestamp as i64, 0)
                .single()
                .unwrap_or(DateTime::UNIX_EPOCH),
            Err(err) => {
                error!(block = tx.block_num, error = %err, "getting block time");
                DateTime::UNIX_EPOCH
            }
        };

        let currency_addr = format!("{:#x}", event.currency);
        let currency = match self.store.cached_asset(ETHEREUM, &currency_addr).await {
            Ok(asset) => asset,
            Err(_) => {
                // Best effort: keep what the chain told us about the token.
                error!(address = %currency_addr, "cannot fetch currency asset");
                Asset {
                    symbol: currency_symbol.to_string(),
                    address: currency_addr,
                    blockchain: ETHEREUM.to_string(),
                    decimals: currency_decimals,
                    ..Asset::default()
                }
            }
        };

        let trade = NftTrade {
            nft,
            price: event.amount,
            price_usd: usd_price,
            from_address: format!("{:#x}", transfer.from),
            to_address: format!("{:#x}", transfer.to),
            block_number: tx.block_num,
            timestamp,
            tx_hash: format!("{:#x}", tx.tx_hash),
            exchange: self.exchange.clone(),
            currency,
        };
        info!(
            tx = %trade.tx_hash,
            token = %trade.nft.token_id,
            price_usd = trade.price_usd,
            "found trade"
        );

        self.core.send_or_shutdown(trade_tx, trade).await
    }

    async fn create_or_read_nft_class(
        &self,
        transfer: &Erc721Transfer,
    ) -> Result<NftClass, ScraperError> {
        let address = format!("{:#x}", transfer.nft_address);
        match self.store.nft_class(&address, ETHEREUM).await {
            Ok(class) => Ok(class),
            Err(ScraperError::NotFound) => {
                let class = NftClass {
                    address,
                    blockchain: ETHEREUM.to_string(),
                    name: transfer.name.clone().unwrap_or_default(),
                    symbol: transfer.symbol.clone().unwrap_or_default(),
                    contract_type: NFT_CONTRACT_TYPE.to_string(),
                };
                self.store.set_nft_class(&class).await.map_err(|err| {
                    warn!(error = %err, "unable to create nft class");
                    err
                })?;
                Ok(class)
            }
            Err(err) => {
                warn!(error = %err, "unable to read nft class");
                Err(err)
            }
        }
    }

    async fn create_or_read_nft(
        &self,
        conf: &X2y2Config,
        class: &NftClass,
        transfer: &Erc721Transfer,
    ) -> Result<Nft, ScraperError> {
        let token_id = transfer.token_id.to_string();
        match self.store.nft(&class.address, ETHEREUM, &token_id).await {
            Ok(nft) => Ok(nft),
            Err(ScraperError::NotFound) => {
                let (creator, created_at) = self
                    .find_contract_creation_info(conf, transfer.nft_address)
                    .await
                    .map_err(|err| {
                        warn!(
                            contract = %class.address,
                            error = %err,
                            "unable to find nft contract creation info"
                        );
                        err
                    })?;

                let nft = Nft {
                    class: class.clone(),
                    token_id,
                    uri: transfer.token_uri.clone().unwrap_or_default(),
                    creation_time: created_at,
                    creator_address: format!("{creator:#x}"),
                    attributes: transfer.token_attrs.clone(),
                };
                self.store.set_nft(&nft).await.map_err(|err| {
                    warn!(error = %err, "unable to create nft");
                    err
                })?;
                Ok(nft)
            }
            Err(err) => {
                warn!(error = %err, "unable to read nft");
                Err(err)
            }
        }
    }

    /// Smallest block at which the contract has code, found by binary
    /// search over `eth_getCode`; then the creation receipt in that block
    /// names the deployer. Contracts deployed by other contracts have no
    /// matching receipt and resolve to zero values without erroring.
    async fn find_contract_creation_info(
        &self,
        conf: &X2y2Config,
        contract: Address,
    ) -> Result<(Address, DateTime<Utc>), ScraperError> {
        if !conf.use_archive_node_features {
            trace!("creation info needs archive node features, using zero values");
            return Ok((Address::ZERO, DateTime::UNIX_EPOCH));
        }

        let head = self
            .chain
            .block_number()
            .await
            .map_err(ScraperError::transient)?;

        let mut lo = 0u64;
        let mut hi = head;
        while hi > lo + 1 {
            let mid = (lo + hi) / 2;
            let code = self
                .chain
                .code_at(contract, mid)
                .await
                .map_err(ScraperError::transient)?;
            if code.is_empty() {
                lo = mid;
            } else {
                hi = mid;
            }
        }

        let code = self
            .chain
            .code_at(contract, hi)
            .await
            .map_err(ScraperError::transient)?;
        if code.is_empty() {
            // Never deployed below head; nothing to report.
            return Ok((Address::ZERO, DateTime::UNIX_EPOCH));
        }

        let block = self
            .chain
            .block_by_number(hi)
            .await
            .map_err(ScraperError::transient)?;
        let created_at = Utc
            .timestamp_opt(block.timestamp as i64, 0)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH);

        for record in &block.transactions {
            // Creation transactions have no recipient.
            if record.to.is_some() {
                continue;
            }
            let receipt = self
                .chain
                .transaction_receipt(record.hash)
                .await
                .map_err(ScraperError::transient)?;
            if receipt.contract_address == Some(contract) {
                return Ok((record.from, created_at));
            }
        }

        // Deployed via another contract (factory); creator is unknowable
        // from receipts alone.
        Ok((Address::ZERO, DateTime::UNIX_EPOCH))
    }

    async fn fetch_erc20_metadata(
        &self,
        conf: &X2y2Config,
        token: Address,
        block_num: u64,
    ) -> Result<(Option<String>, u8), ScraperError> {
        let block = conf.read_block(block_num);

        let symbol_raw = self
            .chain
            .call(token, abi::encode_call0("symbol()"), block)
            .await
            .map_err(|err| {
                warn!(token = %token, error = %err, "unable to read erc20 symbol");
                ScraperError::transient(err)
            })?;
        let symbol = abi::decode_string(&symbol_raw).map_err(ScraperError::transient)?;

        let decimals_raw = self
            .chain
            .call(token, abi::encode_call0("decimals()"), block)
            .await
            .map_err(|err| {
                warn!(token = %token, error = %err, "unable to read erc20 decimals");
                ScraperError::transient(err)
            })?;
        let decimals = abi::decode_u8(&decimals_raw).map_err(ScraperError::transient)?;

        Ok((Some(symbol), decimals))
    }

    /// Collect the receipt's NFT transfers. Metadata reads are best-effort;
    /// a transfer counts even when its token document is unreachable.
    async fn find_erc721_transfers(
        &self,
        conf: &X2y2Config,
        receipt: &TxReceipt,
    ) -> Vec<Erc721Transfer> {
        let mut transfers = Vec::with_capacity(1);

        for log in &receipt.logs {
            let Some(mut transfer) = parse_transfer_log(log) else {
                continue;
            };

            let block = conf.read_block(log.block_number);
            match self
                .chain
                .call(transfer.nft_address, abi::encode_call0("name()"), block)
                .await
                .and_then(|raw| abi::decode_string(&raw))
            {
                Ok(name) => transfer.name = Some(name),
                Err(err) => {
                    warn!(contract = %transfer.nft_address, error = %err, "unable to read nft name")
                }
            }
            match self
                .chain
                .call(transfer.nft_address, abi::encode_call0("symbol()"), block)
                .await
                .and_then(|raw| abi::decode_string(&raw))
            {
                Ok(symbol) => transfer.symbol = Some(symbol),
                Err(err) => {
                    warn!(contract = %transfer.nft_address, error = %err, "unable to read nft symbol")
                }
            }

            match self
                .chain
                .call(
                    transfer.nft_address,
                    abi::encode_call_u256("tokenURI(uint256)", transfer.token_id),
                    block,
                )
                .await
                .and_then(|raw| abi::decode_string(&raw))
            {
                Ok(uri) => {
                    match metadata::read_nft_attrs(&self.http, &uri, conf.metadata_limits()).await
                    {
                        Ok(attrs) => {
                            transfer.token_uri = Some(uri);
                            transfer.token_attrs = attrs;
                        }
                        Err(err) => {
                            warn!(token = %transfer.token_id, error = %err, "unable to read token attributes")
                        }
                    }
                }
                Err(err) => {
                    warn!(token = %transfer.token_id, error = %err, "unable to read token uri")
                }
            }

            transfers.push(transfer);
        }

        transfers
    }
}

fn decode_profit_event(log: &LogEntry) -> anyhow::Result<ProfitEvent> {
    if log.topics.first() != Some(&*PROFIT_TOPIC) {
        anyhow::bail!("unexpected event topic");
    }
    // data words: itemHash, currency, to, amount
    if log.data.len() < 128 {
        anyhow::bail!("sale event data too short: {} bytes", log.data.len());
    }
    Ok(ProfitEvent {
        currency: abi::address_from_word(&B256::from_slice(&log.data[32..64])),
        amount: U256::from_be_slice(&log.data[96..128]),
    })
}

/// An NFT transfer log has the canonical Transfer topic and all three
/// parameters indexed (four topics total); the token id rides in the last
/// topic. Some pre-standard contracts emit the token id unindexed, in the
/// data section, with the topic layout otherwise intact.
fn parse_transfer_log(log: &LogEntry) -> Option<Erc721Transfer> {
    if log.topics.len() != 4 || log.topics[0] != *abi::TRANSFER_TOPIC {
        return None;
    }

    let token_id = if log.data.is_empty() {
        U256::from_be_bytes(log.topics[3].0)
    } else if log.data.len() >= 32 {
        debug!(contract = %log.address, "non-standard transfer layout, token id from data");
        U256::from_be_slice(&log.data[0..32])
    } else {
        return None;
    };

    Some(Erc721Transfer {
        nft_address: log.address,
        from: abi::address_from_word(&log.topics[1]),
        to: abi::address_from_word(&log.topics[2]),
        token_id,
        ..Erc721Transfer::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, Bytes};

    fn profit_log(currency: Address, amount: u64) -> LogEntry {
        let mut data = Vec::with_capacity(128);
        data.extend_from_slice(&[0u8; 32]); // itemHash
        data.extend_from_slice(&currency.into_word().0);
        data.extend_from_slice(&[0u8; 32]); // to
        data.extend_from_slice(&U256::from(amount).to_be_bytes::<32>());
        LogEntry {
            address: Address::ZERO,
            topics: vec![*PROFIT_TOPIC],
            data: Bytes::from(data),
            block_number: 14_200_000,
            transaction_index: 3,
            log_index: 0,
            transaction_hash: B256::repeat_byte(1),
            removed: false,
        }
    }

    fn transfer_log(topics: Vec<B256>, data: Vec<u8>) -> LogEntry {
        LogEntry {
            address: address!("1234123412341234123412341234123412341234"),
            topics,
            data: Bytes::from(data),
            block_number: 14_200_000,
            transaction_index: 3,
            log_index: 1,
            transaction_hash: B256::repeat_byte(1),
            removed: false,
        }
    }

    #[test]
    fn decodes_sale_event() {
        let currency = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let event = decode_profit_event(&profit_log(currency, 1_000_000)).unwrap();
        assert_eq!(event.currency, currency);
        assert_eq!(event.amount, U256::from(1_000_000u64));
    }

    #[test]
    fn rejects_short_sale_event_data() {
        let mut log = profit_log(Address::ZERO, 1);
        log.data = Bytes::from(vec![0u8; 64]);
        assert!(decode_profit_event(&log).is_err());
    }

    #[test]
    fn parses_standard_transfer() {
        let from = address!("1111111111111111111111111111111111111111");
        let to = address!("2222222222222222222222222222222222222222");
        let log = transfer_log(
            vec![
                *abi::TRANSFER_TOPIC,
                from.into_word(),
                to.into_word(),
                B256::from(U256::from(77u64)),
            ],
            vec![],
        );
        let transfer = parse_transfer_log(&log).unwrap();
        assert_eq!(transfer.from, from);
        assert_eq!(transfer.to, to);
        assert_eq!(transfer.token_id, U256::from(77u64));
    }

    #[test]
    fn parses_compat_transfer_with_token_id_in_data() {
        let from = address!("1111111111111111111111111111111111111111");
        let to = address!("2222222222222222222222222222222222222222");
        let log = transfer_log(
            vec![
                *abi::TRANSFER_TOPIC,
                from.into_word(),
                to.into_word(),
                B256::ZERO,
            ],
            U256::from(9001u64).to_be_bytes::<32>().to_vec(),
        );
        let transfer = parse_transfer_log(&log).unwrap();
        assert_eq!(transfer.token_id, U256::from(9001u64));
    }

    #[test]
    fn erc20_style_transfers_are_not_nft_transfers() {
        // ERC-20 Transfer: only two indexed params, three topics.
        let from = address!("1111111111111111111111111111111111111111");
        let to = address!("2222222222222222222222222222222222222222");
        let log = transfer_log(
            vec![*abi::TRANSFER_TOPIC, from.into_word(), to.into_word()],
            U256::from(500u64).to_be_bytes::<32>().to_vec(),
        );
        assert!(parse_transfer_log(&log).is_none());
    }

    #[test]
    fn config_defaults_match_first_run_expectations() {
        let conf = X2y2Config::default();
        assert_eq!(conf.batch_size, 5000);
        assert_eq!(conf.max_retry, 5);
        assert!(conf.skip_on_error);
        assert_eq!(conf.following_distance_blocks, 10);
        assert!(conf.contract().is_ok());
        assert_eq!(conf.read_block(123), None);
    }

    #[test]
    fn state_fields_default_when_absent() {
        let state: X2y2State = serde_json::from_str(r#"{"last_block_num": 14139341}"#).unwrap();
        assert_eq!(state.last_block_num, 14_139_341);
        assert_eq!(state.last_tx_index, 0);
        assert_eq!(state.count_of_error, 0);
        assert!(state.last_error.is_empty());
    }
}

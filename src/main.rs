//! Scraper host: one venue adapter per process.
//!
//! Consumes the adapter's trade channel and forwards every trade to the
//! log sink; ctrl-c triggers a clean `close()`. The venue and the pairs to
//! subscribe come from the command line.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

use pricemesh::chain::HttpChainClient;
use pricemesh::db::Store;
use pricemesh::nft::{StaticPriceTable, X2y2Scraper};
use pricemesh::scrapers::{
    bancor::BancorScraper, dforce::DforceScraper, getenv, lbank::LbankScraper, mexc::MexcScraper,
    zb::ZbScraper, Scraper,
};
use pricemesh::types::ExchangePair;

#[derive(Parser, Debug)]
#[command(name = "pricemesh")]
#[command(about = "Scrape one trading venue into the canonical trade stream")]
struct Args {
    /// Venue to scrape: zb | lbank | mexc | bancor | dforce | x2y2
    #[arg(long)]
    exchange: String,

    /// Path to the SQLite state store / catalog
    #[arg(long, default_value = "pricemesh.db")]
    db: String,

    /// Venue-local pair names to subscribe (CEX venues)
    #[arg(long = "pair")]
    pairs: Vec<String>,

    /// Dforce exchange contract address
    #[arg(long)]
    contract: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let store = Store::open(&args.db)?;

    match args.exchange.as_str() {
        "x2y2" => run_nft_scraper(store).await,
        name => run_trade_scraper(name, store, &args).await,
    }
}

fn chain_client() -> Result<Arc<HttpChainClient>> {
    let url = getenv("ETH_URI_REST", "http://127.0.0.1:8545");
    Ok(Arc::new(HttpChainClient::new(url)?))
}

async fn run_trade_scraper(name: &str, store: Store, args: &Args) -> Result<()> {
    let scraper: Arc<dyn Scraper> = match name {
        "zb" => ZbScraper::connect(store).await?,
        "lbank" => LbankScraper::connect(store).await?,
        "mexc" => MexcScraper::connect(store).await?,
        "bancor" => {
            let ws_url = getenv("ETH_URI_WS", "ws://127.0.0.1:8546");
            BancorScraper::new(chain_client()?, ws_url)
        }
        "dforce" => {
            let ws_url = getenv("ETH_URI_WS", "ws://127.0.0.1:8546");
            let contract = args
                .contract
                .as_deref()
                .ok_or_else(|| anyhow!("--contract is required for dforce"))?
                .parse::<alloy_primitives::Address>()
                .context("parse dforce contract address")?;
            DforceScraper::new(chain_client()?, ws_url, contract)
        }
        other => return Err(anyhow!("unknown exchange {other:?}")),
    };

    for foreign_name in &args.pairs {
        let pair = ExchangePair {
            foreign_name: foreign_name.clone(),
            symbol: foreign_name
                .split(['-', '_'])
                .next()
                .unwrap_or(foreign_name)
                .to_uppercase(),
            exchange: scraper.exchange().to_string(),
            ..ExchangePair::default()
        };
        scraper.subscribe(pair).await?;
        info!(pair = %foreign_name, "subscribed");
    }

    let mut trades = scraper
        .take_trade_channel()
        .context("trade channel already taken")?;

    loop {
        tokio::select! {
            trade = trades.recv() => {
                match trade {
                    Some(trade) => {
                        info!(
                            source = %trade.source,
                            pair = %trade.pair,
                            price = trade.price,
                            volume = trade.volume,
                            verified = trade.verified_pair,
                            "trade"
                        );
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                if let Err(err) = scraper.close().await {
                    warn!(error = %err, "close reported an error");
                }
                break;
            }
        }
    }

    if let Some(err) = scraper.error() {
        error!(error = %err, "scraper terminated with error");
    }
    Ok(())
}

async fn run_nft_scraper(store: Store) -> Result<()> {
    let scraper = X2y2Scraper::new(
        store,
        chain_client()?,
        Arc::new(StaticPriceTable),
        "X2Y2",
        true,
    )
    .await?;

    let mut trades = scraper
        .take_trade_channel()
        .context("trade channel already taken")?;

    loop {
        tokio::select! {
            trade = trades.recv() => {
                match trade {
                    Some(trade) => {
                        info!(
                            tx = %trade.tx_hash,
                            collection = %trade.nft.class.name,
                            token = %trade.nft.token_id,
                            price_usd = trade.price_usd,
                            "nft trade"
                        );
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                if let Err(err) = scraper.close().await {
                    warn!(error = %err, "close reported an error");
                }
                break;
            }
        }
    }

    if let Some(err) = scraper.error() {
        error!(error = %err, "scraper terminated with error");
    }
    Ok(())
}

//! ZB exchange websocket scraper.
//!
//! One control message per pair subscription; a single read task fans all
//! trade frames into the shared trade channel. Per-trade parse failures are
//! logged and dropped, they never terminate the scraper.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info};

use super::{getenv, PairHandle, Scraper, ScraperCore, TRADE_CHANNEL_CAP};
use crate::db::Store;
use crate::error::ScraperError;
use crate::types::{ExchangePair, Trade};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

pub const ZB_EXCHANGE: &str = "ZB";
const ZB_SOCKET_URL: &str = "wss://api.zb.live/websocket";

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Serialize)]
struct ZbSubscribe {
    event: &'static str,
    channel: String,
}

#[derive(Debug, Deserialize)]
struct ZbTradeResponse {
    #[serde(rename = "dataType", default)]
    data_type: String,
    #[serde(default)]
    data: Vec<ZbTradeEntry>,
    channel: String,
}

#[derive(Debug, Deserialize)]
struct ZbTradeEntry {
    amount: String,
    price: String,
    tid: i64,
    date: i64,
    #[serde(rename = "type")]
    side: String,
}

pub struct ZbScraper {
    core: Arc<ScraperCore<Trade>>,
    store: Store,
    writer: Mutex<WsWriter>,
    pair_scrapers: RwLock<HashMap<String, ExchangePair>>,
}

impl ZbScraper {
    pub async fn connect(store: Store) -> Result<Arc<Self>, ScraperError> {
        let url = getenv("ZB_WS_URL", ZB_SOCKET_URL);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(ScraperError::fatal)?;
        let (writer, reader) = ws_stream.split();

        let (core, trade_tx) = ScraperCore::new(ZB_EXCHANGE, TRADE_CHANNEL_CAP);
        let scraper = Arc::new(Self {
            core,
            store,
            writer: Mutex::new(writer),
            pair_scrapers: RwLock::new(HashMap::new()),
        });

        let producer = scraper.clone();
        tokio::spawn(async move { producer.main_loop(reader, trade_tx).await });

        Ok(scraper)
    }

    /// Runs until shutdown or a read error; owns the only trade sender.
    async fn main_loop(self: Arc<Self>, mut reader: WsReader, trade_tx: mpsc::Sender<Trade>) {
        let mut shutdown = self.core.shutdown_rx();

        let exit_err = loop {
            tokio::select! {
                biased;
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break None,
                frame = reader.next() => {
                    match frame {
                        None => break Some(ScraperError::Fatal("websocket stream ended".into())),
                        Some(Err(err)) => {
                            error!(error = %err, "zb websocket read failed");
                            break Some(ScraperError::fatal(err));
                        }
                        Some(Ok(Message::Text(text))) => {
                            if let Err(ScraperError::ShutdownRequested) =
                                self.handle_frame(text.as_str(), &trade_tx).await
                            {
                                break None;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = self.writer.lock().await.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            break Some(ScraperError::Fatal("websocket closed by venue".into()));
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        };

        self.core.cleanup(exit_err);
        drop(trade_tx);
    }

    /// Handle one text frame. Only `ShutdownRequested` propagates; anything
    /// malformed is logged and skipped.
    async fn handle_frame(
        &self,
        text: &str,
        trade_tx: &mpsc::Sender<Trade>,
    ) -> Result<(), ScraperError> {
        let message: ZbTradeResponse = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(_) => {
                // Subscription acks and heartbeats have other shapes.
                debug!(frame = text, "skipping non-trade frame");
                return Ok(());
            }
        };
        if message.data.is_empty() || !message.data_type.is_empty() && message.data_type != "trades"
        {
            return Ok(());
        }

        let foreign_name = message.channel.trim_end_matches("_trades").to_string();
        let Some(pair) = self.pair_scrapers.read().get(&foreign_name).cloned() else {
            error!(channel = %message.channel, "unknown pair");
            return Ok(());
        };

        let exchange_pair = match self
            .store
            .exchange_pair_cache(ZB_EXCHANGE, &foreign_name)
            .await
        {
            Ok(exchange_pair) => exchange_pair,
            Err(err) => {
                error!(pair = %foreign_name, error = %err, "pair not in catalog");
                ExchangePair::default()
            }
        };

        for entry in &message.data {
            let Some(trade) = trade_from_entry(entry, &pair, &exchange_pair, &foreign_name) else {
                continue;
            };
            let verified = trade.verified_pair;
            self.core.send_or_shutdown(trade_tx, trade).await?;
            if verified {
                info!(pair = %foreign_name, "got verified trade");
            }
        }
        Ok(())
    }
}

/// Build one canonical trade from a venue entry. Returns `None` (and logs)
/// when price or volume fail to parse as decimal strings.
fn trade_from_entry(
    entry: &ZbTradeEntry,
    pair: &ExchangePair,
    exchange_pair: &ExchangePair,
    foreign_name: &str,
) -> Option<Trade> {
    let price: f64 = match entry.price.parse() {
        Ok(price) => price,
        Err(_) => {
            error!(price = %entry.price, "error parsing price");
            return None;
        }
    };
    let mut volume: f64 = match entry.amount.parse() {
        Ok(volume) => volume,
        Err(_) => {
            error!(amount = %entry.amount, "error parsing volume");
            return None;
        }
    };
    if entry.side == "sell" {
        volume = -volume;
    }

    let time: DateTime<Utc> = Utc
        .timestamp_opt(entry.date, 0)
        .single()
        .unwrap_or_else(Utc::now);

    Some(Trade {
        symbol: pair.symbol.clone(),
        pair: foreign_name.to_string(),
        price,
        volume,
        time,
        foreign_trade_id: entry.tid.to_string(),
        source: ZB_EXCHANGE.to_string(),
        base_token: exchange_pair.underlying_pair.base_token.clone(),
        quote_token: exchange_pair.underlying_pair.quote_token.clone(),
        verified_pair: exchange_pair.verified,
    })
}

#[async_trait]
impl Scraper for ZbScraper {
    fn exchange(&self) -> &str {
        ZB_EXCHANGE
    }

    async fn subscribe(&self, pair: ExchangePair) -> Result<PairHandle, ScraperError> {
        self.core.check_running()?;

        let already_registered = self
            .pair_scrapers
            .write()
            .insert(pair.foreign_name.clone(), pair.clone())
            .is_some();

        if !already_registered {
            let request = ZbSubscribe {
                event: "addChannel",
                channel: format!("{}_trades", pair.foreign_name),
            };
            let payload =
                serde_json::to_string(&request).map_err(ScraperError::fatal)?;
            self.writer
                .lock()
                .await
                .send(Message::Text(payload.into()))
                .await
                .map_err(ScraperError::fatal)?;
        }

        Ok(PairHandle::new(pair, self.core.clone()))
    }

    async fn fetch_available_pairs(&self) -> Result<Vec<ExchangePair>, ScraperError> {
        Err(ScraperError::Unsupported("fetch_available_pairs"))
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
        self.core.begin_close()?;
        let _ = self.writer.lock().await.close().await;
        self.core.await_done().await;
        match self.core.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

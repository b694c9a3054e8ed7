//! LBank exchange websocket scraper.
//!
//! Same family as the ZB scraper; LBank sends numeric price/volume fields
//! and an ISO-8601 trade timestamp without zone.

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
use chrono::{DateTime, NaiveDateTime, Utc};

pub const LBANK_EXCHANGE: &str = "LBank";
const LBANK_SOCKET_URL: &str = "wss://www.lbkex.net/ws/V2/";

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Serialize)]
struct LbankSubscribe {
    action: &'static str,
    subscribe: &'static str,
    pair: String,
}

#[derive(Debug, Deserialize)]
struct LbankMessage {
    #[serde(rename = "type", default)]
    message_type: String,
    #[serde(default)]
    pair: String,
    trade: Option<LbankTrade>,
}

#[derive(Debug, Deserialize)]
struct LbankTrade {
    price: f64,
    volume: f64,
    direction: String,
    #[serde(rename = "TS", default)]
    ts: String,
}

pub struct LbankScraper {
    core: Arc<ScraperCore<Trade>>,
    store: Store,
    writer: Mutex<WsWriter>,
    pair_scrapers: RwLock<HashMap<String, ExchangePair>>,
}

impl LbankScraper {
    pub async fn connect(store: Store) -> Result<Arc<Self>, ScraperError> {
        let url = getenv("LBANK_WS_URL", LBANK_SOCKET_URL);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(ScraperError::fatal)?;
        let (writer, reader) = ws_stream.split();

        let (core, trade_tx) = ScraperCore::new(LBANK_EXCHANGE, TRADE_CHANNEL_CAP);
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
                            error!(error = %err, "lbank websocket read failed");
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

    async fn handle_frame(
        &self,
        text: &str,
        trade_tx: &mpsc::Sender<Trade>,
    ) -> Result<(), ScraperError> {
        let message: LbankMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(_) => {
                debug!(frame = text, "skipping non-trade frame");
                return Ok(());
            }
        };
        if message.message_type != "trade" {
            return Ok(());
        }
        let Some(raw) = message.trade else {
            return Ok(());
        };

        let Some(pair) = self.pair_scrapers.read().get(&message.pair).cloned() else {
            error!(pair = %message.pair, "unknown pair");
            return Ok(());
        };

        let exchange_pair = match self
            .store
            .exchange_pair_cache(LBANK_EXCHANGE, &message.pair)
            .await
        {
            Ok(exchange_pair) => exchange_pair,
            Err(err) => {
                error!(pair = %message.pair, error = %err, "pair not in catalog");
                ExchangePair::default()
            }
        };

        let mut volume = raw.volume;
        if raw.direction == "sell" {
            volume = -volume;
        }

        let trade = Trade {
            symbol: pair.symbol.clone(),
            pair: message.pair.clone(),
            price: raw.price,
            volume,
            time: parse_trade_time(&raw.ts),
            foreign_trade_id: String::new(),
            source: LBANK_EXCHANGE.to_string(),
            base_token: exchange_pair.underlying_pair.base_token.clone(),
            quote_token: exchange_pair.underlying_pair.quote_token.clone(),
            verified_pair: exchange_pair.verified,
        };

        let verified = trade.verified_pair;
        self.core.send_or_shutdown(trade_tx, trade).await?;
        if verified {
            info!(pair = %message.pair, "got verified trade");
        }
        Ok(())
    }
}

/// LBank stamps trades like `2019-06-28T19:55:49.460`; fall back to now
/// when the field is absent or malformed.
fn parse_trade_time(ts: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.3f")
        .map(|naive| naive.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl Scraper for LbankScraper {
    fn exchange(&self) -> &str {
        LBANK_EXCHANGE
    }

    async fn subscribe(&self, pair: ExchangePair) -> Result<PairHandle, ScraperError> {
        self.core.check_running()?;

        let already_registered = self
            .pair_scrapers
            .write()
            .insert(pair.foreign_name.clone(), pair.clone())
            .is_some();

        if !already_registered {
            let request = LbankSubscribe {
                action: "subscribe",
                subscribe: "trade",
                pair: pair.foreign_name.clone(),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_message_deserializes() {
        let raw = r#"{
            "SERVER": "V2",
            "type": "trade",
            "pair": "btc_usdt",
            "trade": {
                "price": 12129.5,
                "volume": 6.3607,
                "amount": 77148.93,
                "direction": "sell",
                "TS": "2019-06-28T19:55:49.460"
            }
        }"#;
        let message: LbankMessage = serde_json::from_str(raw).unwrap();
        let trade = message.trade.unwrap();
        assert_eq!(trade.price, 12129.5);
        assert_eq!(trade.direction, "sell");
    }

    #[test]
    fn venue_timestamp_parses_to_utc() {
        let time = parse_trade_time("2019-06-28T19:55:49.460");
        assert_eq!(time.timestamp(), 1_561_751_749);
    }

    #[test]
    fn malformed_timestamp_falls_back_to_now() {
        let before = Utc::now();
        let time = parse_trade_time("garbage");
        assert!(time >= before);
    }
}

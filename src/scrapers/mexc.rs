//! MEXC exchange websocket scraper.
//!
//! Deals arrive batched per channel; side is an integer flag (1 buy,
//! 2 sell) and timestamps are unix milliseconds. MEXC expects the client
//! to send a JSON PING every ~30s or it drops the connection.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info};

use super::{getenv, PairHandle, Scraper, ScraperCore, TRADE_CHANNEL_CAP};
use crate::db::Store;
use crate::error::ScraperError;
use crate::types::{ExchangePair, Trade};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

pub const MEXC_EXCHANGE: &str = "MEXC";
const MEXC_SOCKET_URL: &str = "wss://wbs.mexc.com/ws";
const DEALS_CHANNEL_PREFIX: &str = "spot@public.deals.v3.api@";

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Deserialize)]
struct MexcMessage {
    #[serde(rename = "c", default)]
    channel: String,
    #[serde(rename = "d")]
    data: Option<MexcDealData>,
}

#[derive(Debug, Deserialize)]
struct MexcDealData {
    #[serde(default)]
    deals: Vec<MexcDeal>,
}

#[derive(Debug, Deserialize)]
struct MexcDeal {
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "v")]
    volume: String,
    /// 1 = taker buy, 2 = taker sell.
    #[serde(rename = "S")]
    side: u8,
    #[serde(rename = "t")]
    time_ms: i64,
}

pub struct MexcScraper {
    core: Arc<ScraperCore<Trade>>,
    store: Store,
    writer: Mutex<WsWriter>,
    pair_scrapers: RwLock<HashMap<String, ExchangePair>>,
}

impl MexcScraper {
    pub async fn connect(store: Store) -> Result<Arc<Self>, ScraperError> {
        let url = getenv("MEXC_WS_URL", MEXC_SOCKET_URL);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(ScraperError::fatal)?;
        let (writer, reader) = ws_stream.split();

        let (core, trade_tx) = ScraperCore::new(MEXC_EXCHANGE, TRADE_CHANNEL_CAP);
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
        let mut ping = interval(Duration::from_secs(30));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let exit_err = loop {
            tokio::select! {
                biased;
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break None,
                _ = ping.tick() => {
                    let payload = json!({"method": "PING"}).to_string();
                    let _ = self.writer.lock().await.send(Message::Text(payload.into())).await;
                }
                frame = reader.next() => {
                    match frame {
                        None => break Some(ScraperError::Fatal("websocket stream ended".into())),
                        Some(Err(err)) => {
                            error!(error = %err, "mexc websocket read failed");
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
        let message: MexcMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(_) => {
                debug!(frame = text, "skipping non-trade frame");
                return Ok(());
            }
        };
        let Some(foreign_name) = message.channel.strip_prefix(DEALS_CHANNEL_PREFIX) else {
            return Ok(());
        };
        let foreign_name = foreign_name.to_string();
        let Some(data) = message.data else {
            return Ok(());
        };

        let Some(pair) = self.pair_scrapers.read().get(&foreign_name).cloned() else {
            error!(channel = %message.channel, "unknown pair");
            return Ok(());
        };

        let exchange_pair = match self
            .store
            .exchange_pair_cache(MEXC_EXCHANGE, &foreign_name)
            .await
        {
            Ok(exchange_pair) => exchange_pair,
            Err(err) => {
                error!(pair = %foreign_name, error = %err, "pair not in catalog");
                ExchangePair::default()
            }
        };

        for deal in &data.deals {
            let Some(trade) = trade_from_deal(deal, &pair, &exchange_pair, &foreign_name) else {
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

fn trade_from_deal(
    deal: &MexcDeal,
    pair: &ExchangePair,
    exchange_pair: &ExchangePair,
    foreign_name: &str,
) -> Option<Trade> {
    let price: f64 = match deal.price.parse() {
        Ok(price) => price,
        Err(_) => {
            error!(price = %deal.price, "error parsing price");
            return None;
        }
    };
    let mut volume: f64 = match deal.volume.parse() {
        Ok(volume) => volume,
        Err(_) => {
            error!(volume = %deal.volume, "error parsing volume");
            return None;
        }
    };
    if deal.side == 2 {
        volume = -volume;
    }

    let time: DateTime<Utc> = Utc
        .timestamp_millis_opt(deal.time_ms)
        .single()
        .unwrap_or_else(Utc::now);

    Some(Trade {
        symbol: pair.symbol.clone(),
        pair: foreign_name.to_string(),
        price,
        volume,
        time,
        foreign_trade_id: deal.time_ms.to_string(),
        source: MEXC_EXCHANGE.to_string(),
        base_token: exchange_pair.underlying_pair.base_token.clone(),
        quote_token: exchange_pair.underlying_pair.quote_token.clone(),
        verified_pair: exchange_pair.verified,
    })
}

#[async_trait]
impl Scraper for MexcScraper {
    fn exchange(&self) -> &str {
        MEXC_EXCHANGE
    }

    async fn subscribe(&self, pair: ExchangePair) -> Result<PairHandle, ScraperError> {
        self.core.check_running()?;

        let already_registered = self
            .pair_scrapers
            .write()
            .insert(pair.foreign_name.clone(), pair.clone())
            .is_some();

        if !already_registered {
            let payload = json!({
                "method": "SUBSCRIPTION",
                "params": [format!("{DEALS_CHANNEL_PREFIX}{}", pair.foreign_name)],
            })
            .to_string();
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

    fn fixture_pair() -> ExchangePair {
        ExchangePair {
            symbol: "BTC".into(),
            foreign_name: "BTCUSDT".into(),
            exchange: MEXC_EXCHANGE.into(),
            ..ExchangePair::default()
        }
    }

    #[test]
    fn deal_message_deserializes() {
        let raw = r#"{
            "c": "spot@public.deals.v3.api@BTCUSDT",
            "d": {"deals": [{"p": "20233.84", "v": "0.001028", "S": 1, "t": 1661927587825}]},
            "t": 1661927587836
        }"#;
        let message: MexcMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            message.channel.strip_prefix(DEALS_CHANNEL_PREFIX),
            Some("BTCUSDT")
        );
        assert_eq!(message.data.unwrap().deals.len(), 1);
    }

    #[test]
    fn taker_sell_flag_negates_volume() {
        let deal = MexcDeal {
            price: "20233.84".into(),
            volume: "0.5".into(),
            side: 2,
            time_ms: 1_661_927_587_825,
        };
        let pair = fixture_pair();
        let trade = trade_from_deal(&deal, &pair, &pair, "BTCUSDT").unwrap();
        assert_eq!(trade.volume, -0.5);
        assert_eq!(trade.time.timestamp_millis(), 1_661_927_587_825);
    }

    #[test]
    fn unparseable_volume_drops_the_trade() {
        let deal = MexcDeal {
            price: "1.0".into(),
            volume: "".into(),
            side: 1,
            time_ms: 0,
        };
        let pair = fixture_pair();
        assert!(trade_from_deal(&deal, &pair, &pair, "BTCUSDT").is_none());
    }
}

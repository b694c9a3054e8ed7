//! Live `eth_subscribe("logs")` streams over websocket.
//!
//! One call of [`stream_logs`] owns one connection: it subscribes, forwards
//! matching logs into the sink, and returns `Ok` only on shutdown. Any
//! connection failure surfaces as an error so the caller's supervisor can
//! schedule a resubscribe.

use alloy_primitives::{Address, B256};
use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::types::LogEntry;
use crate::chain::ChainApi;

/// Backfill helper: the historical window `[head - lookback, head]` of
/// matching logs via the REST client, emitted before going live.
pub async fn fetch_lookback(
    chain: &dyn ChainApi,
    lookback_blocks: u64,
    addresses: &[Address],
    topics: &[B256],
) -> Result<Vec<LogEntry>> {
    let head = chain.block_number().await?;
    let start = head.saturating_sub(lookback_blocks);
    chain.logs(start, head, addresses, topics).await
}

/// Subscribe to live logs and forward them until shutdown.
pub async fn stream_logs(
    ws_url: &str,
    addresses: &[Address],
    topics: &[B256],
    sink: &mpsc::Sender<LogEntry>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let (ws_stream, _) = connect_async(ws_url)
        .await
        .context("connect log subscription websocket")?;
    let (mut write, mut read) = ws_stream.split();

    let mut filter = json!({});
    if !addresses.is_empty() {
        filter["address"] = json!(addresses);
    }
    if !topics.is_empty() {
        filter["topics"] = json!([topics]);
    }
    let request = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "eth_subscribe",
        "params": ["logs", filter],
    });
    write
        .send(Message::Text(request.to_string().into()))
        .await
        .context("send eth_subscribe request")?;

    // First reply carries the subscription id.
    let subscription_id = loop {
        let msg = read
            .next()
            .await
            .ok_or_else(|| anyhow!("stream ended before subscription ack"))??;
        match msg {
            Message::Text(text) => {
                let reply: Value = serde_json::from_str(text.as_str())?;
                if let Some(err) = reply.get("error") {
                    bail!("eth_subscribe rejected: {err}");
                }
                if let Some(id) = reply.get("result").and_then(|r| r.as_str()) {
                    break id.to_string();
                }
            }
            Message::Ping(payload) => {
                write.send(Message::Pong(payload)).await?;
            }
            Message::Close(frame) => bail!("websocket closed during subscribe: {frame:?}"),
            _ => {}
        }
    };
    info!(subscription = %subscription_id, "log subscription established");

    loop {
        tokio::select! {
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            msg = read.next() => {
                let Some(msg) = msg else {
                    bail!("log subscription stream ended");
                };
                match msg.context("log subscription read")? {
                    Message::Text(text) => {
                        let Some(log) = parse_notification(text.as_str()) else {
                            continue;
                        };
                        if sink.send(log).await.is_err() {
                            // Receiver gone; the adapter is shutting down.
                            return Ok(());
                        }
                    }
                    Message::Ping(payload) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Message::Close(frame) => {
                        bail!("log subscription closed by peer: {frame:?}");
                    }
                    _ => {}
                }
            }
        }
    }
}

fn parse_notification(text: &str) -> Option<LogEntry> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            debug!(error = %err, "non-json frame on log subscription");
            return None;
        }
    };
    if value.get("method").and_then(|m| m.as_str()) != Some("eth_subscription") {
        return None;
    }
    let result = value.get("params")?.get("result")?.clone();
    match serde_json::from_value::<LogEntry>(result) {
        Ok(log) => {
            if log.removed {
                // Reorged-out log; scrapers only act on canonical entries.
                debug!(tx = %log.transaction_hash, "dropping removed log");
                None
            } else {
                Some(log)
            }
        }
        Err(err) => {
            warn!(error = %err, "malformed log notification");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscription_notification() {
        let raw = r#"{
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {
                "subscription": "0x9ce59a13059e417087c02d3236a0b1cc",
                "result": {
                    "address": "0x2f9ec37d6ccfff1cab21733bdadede11c823ccb0",
                    "topics": ["0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"],
                    "data": "0x",
                    "blockNumber": "0x10",
                    "transactionIndex": "0x0",
                    "logIndex": "0x1",
                    "transactionHash": "0x50d7cde2b22dc166ba51c10c283ebb93f0e2bd3a2cd07af53b87a587f1a0c2d5"
                }
            }
        }"#;
        let log = parse_notification(raw).unwrap();
        assert_eq!(log.block_number, 16);
    }

    #[test]
    fn ignores_rpc_acks_and_garbage() {
        assert!(parse_notification(r#"{"jsonrpc":"2.0","id":1,"result":"0xabc"}"#).is_none());
        assert!(parse_notification("PONG").is_none());
    }
}

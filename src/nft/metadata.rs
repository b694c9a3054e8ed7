//! NFT token metadata retrieval.
//!
//! `tokenURI` values come in three flavors: inline `data:` URLs (decoded in
//! place), `ipfs://` URLs (unsupported, empty attributes), and plain HTTP
//! with a byte cap and timeout. Failures here are never fatal to the
//! scraper; the caller logs and keeps the transfer.

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::StreamExt;
use serde_json::{Map, Value};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct MetadataLimits {
    pub max_size: usize,
    pub timeout: Duration,
}

/// Fetch and decode a token's attribute document.
pub async fn read_nft_attrs(
    http: &reqwest::Client,
    uri: &str,
    limits: MetadataLimits,
) -> Result<Map<String, Value>> {
    if uri.is_empty() {
        return Ok(Map::new());
    }

    if uri.starts_with("ipfs://") {
        // No gateway configured; keep the transfer with empty attributes.
        return Ok(Map::new());
    }

    if uri.starts_with("data:") {
        return decode_data_url(uri);
    }

    let response = http
        .get(uri)
        .timeout(limits.timeout)
        .send()
        .await
        .context("fetch token metadata")?;
    if !response.status().is_success() {
        bail!("unable to read token attributes: {}", response.status());
    }

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("read token metadata body")?;
        let budget = limits.max_size.saturating_sub(body.len());
        if chunk.len() >= budget {
            body.extend_from_slice(&chunk[..budget]);
            break;
        }
        body.extend_from_slice(&chunk);
    }

    serde_json::from_slice(&body).context("decode token metadata json")
}

/// Decode `data:[<mediatype>][;base64],<payload>` into the attribute map.
fn decode_data_url(uri: &str) -> Result<Map<String, Value>> {
    let rest = uri.trim_start_matches("data:");
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| anyhow!("malformed data url"))?;

    let bytes = if header.ends_with(";base64") {
        BASE64.decode(payload).context("decode base64 data url")?
    } else {
        payload.as_bytes().to_vec()
    };

    serde_json::from_slice(&bytes).context("decode data url json")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> MetadataLimits {
        MetadataLimits {
            max_size: 50 * 1024,
            timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn empty_and_ipfs_uris_yield_empty_attributes() {
        let http = reqwest::Client::new();
        assert!(read_nft_attrs(&http, "", limits()).await.unwrap().is_empty());
        assert!(read_nft_attrs(&http, "ipfs://QmYwAPJzv5CZsnA", limits())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn base64_data_url_decodes_into_the_map() {
        let payload = BASE64.encode(br#"{"trait": "gold", "level": 3}"#);
        let uri = format!("data:application/json;base64,{payload}");
        let http = reqwest::Client::new();

        let attrs = read_nft_attrs(&http, &uri, limits()).await.unwrap();
        assert_eq!(attrs["trait"], Value::String("gold".into()));
        assert_eq!(attrs["level"], Value::from(3));
    }

    #[tokio::test]
    async fn plain_data_url_decodes_into_the_map() {
        let uri = r#"data:application/json,{"background": "red"}"#;
        let http = reqwest::Client::new();
        let attrs = read_nft_attrs(&http, uri, limits()).await.unwrap();
        assert_eq!(attrs["background"], Value::String("red".into()));
    }

    #[test]
    fn garbage_data_url_is_an_error() {
        assert!(decode_data_url("data:application/json;base64,!!!").is_err());
        assert!(decode_data_url("data:no-comma").is_err());
    }
}

//! Canonical data model shared by every venue adapter and the filters.

use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const ETHEREUM: &str = "Ethereum";

/// Magic address some DEXes use to mean the chain's native coin.
pub const PSEUDO_NATIVE_ADDR: &str = "0xEeeeeEeeeEeEeeEeEeEeeEEEeeeeEeeeeeeeEEeE";
/// Wrapped-native token the pseudo-native sentinel is rewritten to for
/// catalog lookups.
pub const WRAPPED_NATIVE_ADDR: &str = "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub symbol: String,
    pub name: String,
    pub address: String,
    pub blockchain: String,
    pub decimals: u8,
}

impl Asset {
    /// Process-wide cache identity: `(blockchain, address)`, address
    /// case-insensitive on EVM chains.
    pub fn key(blockchain: &str, address: &str) -> String {
        format!("{}-{}", blockchain, address.to_lowercase())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pair {
    pub base_token: Asset,
    pub quote_token: Asset,
}

/// A venue-local trading pair together with its catalog resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangePair {
    pub symbol: String,
    pub foreign_name: String,
    pub exchange: String,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub underlying_pair: Pair,
}

/// One normalized trade. `volume < 0` means the taker sold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub pair: String,
    pub price: f64,
    pub volume: f64,
    pub time: DateTime<Utc>,
    pub foreign_trade_id: String,
    pub source: String,
    pub base_token: Asset,
    pub quote_token: Asset,
    pub verified_pair: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NftClass {
    pub address: String,
    pub blockchain: String,
    pub name: String,
    pub symbol: String,
    pub contract_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Nft {
    pub class: NftClass,
    pub token_id: String,
    pub uri: String,
    pub creation_time: DateTime<Utc>,
    pub creator_address: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct NftTrade {
    pub nft: Nft,
    /// Raw on-chain sale amount in the currency's smallest unit.
    pub price: U256,
    pub price_usd: f64,
    pub from_address: String,
    pub to_address: String,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
    pub tx_hash: String,
    pub exchange: String,
    pub currency: Asset,
}

/// Trades pre-grouped into one time block. Blocks arrive in strict time
/// order; a block may be empty.
#[derive(Debug, Clone, Default)]
pub struct TradeBlock {
    /// Block start in unix nanoseconds.
    pub time_stamp: i64,
    pub trades: Vec<Trade>,
}

/// One aggregated price value for one time block for one asset.
#[derive(Debug, Clone, Default)]
pub struct FilterPoint {
    pub asset: Asset,
    pub value: f64,
    pub name: String,
    pub time: DateTime<Utc>,
    pub first_trade: Option<Trade>,
    pub last_trade: Option<Trade>,
}

/// Running min/max over the values a filter emitted.
#[derive(Debug, Clone, Default)]
pub struct FilterPointMetadata {
    pub min: f64,
    pub max: f64,
    points: usize,
}

impl FilterPointMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_point(&mut self, value: f64) {
        if self.points == 0 {
            self.min = value;
            self.max = value;
        } else {
            if value < self.min {
                self.min = value;
            }
            if value > self.max {
                self.max = value;
            }
        }
        self.points += 1;
    }

    pub fn len(&self) -> usize {
        self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_key_is_case_insensitive() {
        let a = Asset::key(ETHEREUM, "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2");
        let b = Asset::key(ETHEREUM, "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2");
        assert_eq!(a, b);
    }

    #[test]
    fn metadata_tracks_min_max() {
        let mut md = FilterPointMetadata::new();
        md.add_point(3.0);
        md.add_point(1.0);
        md.add_point(2.0);
        assert_eq!(md.min, 1.0);
        assert_eq!(md.max, 3.0);
        assert_eq!(md.len(), 3);
    }

    #[test]
    fn scraper_state_defaults_for_absent_fields() {
        // Persisted documents have no schema versioning; additive fields
        // must default cleanly when absent.
        let pair: ExchangePair = serde_json::from_str(
            r#"{"symbol":"WETH","foreign_name":"WETH-BNT","exchange":"Bancor"}"#,
        )
        .unwrap();
        assert!(!pair.verified);
        assert_eq!(pair.underlying_pair, Pair::default());
    }
}

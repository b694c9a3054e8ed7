//! Token USD price resolution for NFT sale pricing.

use alloy_primitives::Address;
use anyhow::Result;
use async_trait::async_trait;

/// Pluggable per-block token price lookup.
#[async_trait]
pub trait TokenPriceSource: Send + Sync {
    async fn token_price_usd(&self, block_num: u64, token: Address, symbol: &str) -> Result<f64>;
}

/// Fixed table by symbol, a stand-in until historical quotations are wired
/// up. TODO: resolve the price at the trade's block from the filter-point
/// history instead of this table.
pub struct StaticPriceTable;

#[async_trait]
impl TokenPriceSource for StaticPriceTable {
    async fn token_price_usd(
        &self,
        _block_num: u64,
        _token: Address,
        symbol: &str,
    ) -> Result<f64> {
        Ok(match symbol {
            "ETH" | "WETH" => 2040.0910,
            "MANA" => 0.5,
            _ => 1.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn table_falls_back_to_one() {
        let source = StaticPriceTable;
        let eth = source
            .token_price_usd(0, Address::ZERO, "ETH")
            .await
            .unwrap();
        let other = source
            .token_price_usd(0, Address::ZERO, "USDC")
            .await
            .unwrap();
        assert_eq!(eth, 2040.0910);
        assert_eq!(other, 1.0);
    }
}

//! NFT marketplace trade scrapers: the resumable on-chain acquisition loop
//! plus token metadata and USD price helpers.

pub mod metadata;
pub mod price;
pub mod x2y2;

pub use price::{StaticPriceTable, TokenPriceSource};
pub use x2y2::{X2y2Config, X2y2Scraper, X2y2State};

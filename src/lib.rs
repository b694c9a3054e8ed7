//! pricemesh backend library
//!
//! Collects trades from heterogeneous venues (CEX websockets, EVM on-chain
//! event streams), normalizes them into canonical trades on a single channel
//! per scraper, and computes per-block reference-price filter points.

pub mod chain;
pub mod db;
pub mod error;
pub mod filters;
pub mod nft;
pub mod scrapers;
pub mod types;

//! Error taxonomy shared by all scrapers.
//!
//! The acquisition loops only ever branch on the kind, so the payloads are
//! plain strings and the whole enum stays `Clone` for `Scraper::error()`
//! observers.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScraperError {
    /// A record is absent from the store or catalog. Recovery on first-run
    /// init paths, a warning with best-effort zero values elsewhere.
    #[error("record not found")]
    NotFound,

    /// RPC / websocket / HTTP failures and pending transactions. Retried
    /// under the per-cursor budget by on-chain scrapers.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Unrecoverable: subscription read failure, bad decode, or an
    /// exhausted retry budget with skip_on_error unset.
    #[error("fatal failure: {0}")]
    Fatal(String),

    /// Clean termination path, never surfaced to callers as an error.
    #[error("shutdown requested")]
    ShutdownRequested,

    /// Operation on a scraper that has already terminated.
    #[error("scraper is closed")]
    Closed,

    /// Second call to `close()`.
    #[error("scraper already closed")]
    AlreadyClosed,

    #[error("{0} not supported by this scraper")]
    Unsupported(&'static str),
}

impl ScraperError {
    pub fn transient(err: impl std::fmt::Display) -> Self {
        ScraperError::Transient(err.to_string())
    }

    pub fn fatal(err: impl std::fmt::Display) -> Self {
        ScraperError::Fatal(err.to_string())
    }
}

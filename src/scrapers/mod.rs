//! Venue scraper contract and the lifecycle machinery shared by all
//! adapters.
//!
//! Every adapter owns exactly one producer task. The producer holds the only
//! `mpsc::Sender`, so the trade channel closes when the producer exits; a
//! closed channel is how consumers discover termination, with `error()`
//! surfacing the cause.

pub mod bancor;
pub mod dforce;
pub mod lbank;
pub mod mexc;
pub mod zb;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::error::ScraperError;
use crate::types::{ExchangePair, Trade};

/// Bounded capacity of every adapter's trade channel; sends block the
/// producer once the downstream consumer falls this far behind.
pub const TRADE_CHANNEL_CAP: usize = 64;

/// Env var lookup with a default, used for per-venue URL overrides.
pub fn getenv(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[async_trait]
pub trait Scraper: Send + Sync {
    fn exchange(&self) -> &str;

    /// Register interest in a venue-local pair. Idempotent per
    /// `foreign_name`; fails with [`ScraperError::Closed`] after shutdown.
    async fn subscribe(&self, pair: ExchangePair) -> Result<PairHandle, ScraperError>;

    async fn fetch_available_pairs(&self) -> Result<Vec<ExchangePair>, ScraperError>;

    fn normalize_pair(&self, pair: ExchangePair) -> Result<ExchangePair, ScraperError>;

    /// Hand out the single consumer end of the trade channel. Returns
    /// `None` on every call after the first.
    fn take_trade_channel(&self) -> Option<mpsc::Receiver<Trade>>;

    /// The error that terminated the scraper, if any.
    fn error(&self) -> Option<ScraperError>;

    /// Initiate shutdown and block until the trade channel has closed.
    /// A second call returns [`ScraperError::AlreadyClosed`].
    async fn close(&self) -> Result<(), ScraperError>;
}

#[derive(Default)]
struct LifecycleState {
    error: Option<ScraperError>,
    closed: bool,
    close_requested: bool,
}

/// Shared per-adapter state: the `(error, closed)` pair behind one
/// reader-writer lock, the shutdown and done signals, and the
/// single-consumer slot for the trade receiver.
pub struct ScraperCore<T> {
    exchange: String,
    lifecycle: RwLock<LifecycleState>,
    shutdown_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
    trade_rx: Mutex<Option<mpsc::Receiver<T>>>,
}

impl<T: Send + 'static> ScraperCore<T> {
    /// Returns the core plus the producer's sender. The producer must be
    /// the only holder of the sender so that its exit closes the channel.
    pub fn new(exchange: &str, capacity: usize) -> (Arc<Self>, mpsc::Sender<T>) {
        let (trade_tx, trade_rx) = mpsc::channel(capacity);
        let (shutdown_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);
        let core = Arc::new(Self {
            exchange: exchange.to_string(),
            lifecycle: RwLock::new(LifecycleState::default()),
            shutdown_tx,
            done_tx,
            trade_rx: Mutex::new(Some(trade_rx)),
        });
        (core, trade_tx)
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn take_trade_channel(&self) -> Option<mpsc::Receiver<T>> {
        self.trade_rx.lock().take()
    }

    pub fn error(&self) -> Option<ScraperError> {
        self.lifecycle.read().error.clone()
    }

    pub fn closed(&self) -> bool {
        self.lifecycle.read().closed
    }

    /// Fails with `Closed` once shutdown has begun, or with the stored
    /// error if the producer already died.
    pub fn check_running(&self) -> Result<(), ScraperError> {
        let lc = self.lifecycle.read();
        if let Some(err) = &lc.error {
            return Err(err.clone());
        }
        if lc.closed || lc.close_requested {
            return Err(ScraperError::Closed);
        }
        Ok(())
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Send one item, racing the shutdown signal. Pending producers
    /// observing shutdown must not write further trades.
    pub async fn send_or_shutdown(
        &self,
        tx: &mpsc::Sender<T>,
        item: T,
    ) -> Result<(), ScraperError> {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::select! {
            biased;
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => Err(ScraperError::ShutdownRequested),
            res = tx.send(item) => res.map_err(|_| ScraperError::ShutdownRequested),
        }
    }

    /// Producer exit path, clean or fatal. Records the error, flips
    /// `closed`, and releases `close()` waiters. The caller drops its
    /// sender right after, which closes the trade channel.
    pub fn cleanup(&self, err: Option<ScraperError>) {
        {
            let mut lc = self.lifecycle.write();
            if let Some(err) = err {
                lc.error = Some(err);
            }
            lc.closed = true;
        }
        let _ = self.done_tx.send(true);
    }

    /// First half of `close()`: flag the request and signal the producer.
    pub fn begin_close(&self) -> Result<(), ScraperError> {
        {
            let mut lc = self.lifecycle.write();
            if lc.close_requested || lc.closed {
                return Err(ScraperError::AlreadyClosed);
            }
            lc.close_requested = true;
        }
        eprintln!("begin_close: about to send true");
        let _ = self.shutdown_tx.send(true);
        eprintln!("begin_close: sent true, receiver_count={}", self.shutdown_tx.receiver_count());
        Ok(())
    }

    /// Second half of `close()`: wait for the producer's cleanup.
    pub async fn await_done(&self) {
        let mut done = self.done_tx.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Full close sequence shared by adapters without extra resources.
    pub async fn close(&self) -> Result<(), ScraperError> {
        self.begin_close()?;
        self.await_done().await;
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Handle returned by `subscribe`, scoped to one venue-local pair.
pub struct PairHandle {
    pair: ExchangePair,
    core: Arc<ScraperCore<Trade>>,
    closed: AtomicBool,
}

impl PairHandle {
    pub(crate) fn new(pair: ExchangePair, core: Arc<ScraperCore<Trade>>) -> Self {
        Self {
            pair,
            core,
            closed: AtomicBool::new(false),
        }
    }

    pub fn pair(&self) -> &ExchangePair {
        &self.pair
    }

    pub fn error(&self) -> Option<ScraperError> {
        self.core.error()
    }

    /// Stop listening for this pair. The parent scraper keeps running.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trade_channel_is_single_consumer() {
        let (core, _tx) = ScraperCore::<u32>::new("Demo", 4);
        assert!(core.take_trade_channel().is_some());
        assert!(core.take_trade_channel().is_none());
    }

    #[tokio::test]
    async fn second_close_reports_already_closed() {
        let (core, tx) = ScraperCore::<u32>::new("Demo", 4);

        // Producer stand-in: exits on shutdown, then runs cleanup.
        let producer_core = core.clone();
        let producer = tokio::spawn(async move {
            eprintln!("producer: subscribing");
            let mut shutdown = producer_core.shutdown_rx();
            eprintln!("producer: current shutdown value = {}", *shutdown.borrow());
            eprintln!("producer: waiting for shutdown");
            let _ = shutdown.wait_for(|stop| *stop).await;
            eprintln!("producer: got shutdown, cleaning up");
            producer_core.cleanup(None);
            eprintln!("producer: cleanup done, dropping tx");
            drop(tx);
            eprintln!("producer: done");
        });

        eprintln!("main: calling close #1");
        assert!(core.close().await.is_ok());
        eprintln!("main: close #1 done, calling close #2");
        assert_eq!(core.close().await.unwrap_err(), ScraperError::AlreadyClosed);
        eprintln!("main: close #2 done, awaiting producer");
        producer.await.unwrap();
        eprintln!("main: producer awaited");
    }

    #[tokio::test]
    async fn shutdown_unblocks_pending_send() {
        let (core, tx) = ScraperCore::<u32>::new("Demo", 1);
        tx.send(1).await.unwrap(); // fill the channel, next send blocks

        let send_core = core.clone();
        let send_tx = tx.clone();
        let pending = tokio::spawn(async move { send_core.send_or_shutdown(&send_tx, 2).await });

        core.begin_close().unwrap();
        assert_eq!(
            pending.await.unwrap().unwrap_err(),
            ScraperError::ShutdownRequested
        );
    }

    #[tokio::test]
    async fn fatal_error_is_observable_after_cleanup() {
        let (core, tx) = ScraperCore::<u32>::new("Demo", 1);
        core.cleanup(Some(ScraperError::Fatal("read failed".into())));
        drop(tx);

        assert!(core.closed());
        assert_eq!(core.error(), Some(ScraperError::Fatal("read failed".into())));
        assert_eq!(
            core.check_running().unwrap_err(),
            ScraperError::Fatal("read failed".into())
        );
    }
}

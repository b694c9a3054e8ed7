//! SQLite-backed state store and asset/pair catalog.
//!
//! Scraper config and state are opaque JSON documents keyed by
//! `(scraper, kind)`. Assets, exchange pairs, NFT classes and NFTs live in
//! their own tables. Reads that hit nothing return
//! [`ScraperError::NotFound`], which is recovery on first-run init paths.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ScraperError;
use crate::types::{Asset, ExchangePair, Nft, NftClass};

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    pair_cache: Arc<RwLock<HashMap<String, ExchangePair>>>,
    asset_cache: Arc<RwLock<HashMap<String, Asset>>>,
}

impl Store {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open pricemesh db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(conn)
    }

    /// In-memory store, used by the test suites.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("open in-memory db")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS scraper_docs (
                scraper TEXT NOT NULL,
                kind TEXT NOT NULL CHECK (kind IN ('config', 'state')),
                doc TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (scraper, kind)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS assets (
                blockchain TEXT NOT NULL,
                address TEXT NOT NULL,
                symbol TEXT NOT NULL,
                name TEXT NOT NULL,
                decimals INTEGER NOT NULL,
                PRIMARY KEY (blockchain, address)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS exchange_pairs (
                exchange TEXT NOT NULL,
                foreign_name TEXT NOT NULL,
                doc TEXT NOT NULL,
                PRIMARY KEY (exchange, foreign_name)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS nft_classes (
                blockchain TEXT NOT NULL,
                address TEXT NOT NULL,
                name TEXT NOT NULL,
                symbol TEXT NOT NULL,
                contract_type TEXT NOT NULL,
                PRIMARY KEY (blockchain, address)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS nfts (
                blockchain TEXT NOT NULL,
                class_address TEXT NOT NULL,
                token_id TEXT NOT NULL,
                uri TEXT NOT NULL,
                creation_time TEXT NOT NULL,
                creator_address TEXT NOT NULL,
                attributes TEXT NOT NULL,
                PRIMARY KEY (blockchain, class_address, token_id)
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            pair_cache: Arc::new(RwLock::new(HashMap::new())),
            asset_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    // ------------------------------------------------------------------
    // Scraper config / state documents
    // ------------------------------------------------------------------

    pub async fn scraper_config<T: DeserializeOwned>(
        &self,
        scraper: &str,
    ) -> Result<T, ScraperError> {
        self.scraper_doc(scraper, "config").await
    }

    pub async fn set_scraper_config<T: Serialize>(
        &self,
        scraper: &str,
        config: &T,
    ) -> Result<(), ScraperError> {
        self.set_scraper_doc(scraper, "config", config).await
    }

    pub async fn scraper_state<T: DeserializeOwned>(
        &self,
        scraper: &str,
    ) -> Result<T, ScraperError> {
        self.scraper_doc(scraper, "state").await
    }

    pub async fn set_scraper_state<T: Serialize>(
        &self,
        scraper: &str,
        state: &T,
    ) -> Result<(), ScraperError> {
        self.set_scraper_doc(scraper, "state", state).await
    }

    async fn scraper_doc<T: DeserializeOwned>(
        &self,
        scraper: &str,
        kind: &str,
    ) -> Result<T, ScraperError> {
        let conn = self.conn.lock().await;
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM scraper_docs WHERE scraper = ?1 AND kind = ?2",
                params![scraper, kind],
                |row| row.get(0),
            )
            .optional()
            .map_err(ScraperError::transient)?;

        let doc = doc.ok_or(ScraperError::NotFound)?;
        serde_json::from_str(&doc).map_err(ScraperError::transient)
    }

    async fn set_scraper_doc<T: Serialize>(
        &self,
        scraper: &str,
        kind: &str,
        doc: &T,
    ) -> Result<(), ScraperError> {
        let doc = serde_json::to_string(doc).map_err(ScraperError::transient)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO scraper_docs (scraper, kind, doc, updated_at)
             VALUES (?1, ?2, ?3, unixepoch())
             ON CONFLICT (scraper, kind) DO UPDATE SET
                doc = excluded.doc, updated_at = excluded.updated_at",
            params![scraper, kind, doc],
        )
        .map_err(ScraperError::transient)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Asset / pair catalog
    // ------------------------------------------------------------------

    pub async fn asset(&self, blockchain: &str, address: &str) -> Result<Asset, ScraperError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT symbol, name, address, blockchain, decimals
             FROM assets WHERE blockchain = ?1 AND address = ?2",
            params![blockchain, address.to_lowercase()],
            |row| {
                Ok(Asset {
                    symbol: row.get(0)?,
                    name: row.get(1)?,
                    address: row.get(2)?,
                    blockchain: row.get(3)?,
                    decimals: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(ScraperError::transient)?
        .ok_or(ScraperError::NotFound)
    }

    pub async fn set_asset(&self, asset: &Asset) -> Result<(), ScraperError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO assets (blockchain, address, symbol, name, decimals)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                asset.blockchain,
                asset.address.to_lowercase(),
                asset.symbol,
                asset.name,
                asset.decimals
            ],
        )
        .map_err(ScraperError::transient)?;
        Ok(())
    }

    /// Catalog lookup through the process-local cache. Entries are
    /// populated lazily and live for the process lifetime.
    pub async fn cached_asset(
        &self,
        blockchain: &str,
        address: &str,
    ) -> Result<Asset, ScraperError> {
        let key = Asset::key(blockchain, address);
        if let Some(asset) = self.asset_cache.read().get(&key) {
            return Ok(asset.clone());
        }
        let asset = self.asset(blockchain, address).await?;
        self.asset_cache.write().insert(key, asset.clone());
        Ok(asset)
    }

    pub async fn exchange_pair_cache(
        &self,
        exchange: &str,
        foreign_name: &str,
    ) -> Result<ExchangePair, ScraperError> {
        let key = format!("{}-{}", exchange, foreign_name);
        if let Some(pair) = self.pair_cache.read().get(&key) {
            return Ok(pair.clone());
        }

        let conn = self.conn.lock().await;
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM exchange_pairs WHERE exchange = ?1 AND foreign_name = ?2",
                params![exchange, foreign_name],
                |row| row.get(0),
            )
            .optional()
            .map_err(ScraperError::transient)?;
        drop(conn);

        let pair: ExchangePair = match doc {
            Some(doc) => serde_json::from_str(&doc).map_err(ScraperError::transient)?,
            None => return Err(ScraperError::NotFound),
        };
        self.pair_cache.write().insert(key, pair.clone());
        Ok(pair)
    }

    pub async fn set_exchange_pair(&self, pair: &ExchangePair) -> Result<(), ScraperError> {
        let doc = serde_json::to_string(pair).map_err(ScraperError::transient)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO exchange_pairs (exchange, foreign_name, doc)
             VALUES (?1, ?2, ?3)",
            params![pair.exchange, pair.foreign_name, doc],
        )
        .map_err(ScraperError::transient)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // NFT catalog
    // ------------------------------------------------------------------

    pub async fn nft_class(
        &self,
        address: &str,
        blockchain: &str,
    ) -> Result<NftClass, ScraperError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT address, blockchain, name, symbol, contract_type
             FROM nft_classes WHERE blockchain = ?1 AND address = ?2",
            params![blockchain, address.to_lowercase()],
            |row| {
                Ok(NftClass {
                    address: row.get(0)?,
                    blockchain: row.get(1)?,
                    name: row.get(2)?,
                    symbol: row.get(3)?,
                    contract_type: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(ScraperError::transient)?
        .ok_or(ScraperError::NotFound)
    }

    pub async fn set_nft_class(&self, class: &NftClass) -> Result<(), ScraperError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO nft_classes
                (blockchain, address, name, symbol, contract_type)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                class.blockchain,
                class.address.to_lowercase(),
                class.name,
                class.symbol,
                class.contract_type
            ],
        )
        .map_err(ScraperError::transient)?;
        debug!(address = %class.address, "stored nft class");
        Ok(())
    }

    pub async fn nft(
        &self,
        class_address: &str,
        blockchain: &str,
        token_id: &str,
    ) -> Result<Nft, ScraperError> {
        let class = self.nft_class(class_address, blockchain).await?;
        let conn = self.conn.lock().await;
        let row: Option<(String, String, String, String)> = conn
            .query_row(
                "SELECT uri, creation_time, creator_address, attributes
                 FROM nfts WHERE blockchain = ?1 AND class_address = ?2 AND token_id = ?3",
                params![blockchain, class_address.to_lowercase(), token_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(ScraperError::transient)?;

        let (uri, creation_time, creator_address, attributes) =
            row.ok_or(ScraperError::NotFound)?;
        Ok(Nft {
            class,
            token_id: token_id.to_string(),
            uri,
            creation_time: creation_time.parse().map_err(ScraperError::transient)?,
            creator_address,
            attributes: serde_json::from_str(&attributes).map_err(ScraperError::transient)?,
        })
    }

    pub async fn set_nft(&self, nft: &Nft) -> Result<(), ScraperError> {
        let attributes =
            serde_json::to_string(&nft.attributes).map_err(ScraperError::transient)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO nfts
                (blockchain, class_address, token_id, uri, creation_time,
                 creator_address, attributes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                nft.class.blockchain,
                nft.class.address.to_lowercase(),
                nft.token_id,
                nft.uri,
                nft.creation_time.to_rfc3339(),
                nft.creator_address,
                attributes
            ],
        )
        .map_err(ScraperError::transient)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Pair, ETHEREUM};
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct DemoState {
        last_block_num: u64,
        #[serde(default)]
        count_of_error: u32,
    }

    #[tokio::test]
    async fn scraper_docs_round_trip() {
        let store = Store::open_in_memory().unwrap();

        let missing = store.scraper_state::<DemoState>("demo").await;
        assert_eq!(missing.unwrap_err(), ScraperError::NotFound);

        let state = DemoState {
            last_block_num: 14139341,
            count_of_error: 2,
        };
        store.set_scraper_state("demo", &state).await.unwrap();
        let read: DemoState = store.scraper_state("demo").await.unwrap();
        assert_eq!(read, state);

        // Overwrite wins.
        store
            .set_scraper_state(
                "demo",
                &DemoState {
                    last_block_num: 14139350,
                    count_of_error: 0,
                },
            )
            .await
            .unwrap();
        let read: DemoState = store.scraper_state("demo").await.unwrap();
        assert_eq!(read.last_block_num, 14139350);
    }

    #[tokio::test]
    async fn asset_identity_is_case_insensitive() {
        let store = Store::open_in_memory().unwrap();
        store
            .set_asset(&Asset {
                symbol: "WETH".into(),
                name: "Wrapped Ether".into(),
                address: "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2".into(),
                blockchain: ETHEREUM.into(),
                decimals: 18,
            })
            .await
            .unwrap();

        let asset = store
            .cached_asset(ETHEREUM, "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2")
            .await
            .unwrap();
        assert_eq!(asset.symbol, "WETH");

        // Second read is served from the process-local cache.
        let again = store
            .cached_asset(ETHEREUM, "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2")
            .await
            .unwrap();
        assert_eq!(again, asset);
    }

    #[tokio::test]
    async fn exchange_pair_cache_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let pair = ExchangePair {
            symbol: "BTC".into(),
            foreign_name: "btcusdt".into(),
            exchange: "ZB".into(),
            verified: true,
            underlying_pair: Pair::default(),
        };
        store.set_exchange_pair(&pair).await.unwrap();

        let read = store.exchange_pair_cache("ZB", "btcusdt").await.unwrap();
        assert!(read.verified);
        assert_eq!(read.symbol, "BTC");

        let missing = store.exchange_pair_cache("ZB", "ethusdt").await;
        assert_eq!(missing.unwrap_err(), ScraperError::NotFound);
    }

    #[tokio::test]
    async fn nft_and_class_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let class = NftClass {
            address: "0xABCDEF0000000000000000000000000000000001".into(),
            blockchain: ETHEREUM.into(),
            name: "Punks".into(),
            symbol: "PUNK".into(),
            contract_type: "ERC721".into(),
        };
        store.set_nft_class(&class).await.unwrap();

        let mut attributes = serde_json::Map::new();
        attributes.insert("hat".into(), serde_json::json!("beanie"));
        let nft = Nft {
            class: class.clone(),
            token_id: "42".into(),
            uri: "ipfs://deadbeef".into(),
            creation_time: chrono::Utc::now(),
            creator_address: "0x0000000000000000000000000000000000000000".into(),
            attributes,
        };
        store.set_nft(&nft).await.unwrap();

        let read = store
            .nft(&class.address, ETHEREUM, "42")
            .await
            .unwrap();
        assert_eq!(read.class.symbol, "PUNK");
        assert_eq!(read.attributes["hat"], serde_json::json!("beanie"));

        let missing = store.nft(&class.address, ETHEREUM, "43").await;
        assert_eq!(missing.unwrap_err(), ScraperError::NotFound);
    }
}

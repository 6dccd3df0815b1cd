//! Pricing oracle.
//!
//! Maps an item's market key to a current monetary value. The engine only
//! ever reads from a locally refreshed cache — a price lookup never blocks
//! on the network, and a cache miss falls back to a configured floor value
//! so a deposit is never rejected for lack of a price.
//!
//! The refresh job itself lives outside the core; it feeds the cache
//! through the `PriceFeed` seam.

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info};

/// Source of bulk price data (market API, dump file, …). Implemented by the
/// externally scheduled refresh job.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn fetch_all(&self) -> Result<HashMap<String, Decimal>>;

    /// Feed name for logging.
    fn name(&self) -> &str;
}

/// Read-through price cache with a floor fallback.
#[derive(Debug)]
pub struct PriceBook {
    prices: RwLock<HashMap<String, Decimal>>,
    floor: Decimal,
}

impl PriceBook {
    pub fn new(floor: Decimal) -> Self {
        PriceBook {
            prices: RwLock::new(HashMap::new()),
            floor,
        }
    }

    /// Current value for a market key. Never negative, never blocks;
    /// unknown keys get the floor value.
    pub fn price(&self, market_key: &str) -> Decimal {
        let prices = self.prices.read().expect("price cache lock poisoned");
        match prices.get(market_key) {
            Some(price) => *price,
            None => {
                debug!(market_key, floor = %self.floor, "Price miss, using floor");
                self.floor
            }
        }
    }

    /// Replace the cache wholesale from a refreshed snapshot.
    pub fn load(&self, snapshot: HashMap<String, Decimal>) {
        let mut prices = self.prices.write().expect("price cache lock poisoned");
        *prices = snapshot;
        info!(entries = prices.len(), "Price cache loaded");
    }

    /// Pull a fresh snapshot through a feed and install it.
    pub async fn refresh(&self, feed: &dyn PriceFeed) -> Result<usize> {
        let snapshot = feed.fetch_all().await?;
        let count = snapshot.len();
        self.load(snapshot);
        info!(feed = feed.name(), entries = count, "Price cache refreshed");
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.prices.read().expect("price cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (the gateway API key) are referenced by env-var name in the
//! config and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub tax: TaxConfig,
    pub pricing: PricingConfig,
    pub gateway: GatewayConfig,
    pub storage: StorageConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Countdown length once the first participant joins.
    pub round_duration_secs: u64,
    /// Pause between a terminal round and opening the next one.
    pub cooldown_secs: u64,
    /// Backoff before retrying a failed round creation.
    pub create_retry_secs: u64,
    /// Dollar value of one ticket (e.g. 0.01 → $1.00 buys 100 tickets).
    pub ticket_ratio: Decimal,
    pub max_items_per_pot: usize,
    pub max_participants: usize,
    pub max_items_per_deposit: usize,
    /// Interval of the pending-deposit reconciliation sweep.
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TaxConfig {
    /// Pot value at which withholding kicks in.
    pub threshold: Decimal,
    /// Target percentage of the pot to withhold.
    pub min_pct: Decimal,
    /// Hard ceiling percentage; never exceeded.
    pub max_pct: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PricingConfig {
    /// Value assigned to items missing from the price cache.
    pub floor_price: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key_env: String,
    /// Poll cadence for the offer-status event stream.
    pub poll_interval_secs: u64,
    /// The gateway's own offer cancellation window; pending deposits expire
    /// on the same clock.
    pub offer_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub database_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventsConfig {
    /// Broadcast channel capacity; slow observers drop, they never block.
    pub buffer: usize,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Reject configurations the engine cannot run with.
    fn validate(&self) -> Result<()> {
        if self.engine.ticket_ratio <= Decimal::ZERO {
            anyhow::bail!("engine.ticket_ratio must be positive");
        }
        if self.tax.min_pct > self.tax.max_pct {
            anyhow::bail!("tax.min_pct must not exceed tax.max_pct");
        }
        if self.engine.max_items_per_deposit == 0 || self.engine.max_items_per_pot == 0 {
            anyhow::bail!("item ceilings must be non-zero");
        }
        Ok(())
    }
}

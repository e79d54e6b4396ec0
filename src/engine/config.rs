//! Engine configuration options.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ConfigError;
use crate::price_process::ProcessParams;

/// Engine configuration. Every field has a default, so a partial JSON file works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tick interval of a Medium `thickSpeed` market.
    pub base_tick_interval_ms: u64,
    /// Spawn a clock per market. Off means ticks only happen through `Engine::tick`.
    pub auto_tick: bool,
    /// Messages buffered per subscriber.
    pub subscriber_buffer: usize,
    /// Consecutive full-buffer misses before a subscriber is dropped.
    pub overflow_limit: u32,
    /// Clock pauses after this long with no subscribers and no trades.
    pub idle_pause_ms: u64,
    /// Max relative gap between a client's quoted price and the live price.
    /// None accepts any quote and always trades at the live price.
    pub price_tolerance: Option<Decimal>,
    /// Default wait for the team's critical section.
    pub trade_timeout_ms: u64,
    /// Wait before an errored market resumes ticking.
    pub fault_backoff_ms: u64,
    /// Seed for every market's price model. None draws a fresh one per market.
    pub seed: Option<u64>,
    pub process: ProcessParams,
    /// Maximum number of events to retain in memory.
    pub max_events: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_tick_interval_ms: 1_000,
            auto_tick: true,
            subscriber_buffer: 64,
            overflow_limit: 3,
            idle_pause_ms: 30_000,
            price_tolerance: None,
            trade_timeout_ms: 5_000,
            fault_backoff_ms: 1_000,
            seed: None,
            process: ProcessParams::default(),
            max_events: 10_000,
        }
    }
}

impl EngineConfig {
    /// No clocks and a fixed seed. Ticks are driven by the caller.
    pub fn manual(seed: u64) -> Self {
        Self {
            auto_tick: false,
            seed: Some(seed),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::InvalidEngine {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn base_tick(&self) -> Duration {
        Duration::from_millis(self.base_tick_interval_ms)
    }

    pub fn idle_pause(&self) -> Duration {
        Duration::from_millis(self.idle_pause_ms)
    }

    pub fn trade_timeout(&self) -> Duration {
        Duration::from_millis(self.trade_timeout_ms)
    }

    pub fn fault_backoff(&self) -> Duration {
        Duration::from_millis(self.fault_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| {
            Err(ConfigError::InvalidEngine {
                reason: reason.to_string(),
            })
        };
        if self.base_tick_interval_ms == 0 {
            return invalid("base tick interval must be positive");
        }
        if self.subscriber_buffer == 0 {
            return invalid("subscriber buffer must hold at least one message");
        }
        if self.overflow_limit == 0 {
            return invalid("overflow limit must be at least 1");
        }
        if self.trade_timeout_ms == 0 {
            return invalid("trade timeout must be positive");
        }
        if self.price_tolerance.is_some_and(|t| t < Decimal::ZERO) {
            return invalid("price tolerance cannot be negative");
        }
        if self.process.base_volatility < Decimal::ZERO {
            return invalid("base volatility cannot be negative");
        }
        if self.process.mean_reversion < Decimal::ZERO || self.process.mean_reversion > Decimal::ONE {
            return invalid("mean reversion must be within [0, 1]");
        }
        Ok(())
    }
}

// 7.0 config.rs: per-team market settings. every knob is a closed tier.
// 7.1 TIER_TABLE is the only place a tier turns into a number. ticks never look at tiers directly.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::Quote;

/// Qualitative level of a market effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    High,
    Medium,
    Low,
    Disabled,
}

impl Tier {
    fn row(&self) -> &'static TierRow {
        match self {
            Tier::High => &TIER_TABLE[0],
            Tier::Medium => &TIER_TABLE[1],
            Tier::Low => &TIER_TABLE[2],
            Tier::Disabled => &TIER_TABLE[3],
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Tier::Disabled)
    }
}

// one row per tier. a column only matters for the config field that uses it.
#[derive(Debug)]
struct TierRow {
    // multiplier on the base volatility unit
    volatility: Decimal,
    // largest fraction of the price a single tick may move. None = uncapped
    max_move: Option<Decimal>,
    // price impact per traded unit, as a fraction of the price
    impact_per_unit: Decimal,
    // multiplier on the base tick interval. None = clock does not tick
    tick_factor: Option<Decimal>,
    fee_rate: Decimal,
    event_probability: Decimal,
    dividend: Decimal,
    crash: Decimal,
}

// High liquidity = deep book = small moves and small impact.
static TIER_TABLE: [TierRow; 4] = [
    TierRow {
        volatility: dec!(3),
        max_move: Some(dec!(0.02)),
        impact_per_unit: dec!(0.00002),
        tick_factor: Some(dec!(0.5)),
        fee_rate: dec!(0.01),
        event_probability: dec!(0.05),
        dividend: dec!(0.05),
        crash: dec!(0.20),
    },
    TierRow {
        volatility: dec!(1.5),
        max_move: Some(dec!(0.05)),
        impact_per_unit: dec!(0.0001),
        tick_factor: Some(dec!(1)),
        fee_rate: dec!(0.005),
        event_probability: dec!(0.02),
        dividend: dec!(0.025),
        crash: dec!(0.10),
    },
    TierRow {
        volatility: dec!(0.5),
        max_move: Some(dec!(0.10)),
        impact_per_unit: dec!(0.0005),
        tick_factor: Some(dec!(2)),
        fee_rate: dec!(0.001),
        event_probability: dec!(0.005),
        dividend: dec!(0.01),
        crash: dec!(0.05),
    },
    TierRow {
        volatility: Decimal::ZERO,
        max_move: None,
        impact_per_unit: Decimal::ZERO,
        tick_factor: None,
        fee_rate: Decimal::ZERO,
        event_probability: Decimal::ZERO,
        dividend: Decimal::ZERO,
        crash: Decimal::ZERO,
    },
];

/// Team market settings as the client sees them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketConfig {
    pub initial_cash: Quote,
    // ISO code shown by the client. not used in arithmetic
    pub currency: String,
    pub market_volatility: Tier,
    pub market_liquidity: Tier,
    // tick interval tier. the field name matches the client contract
    pub thick_speed: Tier,
    pub transaction_fee: Tier,
    pub event_frequency: Tier,
    pub dividend_impact: Tier,
    pub crash_impact: Tier,
    pub allow_short_selling: bool,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self::classroom_default()
    }
}

impl MarketConfig {
    pub fn classroom_default() -> Self {
        Self {
            initial_cash: Quote::new(dec!(10000)),
            currency: "USD".to_string(),
            market_volatility: Tier::Medium,
            market_liquidity: Tier::Medium,
            thick_speed: Tier::Medium,
            transaction_fee: Tier::Low,
            event_frequency: Tier::Low,
            dividend_impact: Tier::Low,
            crash_impact: Tier::Low,
            allow_short_selling: false,
        }
    }

    // frozen prices, no fees, no events. handy for lessons on order mechanics
    pub fn calm() -> Self {
        Self {
            market_volatility: Tier::Disabled,
            market_liquidity: Tier::High,
            thick_speed: Tier::Low,
            transaction_fee: Tier::Disabled,
            event_frequency: Tier::Disabled,
            dividend_impact: Tier::Disabled,
            crash_impact: Tier::Disabled,
            ..Self::classroom_default()
        }
    }

    pub fn turbulent() -> Self {
        Self {
            market_volatility: Tier::High,
            market_liquidity: Tier::Low,
            thick_speed: Tier::High,
            transaction_fee: Tier::Medium,
            event_frequency: Tier::High,
            dividend_impact: Tier::Medium,
            crash_impact: Tier::High,
            allow_short_selling: true,
            ..Self::classroom_default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_cash.value() < Decimal::ZERO {
            return Err(ConfigError::InvalidMarket {
                reason: "initial cash cannot be negative".to_string(),
            });
        }
        if self.currency.trim().is_empty() {
            return Err(ConfigError::InvalidMarket {
                reason: "currency code is required".to_string(),
            });
        }
        Ok(())
    }
}

/// Numeric view of a [`MarketConfig`], resolved once per config change.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketParameters {
    /// Per-tick relative sigma before the asset's own weight.
    pub sigma: Decimal,
    pub max_move: Option<Decimal>,
    pub impact_per_unit: Decimal,
    pub tick_interval: Option<Duration>,
    pub fee_rate: Decimal,
    pub event_probability: Decimal,
    pub dividend_impact: Decimal,
    pub crash_impact: Decimal,
    pub allow_short_selling: bool,
}

impl MarketParameters {
    pub fn resolve(config: &MarketConfig, base_volatility: Decimal, base_tick: Duration) -> Self {
        let tick_interval = config.thick_speed.row().tick_factor.map(|factor| {
            let base_ms = Decimal::from(base_tick.as_millis() as u64);
            let ms = (base_ms * factor).round();
            Duration::from_millis(ms.to_u64().unwrap_or(1).max(1))
        });

        Self {
            sigma: base_volatility * config.market_volatility.row().volatility,
            max_move: config.market_liquidity.row().max_move,
            impact_per_unit: config.market_liquidity.row().impact_per_unit,
            tick_interval,
            fee_rate: config.transaction_fee.row().fee_rate,
            event_probability: config.event_frequency.row().event_probability,
            dividend_impact: config.dividend_impact.row().dividend,
            crash_impact: config.crash_impact.row().crash,
            allow_short_selling: config.allow_short_selling,
        }
    }

    /// Proportional fee on a trade's gross value.
    pub fn fee_for(&self, gross: Quote) -> Quote {
        Quote::new((gross.value() * self.fee_rate).round_dp(4))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid market config: {reason}")]
    InvalidMarket { reason: String },

    #[error("invalid engine config: {reason}")]
    InvalidEngine { reason: String },

    #[error("invalid asset: {reason}")]
    InvalidAsset { reason: String },
}

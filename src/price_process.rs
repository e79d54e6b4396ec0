// 2.0 price_process.rs: per-asset stochastic price step.
// 2.1 PriceModel is the seam the market ticks through. PriceProcess is the default model.
//
// step = price * (drift*dt + sigma*sqrt(dt)*z) + kappa*(base - price)*dt
// then capped to the liquidity max move, rounded to 4dp, clamped to the asset bounds.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, MathematicalOps};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::asset::MarketAsset;
use crate::config::MarketParameters;
use crate::types::Price;

/// Engine-wide constants of the price process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessParams {
    /// Per-tick relative sigma of a Medium-weighted asset at multiplier 1.
    pub base_volatility: Decimal,
    /// Fraction of the gap to the base price closed per tick.
    pub mean_reversion: Decimal,
}

impl Default for ProcessParams {
    fn default() -> Self {
        Self {
            base_volatility: dec!(0.01),
            mean_reversion: dec!(0.02),
        }
    }
}

/// Market-wide event rolled once per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MarketShock {
    /// Every asset drops by `fraction`.
    Crash { fraction: Decimal },
    /// One asset jumps up by `fraction`.
    Dividend { asset_index: usize, fraction: Decimal },
}

impl MarketShock {
    pub fn apply(&self, assets: &mut [MarketAsset]) {
        match *self {
            MarketShock::Crash { fraction } => {
                for asset in assets.iter_mut() {
                    let raw = (asset.price.value() * (Decimal::ONE - fraction)).round_dp(4);
                    asset.price = asset.bounded(raw);
                }
            }
            MarketShock::Dividend { asset_index, fraction } => {
                if let Some(asset) = assets.get_mut(asset_index) {
                    let raw = (asset.price.value() * (Decimal::ONE + fraction)).round_dp(4);
                    asset.price = asset.bounded(raw);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PriceError {
    #[error("arithmetic overflow stepping {symbol}")]
    Overflow { symbol: String },

    #[error("price model failure: {reason}")]
    Model { reason: String },
}

pub trait PriceModel: Send {
    /// Price of `asset` after `dt` ticks.
    fn next(
        &mut self,
        asset: &MarketAsset,
        params: &MarketParameters,
        dt: Decimal,
    ) -> Result<Price, PriceError>;

    /// Market event for this tick, if any.
    fn roll_shock(&mut self, _params: &MarketParameters, _asset_count: usize) -> Option<MarketShock> {
        None
    }
}

/// Seeded mean-reverting random walk. Same seed and same inputs, same path.
#[derive(Debug, Clone)]
pub struct PriceProcess {
    rng: StdRng,
    params: ProcessParams,
}

impl PriceProcess {
    pub fn seeded(seed: u64, params: ProcessParams) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            params,
        }
    }

    fn noise(&mut self, symbol: &str) -> Result<Decimal, PriceError> {
        let z: f64 = self.rng.sample(StandardNormal);
        Decimal::from_f64_retain(z)
            .map(|d| d.round_dp(8))
            .ok_or_else(|| PriceError::Overflow { symbol: symbol.to_string() })
    }
}

impl PriceModel for PriceProcess {
    fn next(
        &mut self,
        asset: &MarketAsset,
        params: &MarketParameters,
        dt: Decimal,
    ) -> Result<Price, PriceError> {
        if dt <= Decimal::ZERO {
            return Ok(asset.price);
        }
        let overflow = || PriceError::Overflow { symbol: asset.symbol.clone() };
        let price = asset.price.value();

        let drift = price.checked_mul(asset.drift * dt).ok_or_else(overflow)?;
        let gap = asset.base_price.value() - price;
        let reversion = gap.checked_mul(self.params.mean_reversion * dt).ok_or_else(overflow)?;

        // zero sigma draws nothing, so the path is the deterministic drift path
        let diffusion = if asset.volatility.is_zero() {
            Decimal::ZERO
        } else {
            let z = self.noise(&asset.symbol)?;
            let sqrt_dt = dt.sqrt().ok_or_else(overflow)?;
            price
                .checked_mul(asset.volatility * sqrt_dt)
                .and_then(|v| v.checked_mul(z))
                .ok_or_else(overflow)?
        };

        let mut step = drift
            .checked_add(reversion)
            .and_then(|v| v.checked_add(diffusion))
            .ok_or_else(overflow)?;

        if let Some(cap) = params.max_move {
            let limit = price * cap;
            step = step.clamp(-limit, limit);
        }

        let raw = price.checked_add(step).ok_or_else(overflow)?.round_dp(4);
        Ok(asset.bounded(raw))
    }

    fn roll_shock(&mut self, params: &MarketParameters, asset_count: usize) -> Option<MarketShock> {
        if asset_count == 0 || params.event_probability.is_zero() {
            return None;
        }
        let crash = params.crash_impact > Decimal::ZERO;
        let dividend = params.dividend_impact > Decimal::ZERO;
        if !crash && !dividend {
            return None;
        }

        let probability = params.event_probability.to_f64().unwrap_or(0.0).clamp(0.0, 1.0);
        if !self.rng.gen_bool(probability) {
            return None;
        }

        let pick_crash = match (crash, dividend) {
            (true, true) => self.rng.gen_bool(0.5),
            (only_crash, _) => only_crash,
        };
        if pick_crash {
            Some(MarketShock::Crash { fraction: params.crash_impact })
        } else {
            Some(MarketShock::Dividend {
                asset_index: self.rng.gen_range(0..asset_count),
                fraction: params.dividend_impact,
            })
        }
    }
}

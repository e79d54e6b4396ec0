//! Tradable assets.
//!
//! An [`AssetSpec`] is the catalog definition, a [`TeamAsset`] records that a team
//! opted into trading it, and a [`MarketAsset`] is its live row inside a snapshot.

use crate::config::{ConfigError, MarketParameters};
use crate::types::{AssetId, Price, TeamId, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Static simulation parameters of an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSpec {
    pub id: AssetId,
    pub symbol: String,
    pub name: String,
    /// Anchor the price reverts towards, and the opening price.
    pub base_price: Price,
    /// Asset's own volatility weight. 1 = market average.
    pub volatility: Decimal,
    /// Per-tick relative drift. None = no drift.
    pub drift: Option<Decimal>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
}

impl AssetSpec {
    pub fn new(symbol: &str, name: &str, base_price: Price) -> Self {
        Self {
            id: AssetId::new(),
            symbol: symbol.to_string(),
            name: name.to_string(),
            base_price,
            volatility: Decimal::ONE,
            drift: None,
            min_price: None,
            max_price: None,
        }
    }

    pub fn with_volatility(mut self, weight: Decimal) -> Self {
        self.volatility = weight;
        self
    }

    pub fn with_drift(mut self, drift: Decimal) -> Self {
        self.drift = Some(drift);
        self
    }

    pub fn with_bounds(mut self, min: Option<Decimal>, max: Option<Decimal>) -> Self {
        self.min_price = min;
        self.max_price = max;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.volatility < Decimal::ZERO {
            return Err(ConfigError::InvalidAsset {
                reason: format!("{}: volatility weight must not be negative", self.symbol),
            });
        }
        if let (Some(min), Some(max)) = (self.min_price, self.max_price) {
            if min > max {
                return Err(ConfigError::InvalidAsset {
                    reason: format!("{}: min price {} above max price {}", self.symbol, min, max),
                });
            }
        }
        if self.min_price.is_some_and(|min| min < Decimal::ZERO) {
            return Err(ConfigError::InvalidAsset {
                reason: format!("{}: min price must not be negative", self.symbol),
            });
        }
        if self.max_price.is_some_and(|max| max < Price::FLOOR) {
            return Err(ConfigError::InvalidAsset {
                reason: format!("{}: max price must be at least {}", self.symbol, Price::FLOOR),
            });
        }
        Ok(())
    }
}

/// Live row of a market snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketAsset {
    pub id: AssetId,
    pub symbol: String,
    pub name: String,
    pub price: Price,
    pub base_price: Price,
    /// Effective per-tick sigma: market tier sigma times the asset weight.
    pub volatility: Decimal,
    /// Raw asset weight, kept so a config change can recompute `volatility`.
    #[serde(skip)]
    pub weight: Decimal,
    #[serde(skip)]
    pub drift: Decimal,
    #[serde(skip)]
    pub min_price: Option<Decimal>,
    #[serde(skip)]
    pub max_price: Option<Decimal>,
}

impl MarketAsset {
    pub fn from_spec(spec: &AssetSpec, price: Price, params: &MarketParameters) -> Self {
        let mut asset = Self {
            id: spec.id,
            symbol: spec.symbol.clone(),
            name: spec.name.clone(),
            price,
            base_price: spec.base_price,
            volatility: Decimal::ZERO,
            weight: spec.volatility,
            drift: spec.drift.unwrap_or(Decimal::ZERO),
            min_price: spec.min_price,
            max_price: spec.max_price,
        };
        asset.reparameterize(params);
        asset.price = asset.bounded(price.value());
        asset
    }

    pub fn reparameterize(&mut self, params: &MarketParameters) {
        self.volatility = params.sigma * self.weight;
    }

    /// Clamp a raw value into the asset's bounds, never below [`Price::FLOOR`].
    /// Bounds are hit exactly, no reflection.
    pub fn bounded(&self, raw: Decimal) -> Price {
        let mut value = raw;
        if let Some(max) = self.max_price {
            value = value.min(max);
        }
        if let Some(min) = self.min_price {
            value = value.max(min);
        }
        Price::new_unchecked(value.max(Price::FLOOR))
    }
}

/// A team's selection of an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamAsset {
    pub team_id: TeamId,
    pub asset: AssetSpec,
    /// Last price observed for this team.
    pub current_price: Price,
    /// Whether any trade has ever touched it.
    pub has_movements: bool,
    pub selected_at: Timestamp,
    /// Soft removal. trades that reference the asset stay valid.
    pub removed_at: Option<Timestamp>,
}

impl TeamAsset {
    pub fn new(team_id: TeamId, asset: AssetSpec, timestamp: Timestamp) -> Self {
        let current_price = asset.base_price;
        Self {
            team_id,
            asset,
            current_price,
            has_movements: false,
            selected_at: timestamp,
            removed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.removed_at.is_none()
    }
}

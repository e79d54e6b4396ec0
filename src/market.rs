//! Per-team market state.
//!
//! [`MarketState`] is the authoritative price table of one team. Only two things
//! mutate it: a clock tick ([`MarketState::tick`]) and the price impact of a trade
//! ([`MarketState::apply_price_impact`]). Config changes and asset sync are staged
//! and folded in at the next tick boundary.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::asset::{AssetSpec, MarketAsset, TeamAsset};
use crate::config::{ConfigError, MarketConfig, MarketParameters};
use crate::price_process::{MarketShock, PriceError, PriceModel, ProcessParams};
use crate::types::{AssetId, Price, TeamId, Timestamp, TradeKind};

/// Immutable view of a market at one tick. Shared, never mutated after publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSnapshot {
    pub team_id: TeamId,
    pub timestamp: Timestamp,
    pub tick: u64,
    pub assets: Vec<MarketAsset>,
}

impl MarketSnapshot {
    pub fn asset(&self, id: AssetId) -> Option<&MarketAsset> {
        self.assets.iter().find(|a| a.id == id)
    }

    pub fn price_of(&self, id: AssetId) -> Option<Price> {
        self.asset(id).map(|a| a.price)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketStatus {
    /// Clock running, trades accepted.
    Active,
    /// Clock idle. trades still accepted and resume it.
    Paused,
    /// Last tick failed. no trades until recovery.
    Errored,
    /// Torn down for good.
    Closed,
}

impl Default for MarketStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl MarketStatus {
    pub fn accepts_trades(&self) -> bool {
        matches!(self, MarketStatus::Active | MarketStatus::Paused)
    }
}

/// What a successful tick produced.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub snapshot: Arc<MarketSnapshot>,
    pub shock: Option<MarketShock>,
    pub config_applied: bool,
    pub assets_applied: Option<usize>,
}

// next committed state, built on copies
struct Staged {
    config: MarketConfig,
    params: MarketParameters,
    assets: Vec<MarketAsset>,
    config_applied: bool,
    assets_applied: Option<usize>,
}

pub struct MarketState {
    team_id: TeamId,
    config: MarketConfig,
    params: MarketParameters,
    assets: Vec<MarketAsset>,
    pending_config: Option<MarketConfig>,
    pending_assets: Option<Vec<TeamAsset>>,
    status: MarketStatus,
    model: Box<dyn PriceModel>,
    latest: Arc<MarketSnapshot>,
    base_volatility: Decimal,
    base_tick: Duration,
    last_fault: Option<String>,
}

impl std::fmt::Debug for MarketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketState")
            .field("team_id", &self.team_id)
            .field("status", &self.status)
            .field("tick", &self.latest.tick)
            .field("assets", &self.assets.len())
            .finish()
    }
}

impl MarketState {
    /// Open a market over the team's active selections. Prices start from each
    /// selection's last observed price.
    pub fn open(
        team_id: TeamId,
        config: MarketConfig,
        selections: &[TeamAsset],
        model: Box<dyn PriceModel>,
        process: &ProcessParams,
        base_tick: Duration,
        now: Timestamp,
    ) -> Result<Self, MarketError> {
        config.validate()?;
        let params = MarketParameters::resolve(&config, process.base_volatility, base_tick);
        let assets = build_assets(selections, &[], &params)?;
        let latest = Arc::new(MarketSnapshot {
            team_id,
            timestamp: now,
            tick: 0,
            assets: assets.clone(),
        });

        Ok(Self {
            team_id,
            config,
            params,
            assets,
            pending_config: None,
            pending_assets: None,
            status: MarketStatus::Active,
            model,
            latest,
            base_volatility: process.base_volatility,
            base_tick,
            last_fault: None,
        })
    }

    pub fn team_id(&self) -> TeamId {
        self.team_id
    }

    pub fn status(&self) -> MarketStatus {
        self.status
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    pub fn params(&self) -> &MarketParameters {
        &self.params
    }

    pub fn assets(&self) -> &[MarketAsset] {
        &self.assets
    }

    pub fn latest(&self) -> Arc<MarketSnapshot> {
        Arc::clone(&self.latest)
    }

    pub fn last_fault(&self) -> Option<&str> {
        self.last_fault.as_deref()
    }

    /// Tick interval of the config that will be live after the next tick.
    pub fn upcoming_interval(&self) -> Option<Duration> {
        match &self.pending_config {
            Some(config) => {
                MarketParameters::resolve(config, self.base_volatility, self.base_tick).tick_interval
            }
            None => self.params.tick_interval,
        }
    }

    /// Live authoritative price, including trade impact since the last tick.
    pub fn price_of(&self, asset_id: AssetId) -> Option<Price> {
        self.assets.iter().find(|a| a.id == asset_id).map(|a| a.price)
    }

    pub fn has_pending(&self) -> bool {
        self.pending_config.is_some() || self.pending_assets.is_some()
    }

    pub fn stage_config(&mut self, config: MarketConfig) -> Result<(), MarketError> {
        self.ensure_open()?;
        config.validate()?;
        self.pending_config = Some(config);
        Ok(())
    }

    /// Stage the team's new active selection set. Assets already trading keep their
    /// live price, new ones start at their stored price.
    pub fn stage_assets(&mut self, selections: Vec<TeamAsset>) -> Result<(), MarketError> {
        self.ensure_open()?;
        for selection in &selections {
            selection.asset.validate()?;
        }
        self.pending_assets = Some(selections);
        Ok(())
    }

    /// Advance one tick. Works on copies and commits only when every step succeeded,
    /// so a failed tick leaves the last good state in place.
    pub fn tick(&mut self, now: Timestamp, dt: Decimal) -> Result<TickOutcome, MarketError> {
        self.ensure_open()?;
        let mut next = self.staged()?;

        // 1. stochastic step per asset
        for asset in next.assets.iter_mut() {
            asset.price = self.model.next(asset, &next.params, dt)?;
        }

        // 2. market event
        let shock = self.model.roll_shock(&next.params, next.assets.len());
        if let Some(shock) = &shock {
            shock.apply(&mut next.assets);
        }

        Ok(self.commit(next, now, shock))
    }

    /// Fold staged changes in without moving prices. For markets whose clock never
    /// ticks on its own. None when nothing was staged.
    pub fn settle(&mut self, now: Timestamp) -> Result<Option<TickOutcome>, MarketError> {
        self.ensure_open()?;
        if !self.has_pending() {
            return Ok(None);
        }
        let next = self.staged()?;
        Ok(Some(self.commit(next, now, None)))
    }

    fn staged(&self) -> Result<Staged, MarketError> {
        let config_applied = self.pending_config.is_some();
        let (config, params) = match &self.pending_config {
            Some(config) => (
                config.clone(),
                MarketParameters::resolve(config, self.base_volatility, self.base_tick),
            ),
            None => (self.config.clone(), self.params.clone()),
        };

        let mut assets = match &self.pending_assets {
            Some(selections) => build_assets(selections, &self.assets, &params)?,
            None => self.assets.clone(),
        };
        if config_applied {
            for asset in assets.iter_mut() {
                asset.reparameterize(&params);
            }
        }

        Ok(Staged {
            assets_applied: self.pending_assets.as_ref().map(|_| assets.len()),
            config_applied,
            config,
            params,
            assets,
        })
    }

    fn commit(&mut self, next: Staged, now: Timestamp, shock: Option<MarketShock>) -> TickOutcome {
        let snapshot = Arc::new(MarketSnapshot {
            team_id: self.team_id,
            timestamp: self.latest.timestamp.next_after(now),
            tick: self.latest.tick + 1,
            assets: next.assets.clone(),
        });
        self.config = next.config;
        self.params = next.params;
        self.assets = next.assets;
        self.pending_config = None;
        self.pending_assets = None;
        self.latest = Arc::clone(&snapshot);

        TickOutcome {
            snapshot,
            shock,
            config_applied: next.config_applied,
            assets_applied: next.assets_applied,
        }
    }

    /// Price an asset would have after a trade: up for buys, down for sells,
    /// proportional to quantity and capped like a tick move. Nothing changes.
    pub fn impacted_price(&self, asset_id: AssetId, kind: TradeKind, quantity: Decimal) -> Result<Price, MarketError> {
        let params = &self.params;
        let asset = self
            .assets
            .iter()
            .find(|a| a.id == asset_id)
            .ok_or(MarketError::UnknownAsset(asset_id))?;
        let overflow = || PriceError::Overflow { symbol: asset.symbol.clone() };

        let mut change = quantity.checked_mul(params.impact_per_unit).ok_or_else(overflow)?;
        if let Some(cap) = params.max_move {
            change = change.min(cap);
        }
        let factor = Decimal::ONE.checked_add(kind.sign() * change).ok_or_else(overflow)?;
        let raw = asset.price.value().checked_mul(factor).ok_or_else(overflow)?.round_dp(4);
        Ok(asset.bounded(raw))
    }

    /// Overwrite an asset's live price. The next tick steps from it.
    pub fn set_price(&mut self, asset_id: AssetId, price: Price) -> Result<(), MarketError> {
        let asset = self
            .assets
            .iter_mut()
            .find(|a| a.id == asset_id)
            .ok_or(MarketError::UnknownAsset(asset_id))?;
        asset.price = asset.bounded(price.value());
        Ok(())
    }

    /// [`Self::impacted_price`] applied in place. Returns the new price.
    pub fn apply_price_impact(
        &mut self,
        asset_id: AssetId,
        kind: TradeKind,
        quantity: Decimal,
    ) -> Result<Price, MarketError> {
        let next = self.impacted_price(asset_id, kind, quantity)?;
        self.set_price(asset_id, next)?;
        Ok(next)
    }

    pub fn pause(&mut self) {
        if self.status == MarketStatus::Active {
            self.status = MarketStatus::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.status == MarketStatus::Paused {
            self.status = MarketStatus::Active;
        }
    }

    pub fn mark_errored(&mut self, reason: &str) {
        if self.status != MarketStatus::Closed {
            self.status = MarketStatus::Errored;
            self.last_fault = Some(reason.to_string());
        }
    }

    /// Leave the errored state. Prices continue from the last committed tick.
    pub fn recover(&mut self) -> bool {
        if self.status != MarketStatus::Errored {
            return false;
        }
        self.status = MarketStatus::Active;
        self.last_fault = None;
        true
    }

    pub fn close(&mut self) {
        self.status = MarketStatus::Closed;
    }

    fn ensure_open(&self) -> Result<(), MarketError> {
        if self.status == MarketStatus::Closed {
            return Err(MarketError::Closed(self.team_id));
        }
        Ok(())
    }
}

fn build_assets(
    selections: &[TeamAsset],
    live: &[MarketAsset],
    params: &MarketParameters,
) -> Result<Vec<MarketAsset>, MarketError> {
    selections
        .iter()
        .filter(|s| s.is_active())
        .map(|selection| {
            selection.asset.validate()?;
            let price = live
                .iter()
                .find(|a| a.id == selection.asset.id)
                .map(|a| a.price)
                .unwrap_or(selection.current_price);
            Ok(MarketAsset::from_spec(&selection.asset, price, params))
        })
        .collect()
}

/// Selections for a fresh team: every spec active at its base price.
pub fn initial_selections(team_id: TeamId, specs: &[AssetSpec], now: Timestamp) -> Vec<TeamAsset> {
    specs
        .iter()
        .map(|spec| TeamAsset::new(team_id, spec.clone(), now))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarketError {
    #[error("market {0} is closed")]
    Closed(TeamId),

    #[error("asset {0} is not traded in this market")]
    UnknownAsset(AssetId),

    #[error(transparent)]
    Price(#[from] PriceError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

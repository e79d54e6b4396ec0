//! Team market lifecycle and read-only queries.

use rust_decimal::Decimal;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

use super::clock::{settle_locked, ClockControl};
use super::core::{Engine, MarketHandle};
use super::results::EngineError;
use crate::asset::AssetSpec;
use crate::config::MarketConfig;
use crate::events::EventPayload;
use crate::hub::SubscriptionHub;
use crate::market::{MarketSnapshot, MarketState, MarketStatus};
use crate::store::StoreError;
use crate::types::{AssetId, Quote, TeamId, Timestamp};

impl Engine {
    /// Create everything a new team needs: stored config, asset selections, a funded
    /// ledger account and a running market. Returns the opening snapshot.
    pub async fn setup_team(
        &self,
        team_id: TeamId,
        config: MarketConfig,
        assets: Vec<AssetSpec>,
    ) -> Result<Arc<MarketSnapshot>, EngineError> {
        config.validate()?;
        for spec in &assets {
            spec.validate()?;
        }

        let collaborators = &self.inner.collaborators;
        collaborators.configs.create(team_id, config.clone()).await?;
        for spec in assets {
            collaborators.assets.select(team_id, spec).await?;
        }
        collaborators.ledger.open_account(team_id, config.initial_cash).await?;

        self.open_market(team_id).await
    }

    /// Start the team's market from its stored config and selections. Opening a
    /// running market leaves it untouched. This is also the only way to bring a
    /// disbanded team back. Returns the latest snapshot.
    pub async fn open_market(&self, team_id: TeamId) -> Result<Arc<MarketSnapshot>, EngineError> {
        let handle = self.open_handle(team_id, true).await?;
        let snapshot = handle.state.lock().await.latest();
        Ok(snapshot)
    }

    pub(super) async fn open_handle(&self, team_id: TeamId, reopen: bool) -> Result<Arc<MarketHandle>, EngineError> {
        let _opening = self.inner.opening.lock().await;
        if self.inner.is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }
        if let Some(handle) = self.inner.market(team_id) {
            return Ok(handle);
        }
        if !reopen && self.inner.disbanded().contains(&team_id) {
            return Err(EngineError::MarketClosed(team_id));
        }

        let collaborators = &self.inner.collaborators;
        let config = collaborators
            .configs
            .get(team_id)
            .await?
            .ok_or(EngineError::TeamNotFound(team_id))?;
        let selections = collaborators.assets.list_selected(team_id).await?;

        let engine_config = &self.inner.config;
        let model = (collaborators.price_models)(team_id, self.inner.next_seed(), &engine_config.process);
        let state = MarketState::open(
            team_id,
            config,
            &selections,
            model,
            &engine_config.process,
            engine_config.base_tick(),
            Timestamp::now(),
        )?;
        let asset_count = state.assets().len();

        let handle = Arc::new(MarketHandle {
            team_id,
            state: tokio::sync::Mutex::new(state),
            hub: SubscriptionHub::new(team_id, engine_config.subscriber_buffer, engine_config.overflow_limit),
            clock: ClockControl::new(),
        });
        if engine_config.auto_tick {
            handle.clock.start(Arc::downgrade(&self.inner), Arc::clone(&handle));
        }
        self.inner.write_markets().insert(team_id, Arc::clone(&handle));
        self.inner.disbanded().remove(&team_id);

        info!(team = %team_id, assets = asset_count, auto_tick = engine_config.auto_tick, "market opened");
        self.inner.emit_event(team_id, EventPayload::MarketOpened { asset_count });
        Ok(handle)
    }

    /// Persist a new config now. The running market picks it up at its next tick.
    pub async fn update_market_config(&self, team_id: TeamId, config: MarketConfig) -> Result<(), EngineError> {
        config.validate()?;
        self.inner.collaborators.configs.update(team_id, config.clone()).await?;

        let Some(handle) = self.inner.market(team_id) else {
            return Ok(());
        };
        let mut state = handle.state.lock().await;
        state.stage_config(config)?;
        self.inner.emit_event(team_id, EventPayload::ConfigStaged);
        self.settle_if_frozen(&handle, &mut state)?;
        drop(state);

        handle.clock.reschedule();
        Ok(())
    }

    /// Select and soft-remove assets. The running market switches to the new set at its
    /// next tick, keeping live prices of assets it already trades.
    pub async fn sync_team_assets(
        &self,
        team_id: TeamId,
        selected: Vec<AssetSpec>,
        removed: Vec<AssetId>,
    ) -> Result<(), EngineError> {
        for spec in &selected {
            spec.validate()?;
        }
        let collaborators = &self.inner.collaborators;
        if collaborators.configs.get(team_id).await?.is_none() {
            return Err(EngineError::TeamNotFound(team_id));
        }

        let selected_count = selected.len();
        for spec in selected {
            collaborators.assets.select(team_id, spec).await?;
        }
        let mut removed_count = 0;
        for asset_id in removed {
            match collaborators.assets.deselect(team_id, asset_id).await {
                Ok(true) => removed_count += 1,
                Ok(false) | Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let Some(handle) = self.inner.market(team_id) else {
            return Ok(());
        };
        let selections = collaborators.assets.list_selected(team_id).await?;
        let mut state = handle.state.lock().await;
        state.stage_assets(selections)?;
        self.inner.emit_event(
            team_id,
            EventPayload::AssetsStaged {
                selected: selected_count,
                removed: removed_count,
            },
        );
        self.settle_if_frozen(&handle, &mut state)?;
        Ok(())
    }

    // a market whose clock never ticks would hold staged changes forever
    fn settle_if_frozen(&self, handle: &MarketHandle, state: &mut MarketState) -> Result<(), EngineError> {
        if self.inner.config.auto_tick && state.upcoming_interval().is_none() {
            settle_locked(&self.inner, handle, state)?;
        }
        Ok(())
    }

    /// Stop the team's market for good: clock stopped, subscribers completed, last
    /// prices written back to the asset store. Stored data stays. Trades, subscribes
    /// and snapshots are refused until [`Engine::open_market`] is called again.
    pub async fn disband_team(&self, team_id: TeamId) -> Result<(), EngineError> {
        let handle = {
            let _opening = self.inner.opening.lock().await;
            let handle = self
                .inner
                .write_markets()
                .remove(&team_id)
                .ok_or(EngineError::MarketUnavailable(team_id))?;
            self.inner.disbanded().insert(team_id);
            handle
        };
        info!(team = %team_id, "team disbanded");
        self.close_market(&handle).await;
        Ok(())
    }

    /// Close every market and refuse new ones.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let _opening = self.inner.opening.lock().await;
        let handles: Vec<Arc<MarketHandle>> = self.inner.write_markets().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            self.close_market(handle).await;
        }
        info!(markets = handles.len(), "engine shut down");
    }

    async fn close_market(&self, handle: &MarketHandle) {
        let team_id = handle.team_id;
        handle.clock.stop().await;

        let assets = {
            let mut state = handle.state.lock().await;
            state.close();
            state.assets().to_vec()
        };
        for asset in &assets {
            if let Err(e) = self.inner.collaborators.assets.record_price(team_id, asset.id, asset.price).await {
                warn!(team = %team_id, asset = %asset.symbol, error = %e, "could not record closing price");
            }
        }

        let completed = handle.hub.close();
        info!(team = %team_id, subscribers = completed, "market closed");
        self.inner.emit_event(team_id, EventPayload::MarketClosed);
    }

    /// Latest published snapshot. Trade impact since then shows in the next one.
    pub async fn snapshot(&self, team_id: TeamId) -> Result<Arc<MarketSnapshot>, EngineError> {
        let handle = self.ensure_market(team_id).await?;
        let snapshot = handle.state.lock().await.latest();
        Ok(snapshot)
    }

    pub async fn market_status(&self, team_id: TeamId) -> Option<MarketStatus> {
        let handle = self.inner.market(team_id)?;
        let status = handle.state.lock().await.status();
        Some(status)
    }

    pub async fn team_cash(&self, team_id: TeamId) -> Result<Quote, EngineError> {
        Ok(self.inner.collaborators.ledger.balance(team_id).await?)
    }

    pub async fn holdings(&self, team_id: TeamId, asset_id: AssetId) -> Result<Decimal, EngineError> {
        Ok(self.inner.collaborators.ledger.holdings(team_id, asset_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tier;
    use crate::engine::EngineConfig;
    use crate::hub::SubscriptionEvent;
    use crate::types::Price;
    use rust_decimal_macros::dec;

    fn spec(symbol: &str, price: Decimal) -> AssetSpec {
        AssetSpec::new(symbol, symbol, Price::new_unchecked(price))
    }

    #[tokio::test]
    async fn setup_funds_and_opens() {
        let engine = Engine::new(EngineConfig::manual(3)).unwrap();
        let team = TeamId::new();
        let snapshot = engine
            .setup_team(team, MarketConfig::default(), vec![spec("AAA", dec!(10)), spec("BBB", dec!(20))])
            .await
            .unwrap();

        assert_eq!(snapshot.assets.len(), 2);
        assert_eq!(engine.team_cash(team).await.unwrap().value(), dec!(10000));
        assert_eq!(engine.market_status(team).await, Some(MarketStatus::Active));
        assert!(engine.setup_team(team, MarketConfig::default(), Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let engine = Engine::new(EngineConfig::manual(3)).unwrap();
        let team = TeamId::new();
        engine.setup_team(team, MarketConfig::default(), vec![spec("AAA", dec!(10))]).await.unwrap();

        engine.tick(team).await.unwrap();
        let first = engine.open_market(team).await.unwrap();
        let second = engine.open_market(team).await.unwrap();
        assert_eq!(first.tick, 1);
        assert_eq!(first, second);
        assert_eq!(engine.market_count(), 1);
        assert!(matches!(engine.open_market(TeamId::new()).await, Err(EngineError::TeamNotFound(_))));
    }

    #[tokio::test]
    async fn config_update_waits_for_tick() {
        let engine = Engine::new(EngineConfig::manual(3)).unwrap();
        let team = TeamId::new();
        let a = spec("AAA", dec!(10));
        engine.setup_team(team, MarketConfig::default(), vec![a.clone()]).await.unwrap();

        engine.update_market_config(team, MarketConfig::calm()).await.unwrap();
        let stored = engine.collaborators().configs.get(team).await.unwrap().unwrap();
        assert_eq!(stored.market_volatility, Tier::Disabled);

        // still the old volatility until the boundary
        let before = engine.snapshot(team).await.unwrap();
        assert!(before.asset(a.id).unwrap().volatility > Decimal::ZERO);

        let after = engine.tick(team).await.unwrap();
        assert_eq!(after.asset(a.id).unwrap().volatility, Decimal::ZERO);
    }

    #[tokio::test]
    async fn asset_sync_applies_at_tick() {
        let engine = Engine::new(EngineConfig::manual(3)).unwrap();
        let team = TeamId::new();
        let a = spec("AAA", dec!(10));
        let b = spec("BBB", dec!(20));
        // no volatility, so the new row's first step leaves it at its base price
        engine.setup_team(team, MarketConfig::calm(), vec![a.clone()]).await.unwrap();

        engine.sync_team_assets(team, vec![b.clone()], vec![a.id]).await.unwrap();
        assert!(engine.snapshot(team).await.unwrap().asset(a.id).is_some());

        let next = engine.tick(team).await.unwrap();
        assert!(next.asset(a.id).is_none());
        assert_eq!(next.asset(b.id).unwrap().price.value(), dec!(20));
    }

    #[tokio::test]
    async fn frozen_clock_applies_changes_immediately() {
        let engine = Engine::new(EngineConfig { seed: Some(3), ..EngineConfig::default() }).unwrap();
        let team = TeamId::new();
        let frozen = MarketConfig { thick_speed: Tier::Disabled, ..MarketConfig::default() };
        let a = spec("AAA", dec!(10));
        engine.setup_team(team, frozen, vec![a.clone()]).await.unwrap();

        let b = spec("BBB", dec!(20));
        engine.sync_team_assets(team, vec![b.clone()], Vec::new()).await.unwrap();
        let snapshot = engine.snapshot(team).await.unwrap();
        assert_eq!(snapshot.assets.len(), 2);
        assert_eq!(snapshot.price_of(a.id).unwrap().value(), dec!(10));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn disband_completes_subscribers_and_keeps_prices() {
        let engine = Engine::new(EngineConfig::manual(3)).unwrap();
        let team = TeamId::new();
        let a = spec("AAA", dec!(10));
        engine.setup_team(team, MarketConfig::turbulent(), vec![a.clone()]).await.unwrap();
        let mut subscription = engine.subscribe(team).await.unwrap();

        let last = engine.tick(team).await.unwrap();
        engine.disband_team(team).await.unwrap();

        assert!(matches!(subscription.recv().await, Some(SubscriptionEvent::Message(_))));
        assert!(matches!(subscription.recv().await, Some(SubscriptionEvent::Completed)));
        assert!(subscription.recv().await.is_none());
        assert!(!engine.is_open(team));
        assert!(matches!(engine.disband_team(team).await, Err(EngineError::MarketUnavailable(_))));

        // nothing reopens a disbanded team by accident
        assert_eq!(engine.snapshot(team).await.unwrap_err(), EngineError::MarketClosed(team));
        assert_eq!(engine.tick(team).await.unwrap_err(), EngineError::MarketClosed(team));
        assert!(matches!(engine.subscribe(team).await, Err(EngineError::MarketClosed(_))));
        let refused = engine
            .buy_asset(crate::engine::TradeParams::new(team, a.id, crate::types::UserId::new(), dec!(1)))
            .await
            .unwrap_err();
        assert_eq!(refused, crate::engine::TradeError::MarketClosed(team));
        assert!(!refused.is_retryable());
        assert!(!engine.is_open(team));

        // an explicit open continues from the stored closing prices
        let reopened = engine.open_market(team).await.unwrap();
        assert_eq!(reopened.price_of(a.id), last.price_of(a.id));
        assert_eq!(engine.snapshot(team).await.unwrap(), reopened);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_markets() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let team = TeamId::new();
        engine.setup_team(team, MarketConfig::default(), vec![spec("AAA", dec!(10))]).await.unwrap();
        engine.shutdown().await;

        assert_eq!(engine.market_count(), 0);
        assert!(matches!(engine.open_market(team).await, Err(EngineError::ShuttingDown)));
        let kinds: Vec<String> = engine
            .team_events(team)
            .iter()
            .map(|e| format!("{:?}", e.payload))
            .collect();
        assert!(kinds.iter().any(|k| k.starts_with("MarketClosed")));
    }
}

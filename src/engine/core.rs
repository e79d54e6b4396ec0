// 8.0 engine/core.rs: main engine. registry of live markets, collaborators, event journal.
// 8.0.1 one MarketHandle per team. its tokio mutex is the team's critical section,
//       shared by the clock and the trade executor. teams never share a lock.

use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};

use super::clock::ClockControl;
use super::config::EngineConfig;
use super::results::EngineError;
use super::subscriptions::MarketEvent;
use crate::events::{Event, EventJournal, EventPayload};
use crate::hub::{PublishReport, SubscriptionHub};
use crate::ledger::{InMemoryLedger, Ledger};
use crate::market::{MarketState, TickOutcome};
use crate::price_process::{PriceModel, PriceProcess, ProcessParams};
use crate::store::{
    InMemoryAssetStore, InMemoryConfigStore, InMemoryRoster, MarketConfigStore, TeamAssetStore,
    TeamRoster,
};
use crate::types::TeamId;

/// Builds the price model of a newly opened market from the team and a seed.
pub type PriceModelFactory = Arc<dyn Fn(TeamId, u64, &ProcessParams) -> Box<dyn PriceModel> + Send + Sync>;

pub fn default_price_models() -> PriceModelFactory {
    Arc::new(|_team: TeamId, seed: u64, params: &ProcessParams| -> Box<dyn PriceModel> {
        Box::new(PriceProcess::seeded(seed, params.clone()))
    })
}

/// Everything the engine talks to but does not own.
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn Ledger>,
    pub configs: Arc<dyn MarketConfigStore>,
    pub assets: Arc<dyn TeamAssetStore>,
    pub roster: Arc<dyn TeamRoster>,
    pub price_models: PriceModelFactory,
}

impl Collaborators {
    pub fn in_memory() -> Self {
        Self {
            ledger: Arc::new(InMemoryLedger::new()),
            configs: Arc::new(InMemoryConfigStore::new()),
            assets: Arc::new(InMemoryAssetStore::new()),
            roster: Arc::new(InMemoryRoster::new()),
            price_models: default_price_models(),
        }
    }

    pub fn with_price_models(mut self, price_models: PriceModelFactory) -> Self {
        self.price_models = price_models;
        self
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Live market of one team.
pub(super) struct MarketHandle {
    pub(super) team_id: TeamId,
    pub(super) state: tokio::sync::Mutex<MarketState>,
    pub(super) hub: SubscriptionHub<MarketEvent>,
    pub(super) clock: ClockControl,
}

pub(super) struct EngineInner {
    pub(super) config: EngineConfig,
    pub(super) collaborators: Collaborators,
    pub(super) markets: RwLock<HashMap<TeamId, Arc<MarketHandle>>>,
    pub(super) journal: Mutex<EventJournal>,
    // disbanded teams. only an explicit open_market brings them back
    pub(super) disbanded: Mutex<HashSet<TeamId>>,
    // one market open at a time, so a team never gets two clocks
    pub(super) opening: tokio::sync::Mutex<()>,
    pub(super) shutting_down: AtomicBool,
}

/** 8.1: main engine struct. cheap to clone, all clones drive the same markets */
#[derive(Clone)]
pub struct Engine {
    pub(super) inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("markets", &self.inner.read_markets().len())
            .field("auto_tick", &self.inner.config.auto_tick)
            .finish()
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_collaborators(config, Collaborators::in_memory())
    }

    pub fn with_collaborators(config: EngineConfig, collaborators: Collaborators) -> Result<Self, EngineError> {
        config.validate()?;
        let journal = EventJournal::new(config.max_events);
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                collaborators,
                markets: RwLock::new(HashMap::new()),
                journal: Mutex::new(journal),
                disbanded: Mutex::new(HashSet::new()),
                opening: tokio::sync::Mutex::new(()),
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.inner.collaborators
    }

    pub fn market_count(&self) -> usize {
        self.inner.read_markets().len()
    }

    pub fn is_open(&self, team_id: TeamId) -> bool {
        self.inner.read_markets().contains_key(&team_id)
    }

    pub fn recent_events(&self, count: usize) -> Vec<Event> {
        self.inner.journal().recent(count)
    }

    pub fn team_events(&self, team_id: TeamId) -> Vec<Event> {
        self.inner.journal().for_team(team_id)
    }

    /// Live market for `team_id`, opened from the stores if it is not running.
    /// Disbanded teams stay closed.
    pub(super) async fn ensure_market(&self, team_id: TeamId) -> Result<Arc<MarketHandle>, EngineError> {
        if let Some(handle) = self.inner.market(team_id) {
            return Ok(handle);
        }
        self.open_handle(team_id, false).await
    }
}

impl EngineInner {
    pub(super) fn read_markets(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TeamId, Arc<MarketHandle>>> {
        self.markets.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(super) fn write_markets(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TeamId, Arc<MarketHandle>>> {
        self.markets.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(super) fn journal(&self) -> MutexGuard<'_, EventJournal> {
        self.journal.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(super) fn disbanded(&self) -> MutexGuard<'_, HashSet<TeamId>> {
        self.disbanded.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(super) fn market(&self, team_id: TeamId) -> Option<Arc<MarketHandle>> {
        self.read_markets().get(&team_id).cloned()
    }

    pub(super) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(super) fn next_seed(&self) -> u64 {
        self.config.seed.unwrap_or_else(|| rand::thread_rng().gen())
    }

    pub(super) fn emit_event(&self, team_id: TeamId, payload: EventPayload) {
        self.journal().record(team_id, payload);
    }

    /// Publish to the team's subscribers and journal anyone dropped for falling behind.
    pub(super) fn publish(&self, handle: &MarketHandle, event: MarketEvent) -> Option<PublishReport> {
        let report = handle.hub.publish(event)?;
        for subscription in &report.disconnected {
            warn!(team = %handle.team_id, subscription = %subscription, "subscriber dropped after overflow");
            self.emit_event(
                handle.team_id,
                EventPayload::SubscriberDisconnected {
                    subscription: subscription.0,
                    reason: "overflow".to_string(),
                },
            );
        }
        Some(report)
    }

    /// Journal and broadcast a committed tick. Caller holds the team's state lock,
    /// which keeps snapshots in tick order.
    pub(super) fn announce_tick(&self, handle: &MarketHandle, outcome: &TickOutcome) {
        let team_id = handle.team_id;
        if outcome.config_applied {
            self.emit_event(team_id, EventPayload::ConfigApplied);
        }
        if let Some(asset_count) = outcome.assets_applied {
            self.emit_event(team_id, EventPayload::AssetsApplied { asset_count });
        }
        if let Some(shock) = outcome.shock {
            self.emit_event(team_id, EventPayload::ShockApplied(shock));
        }

        let snapshot = Arc::clone(&outcome.snapshot);
        let tick = snapshot.tick;
        let delivered = self
            .publish(handle, MarketEvent::Snapshot(snapshot))
            .map(|report| report.delivered)
            .unwrap_or(0);
        debug!(team = %team_id, tick, delivered, "tick published");
    }
}

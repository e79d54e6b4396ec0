// 12.0 store.rs: durable collaborators the engine reads and writes through.
// 12.1 the engine never assumes a backend. in-memory versions ship for tests and the sim binary.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::asset::{AssetSpec, TeamAsset};
use crate::config::MarketConfig;
use crate::types::{AssetId, Price, TeamId, Timestamp, UserId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{what} not found")]
    NotFound { what: String },

    #[error("{what} already exists")]
    AlreadyExists { what: String },

    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },
}

#[async_trait]
pub trait MarketConfigStore: Send + Sync {
    async fn get(&self, team_id: TeamId) -> Result<Option<MarketConfig>, StoreError>;

    async fn create(&self, team_id: TeamId, config: MarketConfig) -> Result<(), StoreError>;

    async fn update(&self, team_id: TeamId, config: MarketConfig) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TeamAssetStore: Send + Sync {
    /// Active selections only, in selection order.
    async fn list_selected(&self, team_id: TeamId) -> Result<Vec<TeamAsset>, StoreError>;

    /// Selecting a soft-removed asset brings the old row back with its history.
    async fn select(&self, team_id: TeamId, asset: AssetSpec) -> Result<TeamAsset, StoreError>;

    /// Soft removal. returns false if the asset was not active.
    async fn deselect(&self, team_id: TeamId, asset_id: AssetId) -> Result<bool, StoreError>;

    /// Returns the previous flag so a failed trade can put it back.
    async fn set_has_movements(&self, team_id: TeamId, asset_id: AssetId, value: bool) -> Result<bool, StoreError>;

    async fn record_price(&self, team_id: TeamId, asset_id: AssetId, price: Price) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TeamRoster: Send + Sync {
    async fn members(&self, team_id: TeamId) -> Result<Vec<UserId>, StoreError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    configs: Mutex<HashMap<TeamId, MarketConfig>>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MarketConfigStore for InMemoryConfigStore {
    async fn get(&self, team_id: TeamId) -> Result<Option<MarketConfig>, StoreError> {
        Ok(lock(&self.configs).get(&team_id).cloned())
    }

    async fn create(&self, team_id: TeamId, config: MarketConfig) -> Result<(), StoreError> {
        let mut configs = lock(&self.configs);
        if configs.contains_key(&team_id) {
            return Err(StoreError::AlreadyExists {
                what: format!("market config for team {}", team_id),
            });
        }
        configs.insert(team_id, config);
        Ok(())
    }

    async fn update(&self, team_id: TeamId, config: MarketConfig) -> Result<(), StoreError> {
        match lock(&self.configs).get_mut(&team_id) {
            Some(existing) => {
                *existing = config;
                Ok(())
            }
            None => Err(StoreError::NotFound {
                what: format!("market config for team {}", team_id),
            }),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAssetStore {
    selections: Mutex<HashMap<TeamId, Vec<TeamAsset>>>,
}

impl InMemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row, soft-removed ones included.
    pub fn all(&self, team_id: TeamId) -> Vec<TeamAsset> {
        lock(&self.selections).get(&team_id).cloned().unwrap_or_default()
    }

    fn with_row<R>(
        &self,
        team_id: TeamId,
        asset_id: AssetId,
        f: impl FnOnce(&mut TeamAsset) -> R,
    ) -> Result<R, StoreError> {
        let mut selections = lock(&self.selections);
        selections
            .get_mut(&team_id)
            .and_then(|rows| rows.iter_mut().find(|row| row.asset.id == asset_id))
            .map(f)
            .ok_or_else(|| StoreError::NotFound {
                what: format!("asset {} for team {}", asset_id, team_id),
            })
    }
}

#[async_trait]
impl TeamAssetStore for InMemoryAssetStore {
    async fn list_selected(&self, team_id: TeamId) -> Result<Vec<TeamAsset>, StoreError> {
        Ok(self.all(team_id).into_iter().filter(TeamAsset::is_active).collect())
    }

    async fn select(&self, team_id: TeamId, asset: AssetSpec) -> Result<TeamAsset, StoreError> {
        let mut selections = lock(&self.selections);
        let rows = selections.entry(team_id).or_default();
        if let Some(row) = rows.iter_mut().find(|row| row.asset.id == asset.id) {
            row.removed_at = None;
            return Ok(row.clone());
        }
        let row = TeamAsset::new(team_id, asset, Timestamp::now());
        rows.push(row.clone());
        Ok(row)
    }

    async fn deselect(&self, team_id: TeamId, asset_id: AssetId) -> Result<bool, StoreError> {
        self.with_row(team_id, asset_id, |row| {
            if row.removed_at.is_some() {
                return false;
            }
            row.removed_at = Some(Timestamp::now());
            true
        })
    }

    async fn set_has_movements(&self, team_id: TeamId, asset_id: AssetId, value: bool) -> Result<bool, StoreError> {
        self.with_row(team_id, asset_id, |row| std::mem::replace(&mut row.has_movements, value))
    }

    async fn record_price(&self, team_id: TeamId, asset_id: AssetId, price: Price) -> Result<(), StoreError> {
        self.with_row(team_id, asset_id, |row| row.current_price = price)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRoster {
    members: Mutex<HashMap<TeamId, Vec<UserId>>>,
}

impl InMemoryRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, team_id: TeamId, user_id: UserId) {
        let mut members = lock(&self.members);
        let team = members.entry(team_id).or_default();
        if !team.contains(&user_id) {
            team.push(user_id);
        }
    }
}

#[async_trait]
impl TeamRoster for InMemoryRoster {
    async fn members(&self, team_id: TeamId) -> Result<Vec<UserId>, StoreError> {
        Ok(lock(&self.members).get(&team_id).cloned().unwrap_or_default())
    }
}

// 8.0.2: request, result and error types for engine operations.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::hub::HubError;
use crate::ledger::LedgerError;
use crate::market::MarketError;
use crate::store::StoreError;
use crate::types::{AssetId, MovementId, Price, Quote, TeamId, TradeKind, TransactionId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeParams {
    #[serde(rename = "teamPublicId")]
    pub team_id: TeamId,
    #[serde(rename = "assetPublicId")]
    pub asset_id: AssetId,
    #[serde(rename = "userPublicId")]
    pub user_id: UserId,
    pub quantity: Decimal,
    /// Price the client saw. Only used for the staleness check.
    #[serde(default)]
    pub price: Option<Price>,
}

impl TradeParams {
    pub fn new(team_id: TeamId, asset_id: AssetId, user_id: UserId, quantity: Decimal) -> Self {
        Self {
            team_id,
            asset_id,
            user_id,
            quantity,
            price: None,
        }
    }

    pub fn quoted_at(mut self, price: Price) -> Self {
        self.price = Some(price);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeNotification {
    #[serde(rename = "userPublicId")]
    pub user_id: UserId,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeResult {
    #[serde(rename = "movementPublicId")]
    pub movement_id: MovementId,
    #[serde(rename = "transactionPublicId")]
    pub transaction_id: TransactionId,
    pub kind: TradeKind,
    /// Server price the trade executed at.
    pub transaction_price: Price,
    pub quantity: Decimal,
    pub fee: Quote,
    pub cash_after: Quote,
    /// Live price after this trade's impact.
    pub price_after: Price,
    pub notifications: Vec<TradeNotification>,
}

/// Trade as broadcast to the team's subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeNotice {
    pub movement_id: MovementId,
    pub user_id: UserId,
    pub asset_id: AssetId,
    pub symbol: String,
    pub kind: TradeKind,
    pub quantity: Decimal,
    pub price: Price,
    pub price_after: Price,
    pub notifications: Vec<TradeNotification>,
}

/// How a caller should react to a failed trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Bad request. never retry as is.
    Validation,
    /// Valid request the team cannot afford.
    Business,
    /// Retry with a fresh price.
    Stale,
    /// Market is (re)initializing. retry shortly.
    Transient,
    Timeout,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TradeError {
    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(Decimal),

    #[error("asset {0} is not traded in this market")]
    UnknownAsset(AssetId),

    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Quote, available: Quote },

    #[error("insufficient holdings: requested {requested}, held {held}")]
    InsufficientHoldings { requested: Decimal, held: Decimal },

    #[error("price moved: quoted {quoted}, current {current}")]
    PriceStale { quoted: Price, current: Price },

    #[error("market of team {0} is unavailable")]
    MarketUnavailable(TeamId),

    #[error("market of team {0} is closed")]
    MarketClosed(TeamId),

    #[error("timed out waiting for the market")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl TradeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TradeError::InvalidQuantity(_) | TradeError::UnknownAsset(_) | TradeError::MarketClosed(_) => {
                ErrorClass::Validation
            }
            TradeError::InsufficientFunds { .. } | TradeError::InsufficientHoldings { .. } => {
                ErrorClass::Business
            }
            TradeError::PriceStale { .. } => ErrorClass::Stale,
            TradeError::MarketUnavailable(_) => ErrorClass::Transient,
            TradeError::Timeout => ErrorClass::Timeout,
            TradeError::Internal(_) => ErrorClass::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Stale | ErrorClass::Transient | ErrorClass::Timeout
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("team {0} has no market config")]
    TeamNotFound(TeamId),

    #[error("market of team {0} is unavailable")]
    MarketUnavailable(TeamId),

    #[error("market of team {0} is closed")]
    MarketClosed(TeamId),

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("Market error: {0}")]
    Market(#[from] MarketError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Subscription error: {0}")]
    Hub(#[from] HubError),
}

impl From<LedgerError> for TradeError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InsufficientCash { required, available } => {
                TradeError::InsufficientFunds { required, available }
            }
            LedgerError::UnknownAccount(team_id) => TradeError::MarketUnavailable(team_id),
            other => TradeError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for TradeError {
    fn from(e: StoreError) -> Self {
        TradeError::Internal(e.to_string())
    }
}

impl From<MarketError> for TradeError {
    fn from(e: MarketError) -> Self {
        match e {
            MarketError::UnknownAsset(asset_id) => TradeError::UnknownAsset(asset_id),
            MarketError::Closed(team_id) => TradeError::MarketClosed(team_id),
            other => TradeError::Internal(other.to_string()),
        }
    }
}

impl From<EngineError> for TradeError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::TeamNotFound(team_id) | EngineError::MarketUnavailable(team_id) => {
                TradeError::MarketUnavailable(team_id)
            }
            EngineError::MarketClosed(team_id) => TradeError::MarketClosed(team_id),
            EngineError::Market(e) => e.into(),
            EngineError::Ledger(e) => e.into(),
            EngineError::Store(e) => e.into(),
            other => TradeError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn error_classes() {
        assert_eq!(TradeError::InvalidQuantity(dec!(0)).class(), ErrorClass::Validation);
        assert_eq!(
            TradeError::InsufficientHoldings { requested: dec!(5), held: dec!(0) }.class(),
            ErrorClass::Business
        );
        assert!(TradeError::Timeout.is_retryable());
        assert!(TradeError::MarketUnavailable(TeamId::new()).is_retryable());
        assert!(!TradeError::UnknownAsset(AssetId::new()).is_retryable());
        assert!(!TradeError::Internal("x".into()).is_retryable());

        let team = TeamId::new();
        let closed: TradeError = EngineError::MarketClosed(team).into();
        assert_eq!(closed, TradeError::MarketClosed(team));
        assert_eq!(closed.class(), ErrorClass::Validation);
        assert!(!closed.is_retryable());
    }

    #[test]
    fn ledger_shortfall_is_a_business_error() {
        let err: TradeError = LedgerError::InsufficientCash {
            required: Quote::new(dec!(10)),
            available: Quote::new(dec!(5)),
        }
        .into();
        assert_eq!(err.class(), ErrorClass::Business);
    }

    #[test]
    fn params_use_public_id_names() {
        let params = TradeParams::new(TeamId::new(), AssetId::new(), UserId::new(), dec!(3));
        let json = serde_json::to_value(&params).unwrap();
        assert!(json.get("teamPublicId").is_some());
        assert!(json.get("assetPublicId").is_some());
        assert!(json.get("userPublicId").is_some());
    }
}

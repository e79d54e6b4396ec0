// 8.3 engine/trades.rs: buy/sell execution.
// 8.3.1 one trade at a time per team: the executor holds the team's state lock from price
//       lookup to price impact, so the clock never ticks mid-trade.
// 8.3.2 cash, holdings and hasMovements change together or not at all.

use rust_decimal::Decimal;
use std::time::Duration;
use tracing::{info, warn};

use super::core::{Engine, MarketHandle};
use super::results::{TradeError, TradeNotice, TradeNotification, TradeParams, TradeResult};
use super::subscriptions::MarketEvent;
use crate::events::{EventPayload, TradeExecutedEvent, TradeRejectedEvent};
use crate::types::{MovementId, Price, Quote, TradeKind, TransactionId, UserId};

impl Engine {
    pub async fn buy_asset(&self, params: TradeParams) -> Result<TradeResult, TradeError> {
        self.execute(TradeKind::Buy, params, None).await
    }

    pub async fn sell_asset(&self, params: TradeParams) -> Result<TradeResult, TradeError> {
        self.execute(TradeKind::Sell, params, None).await
    }

    /// Execute a trade at the live price. `deadline` bounds the wait for the team's
    /// critical section and defaults to the engine's trade timeout.
    pub async fn execute(
        &self,
        kind: TradeKind,
        params: TradeParams,
        deadline: Option<Duration>,
    ) -> Result<TradeResult, TradeError> {
        let result = self.execute_inner(kind, &params, deadline).await;

        if let Err(e) = &result {
            info!(team = %params.team_id, asset = %params.asset_id, %kind, quantity = %params.quantity, error = %e, "trade rejected");
            self.inner.emit_event(
                params.team_id,
                EventPayload::TradeRejected(TradeRejectedEvent {
                    user_id: params.user_id,
                    asset_id: params.asset_id,
                    kind,
                    quantity: params.quantity,
                    reason: e.to_string(),
                }),
            );
        }
        result
    }

    async fn execute_inner(
        &self,
        kind: TradeKind,
        params: &TradeParams,
        deadline: Option<Duration>,
    ) -> Result<TradeResult, TradeError> {
        if params.quantity <= Decimal::ZERO {
            return Err(TradeError::InvalidQuantity(params.quantity));
        }
        let team_id = params.team_id;
        let asset_id = params.asset_id;
        let quantity = params.quantity;

        let handle = self.ensure_market(team_id).await?;
        handle.clock.touch();

        let wait = deadline.unwrap_or_else(|| self.inner.config.trade_timeout());
        let mut state = tokio::time::timeout(wait, handle.state.lock())
            .await
            .map_err(|_| TradeError::Timeout)?;

        if !state.status().accepts_trades() {
            // errored markets recover on the clock. nudge it
            handle.clock.reschedule();
            return Err(TradeError::MarketUnavailable(team_id));
        }

        // 1. authoritative price
        let price = state.price_of(asset_id).ok_or(TradeError::UnknownAsset(asset_id))?;
        if let (Some(tolerance), Some(quoted)) = (self.inner.config.price_tolerance, params.price) {
            let drift = (quoted.value() - price.value()).abs() / price.value();
            if drift > tolerance {
                return Err(TradeError::PriceStale { quoted, current: price });
            }
        }

        // 2. fee. a quantity whose value does not fit is rejected, not wrapped
        let trade_params = state.params();
        let too_large = || TradeError::InvalidQuantity(quantity);
        let gross = quantity.checked_mul(price.value()).ok_or_else(too_large)?.round_dp(4);
        let fee = trade_params.fee_for(Quote::new(gross));
        let allow_short = trade_params.allow_short_selling;

        // 3. cash and holdings, checked before the transaction is touched
        let collaborators = &self.inner.collaborators;
        let mut tx = collaborators.ledger.begin(team_id).await?;
        let held = tx.holdings(asset_id);
        let available = tx.balance();
        match kind {
            TradeKind::Buy => {
                let cost = Quote::new(gross.checked_add(fee.value()).ok_or_else(too_large)?);
                if cost > available {
                    return Err(TradeError::InsufficientFunds { required: cost, available });
                }
                held.checked_add(quantity).ok_or_else(too_large)?;
                tx.debit(cost)?;
                tx.adjust_holdings(asset_id, quantity);
            }
            TradeKind::Sell => {
                if held < quantity && !allow_short {
                    return Err(TradeError::InsufficientHoldings { requested: quantity, held });
                }
                let proceeds = gross - fee.value();
                available.value().checked_add(proceeds).ok_or_else(too_large)?;
                held.checked_sub(quantity).ok_or_else(too_large)?;
                tx.credit(Quote::new(proceeds));
                tx.adjust_holdings(asset_id, -quantity);
            }
        }
        let cash_after = tx.balance();

        // 4. price impact, worked out before anything is committed
        let price_after = state.impacted_price(asset_id, kind, quantity)?;

        // 5. hasMovements, undone if the ledger refuses the commit
        let had_movements = collaborators.assets.set_has_movements(team_id, asset_id, true).await?;
        if let Err(e) = tx.commit().await {
            if !had_movements {
                if let Err(restore) = collaborators.assets.set_has_movements(team_id, asset_id, false).await {
                    warn!(team = %team_id, asset = %asset_id, error = %restore, "could not restore hasMovements");
                }
            }
            return Err(e.into());
        }
        if let Err(e) = state.set_price(asset_id, price_after) {
            warn!(team = %team_id, asset = %asset_id, error = %e, "price impact skipped");
        }
        if let Err(e) = collaborators.assets.record_price(team_id, asset_id, price_after).await {
            warn!(team = %team_id, asset = %asset_id, error = %e, "could not record price");
        }

        // 6. ids and notifications
        let movement_id = MovementId::new();
        let transaction_id = TransactionId::new();
        let symbol = state
            .assets()
            .iter()
            .find(|a| a.id == asset_id)
            .map(|a| a.symbol.clone())
            .unwrap_or_else(|| asset_id.to_string());
        let notifications = self
            .notifications(&handle, params.user_id, kind, quantity, &symbol, price)
            .await;

        self.inner.publish(
            &handle,
            MarketEvent::Trade(TradeNotice {
                movement_id,
                user_id: params.user_id,
                asset_id,
                symbol: symbol.clone(),
                kind,
                quantity,
                price,
                price_after,
                notifications: notifications.clone(),
            }),
        );
        self.inner.emit_event(
            team_id,
            EventPayload::TradeExecuted(TradeExecutedEvent {
                movement_id,
                user_id: params.user_id,
                asset_id,
                kind,
                quantity,
                price,
                fee,
                price_after,
                cash_after,
            }),
        );
        drop(state);

        info!(team = %team_id, asset = %symbol, %kind, %quantity, %price, %fee, %price_after, "trade executed");
        Ok(TradeResult {
            movement_id,
            transaction_id,
            kind,
            transaction_price: price,
            quantity,
            fee,
            cash_after,
            price_after,
            notifications,
        })
    }

    async fn notifications(
        &self,
        handle: &MarketHandle,
        actor: UserId,
        kind: TradeKind,
        quantity: Decimal,
        symbol: &str,
        price: Price,
    ) -> Vec<TradeNotification> {
        let members = match self.inner.collaborators.roster.members(handle.team_id).await {
            Ok(members) => members,
            Err(e) => {
                warn!(team = %handle.team_id, error = %e, "roster unavailable, notifying the trader only");
                Vec::new()
            }
        };

        let mut notifications = vec![TradeNotification {
            user_id: actor,
            message: format!("You {} {} {} at {}", kind.verb(), quantity, symbol, price),
        }];
        notifications.extend(members.into_iter().filter(|member| *member != actor).map(|member| {
            TradeNotification {
                user_id: member,
                message: format!("A teammate {} {} {} at {}", kind.verb(), quantity, symbol, price),
            }
        }));
        notifications
    }
}

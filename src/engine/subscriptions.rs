//! Live market feeds.
//!
//! Two ways in: [`Engine::subscribe`] hands back a pull-style [`MarketSubscription`],
//! [`Engine::subscribe_to_market`] runs [`MarketHandlers`] callbacks on a task.

use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use super::core::Engine;
use super::results::{EngineError, TradeNotice};
use crate::hub::{self, HubError, Subscription, SubscriptionEvent, UnsubscribeHandle};
use crate::market::MarketSnapshot;
use crate::types::TeamId;

/// Payload of every message a team's subscribers receive.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MarketEvent {
    Snapshot(Arc<MarketSnapshot>),
    Trade(TradeNotice),
}

pub type MarketSubscription = Subscription<MarketEvent>;

/// Callbacks for [`Engine::subscribe_to_market`]. Calls for one subscription never overlap.
pub trait MarketHandlers: Send + 'static {
    fn on_data(&mut self, snapshot: Arc<MarketSnapshot>);

    fn on_trade(&mut self, _notice: TradeNotice) {}

    /// Called at most once. no other callback follows it.
    fn on_error(&mut self, _error: HubError) {}

    /// Called when the market is torn down.
    fn on_complete(&mut self) {}
}

impl Engine {
    /// Receive every snapshot and trade notice published for the team from now on.
    /// Opens the market if it is not running.
    pub async fn subscribe(&self, team_id: TeamId) -> Result<MarketSubscription, EngineError> {
        let handle = self.ensure_market(team_id).await?;
        let subscription = handle.hub.subscribe()?;
        handle.clock.touch();
        debug!(team = %team_id, subscription = %subscription.id(), subscribers = handle.hub.subscriber_count(), "subscriber joined");
        Ok(subscription)
    }

    pub async fn subscribe_to_market<H: MarketHandlers>(
        &self,
        team_id: TeamId,
        mut handlers: H,
    ) -> Result<UnsubscribeHandle, EngineError> {
        let subscription = self.subscribe(team_id).await?;
        let (handle, _task) = hub::drive(subscription, move |event| match event {
            SubscriptionEvent::Message(envelope) => match envelope.event {
                MarketEvent::Snapshot(snapshot) => handlers.on_data(snapshot),
                MarketEvent::Trade(notice) => handlers.on_trade(notice),
            },
            SubscriptionEvent::Failed(error) => handlers.on_error(error),
            SubscriptionEvent::Completed => handlers.on_complete(),
        });
        Ok(handle)
    }

    pub fn subscriber_count(&self, team_id: TeamId) -> usize {
        self.inner
            .market(team_id)
            .map(|handle| handle.hub.subscriber_count())
            .unwrap_or(0)
    }
}

// 11.0: every market state transition produces an event. used for audit trails and
// post-lesson review. the EventPayload enum lists all event types.

use crate::price_process::MarketShock;
use crate::types::{AssetId, MovementId, Price, Quote, TeamId, Timestamp, TradeKind, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub team_id: TeamId,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    // Lifecycle events
    MarketOpened { asset_count: usize },
    MarketClosed,
    MarketFaulted { reason: String },
    MarketRecovered,

    // Parameter events
    ConfigStaged,
    ConfigApplied,
    AssetsStaged { selected: usize, removed: usize },
    AssetsApplied { asset_count: usize },
    ShockApplied(MarketShock),

    // Trade events
    TradeExecuted(TradeExecutedEvent),
    TradeRejected(TradeRejectedEvent),

    // Delivery events
    SubscriberDisconnected { subscription: u64, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeExecutedEvent {
    pub movement_id: MovementId,
    pub user_id: UserId,
    pub asset_id: AssetId,
    pub kind: TradeKind,
    pub quantity: Decimal,
    pub price: Price,
    pub fee: Quote,
    pub price_after: Price,
    pub cash_after: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRejectedEvent {
    pub user_id: UserId,
    pub asset_id: AssetId,
    pub kind: TradeKind,
    pub quantity: Decimal,
    pub reason: String,
}

/// Bounded in-memory event log. oldest entries fall off first.
#[derive(Debug)]
pub struct EventJournal {
    events: VecDeque<Event>,
    next_id: u64,
    max_events: usize,
}

impl EventJournal {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::new(),
            next_id: 1,
            max_events,
        }
    }

    pub fn record(&mut self, team_id: TeamId, payload: EventPayload) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;

        tracing::debug!(event = id.0, team = %team_id, ?payload, "journal");
        self.events.push_back(Event {
            id,
            timestamp: Timestamp::now(),
            team_id,
            payload,
        });

        while self.events.len() > self.max_events {
            self.events.pop_front();
        }
        id
    }

    pub fn recent(&self, count: usize) -> Vec<Event> {
        let start = self.events.len().saturating_sub(count);
        self.events.iter().skip(start).cloned().collect()
    }

    pub fn for_team(&self, team_id: TeamId) -> Vec<Event> {
        self.events.iter().filter(|e| e.team_id == team_id).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

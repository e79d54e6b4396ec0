// 8.0: core engine. owns one market per team and coordinates clocks, subscriptions,
// trade execution and team lifecycle. collaborators (ledger, stores, roster) are traits.

mod clock;
mod config;
mod core;
mod lifecycle;
mod results;
mod subscriptions;
mod trades;

pub use config::EngineConfig;
pub use core::{default_price_models, Collaborators, Engine, PriceModelFactory};
pub use results::{
    EngineError, ErrorClass, TradeError, TradeNotice, TradeNotification, TradeParams, TradeResult,
};
pub use subscriptions::{MarketEvent, MarketHandlers, MarketSubscription};

// tradesim-core: classroom trading simulator engine.
// one market per team: prices evolve on a per-team clock, snapshots fan out to every
// subscriber, buy/sell orders execute one at a time against the live price.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: TeamId, AssetId, UserId, Price, Quote, Timestamp
//   2.x  price_process.rs: seeded mean-reverting price step, market shocks
//   3.x  asset.rs: asset specs, live market rows, team selections
//   4.x  hub.rs: per-market fan-out, bounded subscriber buffers, unsubscribe handles
//   5.x  market.rs: per-team authoritative state, ticks, price impact
//   7.x  config.rs: market tiers, the tier table, presets
//   8.x  engine/: engine core: clocks, subscriptions, trades, lifecycle
//   10.x ledger.rs: team cash + holdings, transactional
//   11.x events.rs: state transition events for audit
//   12.x store.rs: config, asset selection and roster collaborators
//   13.x telemetry.rs: tracing subscriber setup

pub mod asset;
pub mod config;
pub mod engine;
pub mod events;
pub mod hub;
pub mod ledger;
pub mod market;
pub mod price_process;
pub mod store;
pub mod telemetry;
pub mod types;

// re exports for convenience
pub use asset::*;
pub use config::*;
pub use engine::*;
pub use events::*;
pub use hub::{Envelope, HubError, Subscription, SubscriptionEvent, SubscriptionHub, SubscriptionId, UnsubscribeHandle};
pub use ledger::*;
pub use market::*;
pub use price_process::*;
pub use store::*;
pub use telemetry::init_tracing;
pub use types::*;

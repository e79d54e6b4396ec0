//! Classroom trading simulator.
//!
//! Runs scripted scenarios against the engine: manual ticks and trades, a live feed,
//! concurrent trading, fault isolation between teams, config changes and teardown.
//! Set TRADESIM_CONFIG to a JSON engine config file to override the defaults.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tradesim_core::*;

type SimResult = Result<(), Box<dyn Error>>;

#[tokio::main]
async fn main() -> SimResult {
    init_tracing("info");

    let base = load_config()?;
    println!("Classroom Trading Simulator");
    println!("Per-team markets, live snapshots, serialized trades\n");

    scenario_1_manual_trading(&base).await?;
    scenario_2_live_feed(&base).await?;
    scenario_3_concurrent_trades(&base).await?;
    scenario_4_fault_isolation(&base).await?;
    scenario_5_config_and_teardown(&base).await?;

    println!("\nAll simulations completed successfully.");
    Ok(())
}

fn load_config() -> Result<EngineConfig, Box<dyn Error>> {
    match std::env::var("TRADESIM_CONFIG") {
        Ok(path) => {
            let json = std::fs::read_to_string(&path)?;
            let config = EngineConfig::from_json(&json)?;
            tracing::info!(%path, "engine config loaded");
            Ok(config)
        }
        Err(_) => Ok(EngineConfig::default()),
    }
}

fn catalog() -> Vec<AssetSpec> {
    vec![
        AssetSpec::new("ACME", "Acme Corp", Price::new_unchecked(dec!(10))),
        AssetSpec::new("GLOBX", "Globex", Price::new_unchecked(dec!(42.5))).with_volatility(dec!(1.5)),
        AssetSpec::new("INIT", "Initech", Price::new_unchecked(dec!(3.2)))
            .with_drift(dec!(0.001))
            .with_bounds(Some(dec!(1)), Some(dec!(10))),
    ]
}

fn print_snapshot(snapshot: &MarketSnapshot) {
    let prices: Vec<String> = snapshot
        .assets
        .iter()
        .map(|a| format!("{} {}", a.symbol, a.price))
        .collect();
    println!("  tick {:>3} @ {}: {}", snapshot.tick, snapshot.timestamp.as_millis(), prices.join(", "));
}

/// Deterministic ticks driven by hand, one buy and one sell.
async fn scenario_1_manual_trading(base: &EngineConfig) -> SimResult {
    println!("Scenario 1: Manual Ticks and Trades\n");

    let engine = Engine::new(EngineConfig { auto_tick: false, seed: Some(7), ..base.clone() })?;
    let team = TeamId::new();
    let assets = catalog();
    let acme = assets[0].id;
    let opening = engine.setup_team(team, MarketConfig::classroom_default(), assets).await?;
    print_snapshot(&opening);

    for _ in 0..3 {
        print_snapshot(&*engine.tick(team).await?);
    }

    let alice = UserId::new();
    let bought = engine.buy_asset(TradeParams::new(team, acme, alice, dec!(50))).await?;
    println!(
        "\n  Alice buys 50 ACME at {} (fee {}), cash now {}",
        bought.transaction_price, bought.fee, bought.cash_after
    );

    let sold = engine.sell_asset(TradeParams::new(team, acme, alice, dec!(20))).await?;
    println!("  Alice sells 20 ACME at {}, cash now {}", sold.transaction_price, sold.cash_after);

    match engine.sell_asset(TradeParams::new(team, acme, alice, dec!(500))).await {
        Ok(_) => println!("  unexpected: oversized sell went through"),
        Err(e) => println!("  Oversized sell rejected ({:?}): {}", e.class(), e),
    }
    println!("  Holdings: {} ACME\n", engine.holdings(team, acme).await?);
    Ok(())
}

struct Printer {
    label: &'static str,
}

impl MarketHandlers for Printer {
    fn on_data(&mut self, snapshot: Arc<MarketSnapshot>) {
        print!("  [{}] ", self.label);
        print_snapshot(&snapshot);
    }

    fn on_trade(&mut self, notice: TradeNotice) {
        println!("  [{}] trade: {} {} {} at {}", self.label, notice.kind, notice.quantity, notice.symbol, notice.price);
    }

    fn on_error(&mut self, error: HubError) {
        println!("  [{}] feed failed: {}", self.label, error);
    }

    fn on_complete(&mut self) {
        println!("  [{}] feed completed", self.label);
    }
}

/// Two subscribers on an automatically ticking market.
async fn scenario_2_live_feed(base: &EngineConfig) -> SimResult {
    println!("Scenario 2: Live Feed\n");

    let engine = Engine::new(EngineConfig { base_tick_interval_ms: 100, auto_tick: true, ..base.clone() })?;
    let team = TeamId::new();
    let assets = catalog();
    let acme = assets[0].id;
    engine.setup_team(team, MarketConfig::turbulent(), assets).await?;

    let first = engine.subscribe_to_market(team, Printer { label: "phone" }).await?;
    let second = engine.subscribe_to_market(team, Printer { label: "tablet" }).await?;
    tokio::time::sleep(Duration::from_millis(180)).await;

    engine.buy_asset(TradeParams::new(team, acme, UserId::new(), dec!(10))).await?;
    tokio::time::sleep(Duration::from_millis(120)).await;

    first.unsubscribe();
    println!("  phone unsubscribed");
    tokio::time::sleep(Duration::from_millis(120)).await;
    second.unsubscribe();

    engine.shutdown().await;
    println!();
    Ok(())
}

/// Many trades racing on one team. Cash always reconciles.
async fn scenario_3_concurrent_trades(base: &EngineConfig) -> SimResult {
    println!("Scenario 3: Concurrent Trades\n");

    let engine = Engine::new(EngineConfig { auto_tick: false, seed: Some(11), ..base.clone() })?;
    let team = TeamId::new();
    let assets = catalog();
    let acme = assets[0].id;
    engine.setup_team(team, MarketConfig::classroom_default(), assets).await?;

    let mut tasks = Vec::new();
    for i in 0..40 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            let params = TradeParams::new(team, acme, UserId::new(), Decimal::from(1 + i % 7));
            if i % 3 == 0 {
                engine.sell_asset(params).await
            } else {
                engine.buy_asset(params).await
            }
        }));
    }

    let mut spent = Decimal::ZERO;
    let (mut filled, mut rejected) = (0, 0);
    for task in tasks {
        match task.await? {
            Ok(result) => {
                filled += 1;
                let gross = result.quantity * result.transaction_price.value();
                spent += match result.kind {
                    TradeKind::Buy => gross + result.fee.value(),
                    TradeKind::Sell => -(gross - result.fee.value()),
                };
            }
            Err(_) => rejected += 1,
        }
    }

    let cash = engine.team_cash(team).await?;
    println!("  {} filled, {} rejected", filled, rejected);
    println!("  Cash {} + net spend {} = {}", cash, spent, cash.value() + spent);
    println!("  Holdings: {} ACME\n", engine.holdings(team, acme).await?);
    Ok(())
}

struct Faulty;

impl PriceModel for Faulty {
    fn next(&mut self, asset: &MarketAsset, _: &MarketParameters, _: Decimal) -> Result<Price, PriceError> {
        Err(PriceError::Model { reason: format!("feed for {} went dark", asset.symbol) })
    }
}

/// One team's price model fails. The other team never notices.
async fn scenario_4_fault_isolation(base: &EngineConfig) -> SimResult {
    println!("Scenario 4: Fault Isolation\n");

    let healthy = TeamId::new();
    let broken = TeamId::new();
    let defaults = default_price_models();
    let models: PriceModelFactory = Arc::new(move |team: TeamId, seed: u64, params: &ProcessParams| -> Box<dyn PriceModel> {
        if team == broken {
            Box::new(Faulty)
        } else {
            defaults(team, seed, params)
        }
    });
    let engine = Engine::with_collaborators(
        EngineConfig { auto_tick: false, seed: Some(5), ..base.clone() },
        Collaborators::in_memory().with_price_models(models),
    )?;
    engine.setup_team(healthy, MarketConfig::default(), catalog()).await?;
    engine.setup_team(broken, MarketConfig::default(), catalog()).await?;

    let mut watcher = engine.subscribe(broken).await?;
    match engine.tick(broken).await {
        Ok(_) => println!("  unexpected: broken market ticked"),
        Err(e) => println!("  broken team tick failed: {}", e),
    }
    if let Some(SubscriptionEvent::Failed(e)) = watcher.recv().await {
        println!("  broken team subscriber told: {}", e);
    }
    println!("  broken team status: {:?}", engine.market_status(broken).await);

    print!("  healthy team keeps going: ");
    print_snapshot(&*engine.tick(healthy).await?);
    println!();
    Ok(())
}

/// Config change at the tick boundary, then disband.
async fn scenario_5_config_and_teardown(base: &EngineConfig) -> SimResult {
    println!("Scenario 5: Config Change and Teardown\n");

    let engine = Engine::new(EngineConfig { auto_tick: false, seed: Some(9), ..base.clone() })?;
    let team = TeamId::new();
    engine.setup_team(team, MarketConfig::turbulent(), catalog()).await?;
    print_snapshot(&*engine.tick(team).await?);

    engine.update_market_config(team, MarketConfig::calm()).await?;
    println!("  switched to calm, applies at the next tick");
    for _ in 0..3 {
        print_snapshot(&*engine.tick(team).await?);
    }

    let mut watcher = engine.subscribe(team).await?;
    engine.disband_team(team).await?;
    if let Some(SubscriptionEvent::Completed) = watcher.recv().await {
        println!("  subscriber completed on disband");
    }

    for event in engine.recent_events(5) {
        println!("  event {}: {:?}", event.id.0, event.payload);
    }
    Ok(())
}

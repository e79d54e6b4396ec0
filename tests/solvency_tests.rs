//! Solvency tests
//!
//! Every unit of cash is accounted for: team cash always equals the opening cash minus
//! what buys cost plus what sells returned, no matter how trades interleave.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tradesim_core::*;

struct Team {
    engine: Engine,
    team: TeamId,
    asset: AssetId,
    opening_cash: Decimal,
}

async fn team_with(config: MarketConfig, seed: u64) -> Team {
    let engine = Engine::new(EngineConfig::manual(seed)).unwrap();
    let team = TeamId::new();
    let spec = AssetSpec::new("ACME", "Acme Corp", Price::new_unchecked(dec!(10)));
    let asset = spec.id;
    let opening_cash = config.initial_cash.value();
    engine.setup_team(team, config, vec![spec]).await.unwrap();
    Team { engine, team, asset, opening_cash }
}

fn cash_delta(result: &TradeResult) -> Decimal {
    let gross = (result.quantity * result.transaction_price.value()).round_dp(4);
    match result.kind {
        TradeKind::Buy => -(gross + result.fee.value()),
        TradeKind::Sell => gross - result.fee.value(),
    }
}

fn holdings_delta(result: &TradeResult) -> Decimal {
    result.kind.sign() * result.quantity
}

/// Fires `count` trades at once, alternating buys and sells, and returns the fills.
async fn race(t: &Team, count: usize, quantity: impl Fn(usize) -> Decimal) -> Vec<TradeResult> {
    let mut tasks = Vec::with_capacity(count);
    for i in 0..count {
        let engine = t.engine.clone();
        let params = TradeParams::new(t.team, t.asset, UserId::new(), quantity(i));
        tasks.push(tokio::spawn(async move {
            if i % 3 == 2 {
                engine.sell_asset(params).await
            } else {
                engine.buy_asset(params).await
            }
        }));
    }

    let mut fills = Vec::new();
    for task in tasks {
        if let Ok(result) = task.await.unwrap() {
            fills.push(result);
        }
    }
    fills
}

mod scenarios {
    use super::*;

    #[tokio::test]
    async fn oversized_buy_leaves_cash_untouched() {
        let t = team_with(MarketConfig { initial_cash: Quote::new(dec!(1000)), ..MarketConfig::calm() }, 1).await;
        let user = UserId::new();

        let first = t.engine.buy_asset(TradeParams::new(t.team, t.asset, user, dec!(50))).await.unwrap();
        assert_eq!(first.transaction_price.value(), dec!(10));
        assert_eq!(first.cash_after.value(), dec!(500));

        let err = t
            .engine
            .buy_asset(TradeParams::new(t.team, t.asset, user, dec!(1000)))
            .await
            .unwrap_err();
        match err {
            TradeError::InsufficientFunds { required, available } => {
                assert_eq!(available.value(), dec!(500));
                assert!(required.value() > dec!(10000));
            }
            other => panic!("expected insufficient funds, got {other:?}"),
        }
        assert_eq!(err.class(), ErrorClass::Business);
        assert_eq!(t.engine.team_cash(t.team).await.unwrap().value(), dec!(500));
        assert_eq!(t.engine.holdings(t.team, t.asset).await.unwrap(), dec!(50));
    }

    #[tokio::test]
    async fn short_sale_credits_proceeds() {
        let base = MarketConfig { initial_cash: Quote::new(dec!(1000)), ..MarketConfig::calm() };
        let user = UserId::new();

        let strict = team_with(base.clone(), 1).await;
        let err = strict
            .engine
            .sell_asset(TradeParams::new(strict.team, strict.asset, user, dec!(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, TradeError::InsufficientHoldings { .. }));
        assert_eq!(strict.engine.team_cash(strict.team).await.unwrap().value(), dec!(1000));

        let lenient = team_with(MarketConfig { allow_short_selling: true, ..base }, 1).await;
        let sold = lenient
            .engine
            .sell_asset(TradeParams::new(lenient.team, lenient.asset, user, dec!(5)))
            .await
            .unwrap();
        assert_eq!(sold.cash_after.value(), dec!(1050));
        assert_eq!(lenient.engine.holdings(lenient.team, lenient.asset).await.unwrap(), dec!(-5));
        // a sale pushes the price down
        assert!(sold.price_after.value() < dec!(10));
    }

    #[tokio::test]
    async fn rejected_trades_change_nothing() {
        let t = team_with(MarketConfig::default(), 4).await;
        let user = UserId::new();
        t.engine.buy_asset(TradeParams::new(t.team, t.asset, user, dec!(10))).await.unwrap();
        let cash = t.engine.team_cash(t.team).await.unwrap();
        let price = t.engine.snapshot(t.team).await.unwrap().price_of(t.asset);

        for quantity in [dec!(0), dec!(-3), dec!(11)] {
            assert!(t.engine.sell_asset(TradeParams::new(t.team, t.asset, user, quantity)).await.is_err());
        }
        assert!(t.engine.buy_asset(TradeParams::new(t.team, t.asset, user, dec!(1_000_000))).await.is_err());

        assert_eq!(t.engine.team_cash(t.team).await.unwrap(), cash);
        assert_eq!(t.engine.holdings(t.team, t.asset).await.unwrap(), dec!(10));
        assert_eq!(t.engine.snapshot(t.team).await.unwrap().price_of(t.asset), price);
    }
}

mod concurrency {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_trades_reconcile() {
        let t = team_with(
            MarketConfig { initial_cash: Quote::new(dec!(100000)), ..MarketConfig::turbulent() },
            7,
        )
        .await;
        for _ in 0..3 {
            t.engine.tick(t.team).await.unwrap();
        }

        let fills = race(&t, 60, |i| Decimal::from(1 + i % 9)).await;
        assert!(!fills.is_empty());

        let expected_cash: Decimal = t.opening_cash + fills.iter().map(cash_delta).sum::<Decimal>();
        let expected_holdings: Decimal = fills.iter().map(holdings_delta).sum();
        assert_eq!(t.engine.team_cash(t.team).await.unwrap().value(), expected_cash);
        assert_eq!(t.engine.holdings(t.team, t.asset).await.unwrap(), expected_holdings);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_buys_never_overdraw() {
        let t = team_with(MarketConfig { initial_cash: Quote::new(dec!(1000)), ..MarketConfig::default() }, 3).await;

        let engine = t.engine.clone();
        let mut tasks = Vec::new();
        for _ in 0..50 {
            let engine = engine.clone();
            let params = TradeParams::new(t.team, t.asset, UserId::new(), dec!(3));
            tasks.push(tokio::spawn(async move { engine.buy_asset(params).await }));
        }

        let mut filled = Vec::new();
        let mut short_of_cash = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(result) => filled.push(result),
                Err(TradeError::InsufficientFunds { .. }) => short_of_cash += 1,
                Err(other) => panic!("unexpected rejection: {other:?}"),
            }
        }

        let cash = t.engine.team_cash(t.team).await.unwrap().value();
        assert!(cash >= Decimal::ZERO);
        assert!(short_of_cash > 0);
        assert_eq!(cash, t.opening_cash + filled.iter().map(cash_delta).sum::<Decimal>());
        assert_eq!(
            t.engine.holdings(t.team, t.asset).await.unwrap(),
            Decimal::from(3 * filled.len() as i64)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn teams_do_not_share_cash() {
        let engine = Engine::new(EngineConfig::manual(2)).unwrap();
        let spec = AssetSpec::new("ACME", "Acme Corp", Price::new_unchecked(dec!(10)));
        let teams: Vec<TeamId> = (0..4).map(|_| TeamId::new()).collect();
        for team in &teams {
            engine.setup_team(*team, MarketConfig::calm(), vec![spec.clone()]).await.unwrap();
        }

        let engine = Arc::new(engine);
        let mut tasks = Vec::new();
        for (i, team) in teams.iter().enumerate() {
            let engine = Arc::clone(&engine);
            let params = TradeParams::new(*team, spec.id, UserId::new(), Decimal::from(10 * (i + 1) as i64));
            tasks.push(tokio::spawn(async move { engine.buy_asset(params).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // calm markets have no fees, and each team's first trade fills at the base price
        for (i, team) in teams.iter().enumerate() {
            let spent = dec!(10) * Decimal::from(10 * (i + 1) as i64);
            assert_eq!(engine.team_cash(*team).await.unwrap().value(), dec!(10000) - spent);
        }
    }
}

//! Property-based tests for the price process and trade arithmetic.
//!
//! These tests verify invariants hold under random seeds, tiers and asset bounds.

use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;
use tradesim_core::*;

// Strategies for generating test data
fn tier_strategy() -> impl Strategy<Value = Tier> {
    prop_oneof![
        Just(Tier::High),
        Just(Tier::Medium),
        Just(Tier::Low),
        Just(Tier::Disabled),
    ]
}

fn config_strategy() -> impl Strategy<Value = MarketConfig> {
    (
        tier_strategy(),
        tier_strategy(),
        tier_strategy(),
        tier_strategy(),
        tier_strategy(),
        tier_strategy(),
    )
        .prop_map(|(volatility, liquidity, fee, events, dividend, crash)| MarketConfig {
            market_volatility: volatility,
            market_liquidity: liquidity,
            transaction_fee: fee,
            event_frequency: events,
            dividend_impact: dividend,
            crash_impact: crash,
            ..MarketConfig::classroom_default()
        })
}

fn price_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..1_000_000i64).prop_map(|x| Decimal::new(x, 2)) // 0.01 to 10,000
}

fn weight_strategy() -> impl Strategy<Value = Decimal> {
    (0i64..=50i64).prop_map(|x| Decimal::new(x, 1)) // 0 to 5x
}

fn open(config: MarketConfig, specs: &[AssetSpec], seed: u64) -> MarketState {
    let team = TeamId::new();
    let now = Timestamp::from_millis(0);
    let process = ProcessParams::default();
    MarketState::open(
        team,
        config,
        &initial_selections(team, specs, now),
        Box::new(PriceProcess::seeded(seed, process.clone())),
        &process,
        Duration::from_secs(1),
        now,
    )
    .unwrap()
}

fn path(state: &mut MarketState, ticks: i64) -> Vec<Vec<Price>> {
    (1..=ticks)
        .map(|t| {
            let outcome = state.tick(Timestamp::from_millis(t * 1_000), Decimal::ONE).unwrap();
            outcome.snapshot.assets.iter().map(|a| a.price).collect()
        })
        .collect()
}

proptest! {
    /// Prices never leave the asset bounds and never reach zero
    #[test]
    fn prices_stay_within_bounds(
        seed in any::<u64>(),
        config in config_strategy(),
        base in price_strategy(),
        weight in weight_strategy(),
        below in 0i64..=90i64,
        above in 0i64..=200i64,
    ) {
        let min = (base * Decimal::new(100 - below, 2)).round_dp(4);
        let max = (base * Decimal::new(100 + above, 2)).round_dp(4);
        let bounded = AssetSpec::new("BND", "Bounded", Price::new_unchecked(base))
            .with_volatility(weight)
            .with_bounds(Some(min), Some(max));
        let free = AssetSpec::new("FREE", "Unbounded", Price::new_unchecked(base))
            .with_volatility(weight)
            .with_drift(dec!(-0.05));

        let mut state = open(config, &[bounded, free], seed);
        for prices in path(&mut state, 50) {
            prop_assert!(prices[0].value() >= min, "{} below min {}", prices[0], min);
            prop_assert!(prices[0].value() <= max, "{} above max {}", prices[0], max);
            prop_assert!(prices[1].value() >= Price::FLOOR);
        }
    }

    /// With volatility and events disabled the path does not depend on the seed
    #[test]
    fn disabled_volatility_is_deterministic(
        first in any::<u64>(),
        second in any::<u64>(),
        base in price_strategy(),
        drift in -20i64..=20i64,
    ) {
        let spec = AssetSpec::new("DET", "Deterministic", Price::new_unchecked(base))
            .with_drift(Decimal::new(drift, 3));
        let config = MarketConfig::calm();

        let a = path(&mut open(config.clone(), &[spec.clone()], first), 20);
        let b = path(&mut open(config, &[spec], second), 20);
        prop_assert_eq!(a, b);
    }

    /// A single tick never moves a price by more than the liquidity cap
    #[test]
    fn tick_moves_are_capped(
        seed in any::<u64>(),
        liquidity in prop_oneof![Just(Tier::High), Just(Tier::Medium), Just(Tier::Low)],
        base in price_strategy(),
        weight in weight_strategy(),
    ) {
        let config = MarketConfig {
            market_volatility: Tier::High,
            market_liquidity: liquidity,
            event_frequency: Tier::Disabled,
            ..MarketConfig::classroom_default()
        };
        let spec = AssetSpec::new("CAP", "Capped", Price::new_unchecked(base)).with_volatility(weight);
        let mut state = open(config, &[spec], seed);
        let cap = state.params().max_move.unwrap();

        let mut last = base;
        for prices in path(&mut state, 30) {
            let now = prices[0].value();
            // rounding to 4dp and the price floor may add one unit of slack
            prop_assert!((now - last).abs() <= last * cap + dec!(0.0001));
            last = now;
        }
    }

    /// Fees are never negative and never exceed the gross value
    #[test]
    fn fee_is_bounded(
        fee in tier_strategy(),
        gross in (0i64..100_000_000i64).prop_map(|x| Decimal::new(x, 2)),
    ) {
        let config = MarketConfig { transaction_fee: fee, ..MarketConfig::classroom_default() };
        let params = MarketParameters::resolve(&config, dec!(0.01), Duration::from_secs(1));
        let charged = params.fee_for(Quote::new(gross));
        prop_assert!(charged.value() >= Decimal::ZERO);
        prop_assert!(charged.value() <= gross);
        if fee == Tier::Disabled {
            prop_assert_eq!(charged.value(), Decimal::ZERO);
        }
    }

    /// Buys never lower the price, sells never raise it
    #[test]
    fn impact_direction(
        liquidity in tier_strategy(),
        base in price_strategy(),
        quantity in (1i64..10_000i64).prop_map(Decimal::from),
    ) {
        let config = MarketConfig { market_liquidity: liquidity, ..MarketConfig::calm() };
        let spec = AssetSpec::new("IMP", "Impact", Price::new_unchecked(base));
        let id = spec.id;
        let mut state = open(config, &[spec], 1);

        let up = state.apply_price_impact(id, TradeKind::Buy, quantity).unwrap();
        prop_assert!(up.value() >= base);
        let down = state.apply_price_impact(id, TradeKind::Sell, quantity).unwrap();
        prop_assert!(down <= up);
        prop_assert!(down.value() >= Price::FLOOR);
        if liquidity == Tier::Disabled {
            prop_assert_eq!(up.value(), base);
            prop_assert_eq!(down.value(), base);
        }
    }
}

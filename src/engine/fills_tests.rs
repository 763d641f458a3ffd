//! Fill Simulator Tests
//!
//! Covers the midpoint/slippage/commission arithmetic, the minimum-notional
//! rule (entries only, exits exempt), the granularity fallback ladder, and
//! the long-only sell clamp.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use std::collections::HashMap;

use crate::engine::config::ExecutionConfig;
use crate::engine::fills::{BarSource, FillError, FillSimulator};
use crate::engine::types::{Bar, BarTimeframe, OrderIntent, OrderReason, Side};

fn et(hh: u32, mm: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 1, 2)
        .unwrap()
        .and_hms_opt(hh, mm, 0)
        .unwrap()
}

fn bar(ts: NaiveDateTime, high: f64, low: f64) -> Bar {
    Bar {
        ts_et: ts,
        open: low,
        high,
        low,
        close: high,
        volume: 1_000.0,
    }
}

/// Fixed bars per (ticker, timeframe).
#[derive(Default)]
struct FixedBars {
    bars: HashMap<(String, BarTimeframe), Bar>,
}

impl FixedBars {
    fn with(mut self, ticker: &str, tf: BarTimeframe, bar: Bar) -> Self {
        self.bars.insert((ticker.to_string(), tf), bar);
        self
    }
}

impl BarSource for FixedBars {
    fn bar_at_or_before(
        &self,
        ticker: &str,
        ts: NaiveDateTime,
        timeframe: BarTimeframe,
    ) -> Option<Bar> {
        self.bars
            .get(&(ticker.to_string(), timeframe))
            .filter(|b| b.ts_et <= ts)
            .copied()
    }
}

fn simulator() -> FillSimulator {
    FillSimulator::new(ExecutionConfig::default())
}

#[test]
fn buy_pays_midpoint_plus_slippage_and_commission() {
    // Midpoint $100.00, slippage 2 bps, commission $10, 10 shares:
    // price $100.02, total cost $1010.20.
    let bars = FixedBars::default().with(
        "AAPL",
        BarTimeframe::Minute,
        bar(et(10, 0), 100.5, 99.5),
    );
    let intent = OrderIntent::new("AAPL", Side::Buy, 10.0, OrderReason::LlmProposal);
    let fill = simulator().simulate(&bars, &intent, 0.0, et(10, 0)).unwrap();

    assert!((fill.price - 100.02).abs() < 1e-9, "price {}", fill.price);
    let total_cost = fill.notional() + fill.commission_usd;
    assert!((total_cost - 1_010.20).abs() < 1e-9, "total {total_cost}");
}

#[test]
fn sell_slippage_is_adverse() {
    let bars = FixedBars::default().with(
        "AAPL",
        BarTimeframe::Minute,
        bar(et(10, 0), 100.5, 99.5),
    );
    let intent = OrderIntent::new("AAPL", Side::Sell, 10.0, OrderReason::LlmProposal);
    let fill = simulator().simulate(&bars, &intent, 10.0, et(10, 0)).unwrap();
    assert!((fill.price - 99.98).abs() < 1e-9, "price {}", fill.price);
}

#[test]
fn min_notional_applies_to_entries_but_not_forced_exits() {
    let bars = FixedBars::default().with(
        "AAPL",
        BarTimeframe::Minute,
        bar(et(10, 0), 100.5, 99.5),
    );
    // $500 notional buy is below the $1000 minimum
    let small_buy = OrderIntent::new("AAPL", Side::Buy, 5.0, OrderReason::LlmProposal);
    let err = simulator()
        .simulate(&bars, &small_buy, 0.0, et(10, 0))
        .expect_err("below minimum notional");
    assert!(matches!(err, FillError::BelowMinNotional { .. }));
    assert_eq!(err.code(), "min_order_breach");

    // a $500 stop exit executes regardless
    let stop = OrderIntent::forced_exit("AAPL", 5.0, OrderReason::Stop);
    simulator()
        .simulate(&bars, &stop, 5.0, et(10, 0))
        .expect("forced exits bypass the minimum");
}

#[test]
fn stale_minute_bar_falls_back_to_coarser_granularity() {
    // Minute bar 30 minutes old (> 15 min staleness), 5-minute bar fresh.
    let bars = FixedBars::default()
        .with("AAPL", BarTimeframe::Minute, bar(et(10, 0), 101.0, 99.0))
        .with("AAPL", BarTimeframe::FiveMinute, bar(et(10, 25), 105.0, 103.0));
    let intent = OrderIntent::new("AAPL", Side::Buy, 10.0, OrderReason::LlmProposal);
    let fill = simulator().simulate(&bars, &intent, 0.0, et(10, 30)).unwrap();
    // filled off the 5-minute bar midpoint 104.0, not the stale minute bar
    assert!((fill.price - 104.0 * 1.0002).abs() < 1e-9);
}

#[test]
fn no_usable_bar_fails_with_insufficient_reference_data() {
    let bars = FixedBars::default().with(
        "AAPL",
        BarTimeframe::Minute,
        // a week old, beyond even the daily staleness allowance
        bar(et(10, 0) - Duration::days(7), 100.0, 100.0),
    );
    let intent = OrderIntent::new("AAPL", Side::Buy, 10.0, OrderReason::LlmProposal);
    let err = simulator()
        .simulate(&bars, &intent, 0.0, et(10, 0))
        .expect_err("nothing usable");
    assert!(matches!(err, FillError::InsufficientReferenceData { .. }));
    assert_eq!(err.code(), "no_reference_data");
}

#[test]
fn daily_bar_is_accepted_within_its_longer_staleness_window() {
    let bars = FixedBars::default().with(
        "AAPL",
        BarTimeframe::Daily,
        bar(et(10, 0) - Duration::days(2), 100.0, 100.0),
    );
    let intent = OrderIntent::new("AAPL", Side::Buy, 10.0, OrderReason::LlmProposal);
    simulator()
        .simulate(&bars, &intent, 0.0, et(10, 0))
        .expect("daily fallback inside its window");
}

#[test]
fn sells_are_clamped_to_held_quantity() {
    let bars = FixedBars::default().with(
        "AAPL",
        BarTimeframe::Minute,
        bar(et(10, 0), 100.5, 99.5),
    );
    let intent = OrderIntent::new("AAPL", Side::Sell, 50.0, OrderReason::LlmProposal);
    let fill = simulator().simulate(&bars, &intent, 12.5, et(10, 0)).unwrap();
    assert_eq!(fill.quantity, 12.5, "clamped to the held quantity");

    let err = simulator()
        .simulate(&bars, &intent, 0.0, et(10, 0))
        .expect_err("nothing held");
    assert!(matches!(err, FillError::ZeroQuantity { .. }));
}

#[test]
fn whole_shares_only_when_fractional_disabled() {
    let mut config = ExecutionConfig::default();
    config.allow_fractional = false;
    let sim = FillSimulator::new(config);
    let bars = FixedBars::default().with(
        "AAPL",
        BarTimeframe::Minute,
        bar(et(10, 0), 200.5, 199.5),
    );
    let intent = OrderIntent::new("AAPL", Side::Buy, 10.7, OrderReason::LlmProposal);
    let fill = sim.simulate(&bars, &intent, 0.0, et(10, 0)).unwrap();
    assert_eq!(fill.quantity, 10.0);
}

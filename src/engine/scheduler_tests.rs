//! Decision Engine Integration Tests
//!
//! Full-engine sequences through `tick` and `run_event_window`: window
//! cadence, forced exits ahead of windows, cooldown re-entry blocks,
//! sell-before-buy ordering, timeout abandonment, and the daily caps.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::engine::config::EngineConfig;
use crate::engine::context::{NewsMetricsSource, PriceMetrics, PriceMetricsSource};
use crate::engine::fills::BarSource;
use crate::engine::llm::{CallOutcome, LlmCallError, LlmClient, LlmReply};
use crate::engine::scheduler::{
    DecisionEngine, EngineEvent, NoTradeReason, WindowKind, WindowOutcome, WindowStatus,
};
use crate::engine::types::{Bar, BarTimeframe, NewsMetrics, OrderReason, Side};

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
}

fn et(d: u32, hh: u32, mm: u32) -> NaiveDateTime {
    day(d).and_hms_opt(hh, mm, 0).unwrap()
}

/// In-memory market: one settable last price per ticker, served as metrics,
/// marks, and fresh minute bars with zero range (midpoint = last price).
#[derive(Default)]
struct TestMarket {
    prices: Mutex<HashMap<String, f64>>,
}

impl TestMarket {
    fn set(&self, ticker: &str, price: f64) {
        self.prices.lock().insert(ticker.to_string(), price);
    }
}

impl PriceMetricsSource for TestMarket {
    fn metrics(&self, ticker: &str, _as_of: NaiveDateTime) -> Option<PriceMetrics> {
        let price = *self.prices.lock().get(ticker)?;
        Some(PriceMetrics {
            last_price: price,
            r1d: 0.0,
            r5d: 0.01,
            r20d: 0.02,
            rsi_14: None,
            macd: None,
        })
    }
}

impl NewsMetricsSource for TestMarket {
    fn metrics(&self, _ticker: &str, _as_of: NaiveDateTime) -> Option<NewsMetrics> {
        None
    }
}

impl BarSource for TestMarket {
    fn bar_at_or_before(
        &self,
        ticker: &str,
        ts: NaiveDateTime,
        timeframe: BarTimeframe,
    ) -> Option<Bar> {
        if timeframe != BarTimeframe::Minute {
            return None;
        }
        let price = *self.prices.lock().get(ticker)?;
        Some(Bar {
            ts_et: ts,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1_000.0,
        })
    }
}

/// Replays scripted completions in order; an exhausted script answers with
/// an empty proposal list.
struct ScriptedLlm {
    replies: Mutex<VecDeque<Result<LlmReply, LlmCallError>>>,
    estimate: f64,
}

impl ScriptedLlm {
    fn new(estimate: f64) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            estimate,
        }
    }

    fn push_text(&self, text: &str, cost: f64) {
        self.replies.lock().push_back(Ok(LlmReply {
            text: text.to_string(),
            prompt_tokens: 200,
            completion_tokens: 50,
            cost_usd: cost,
        }));
    }

    fn push_error(&self, err: LlmCallError) {
        self.replies.lock().push_back(Err(err));
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _prompt: &str) -> Result<LlmReply, LlmCallError> {
        self.replies.lock().pop_front().unwrap_or_else(|| {
            Ok(LlmReply {
                text: r#"{"proposals": []}"#.to_string(),
                prompt_tokens: 200,
                completion_tokens: 5,
                cost_usd: 0.01,
            })
        })
    }

    fn estimate_cost_usd(&self, _prompt_tokens: usize) -> f64 {
        self.estimate
    }
}

struct Harness {
    engine: DecisionEngine,
    market: Arc<TestMarket>,
    llm: Arc<ScriptedLlm>,
}

fn harness(config: EngineConfig, start: NaiveDateTime) -> Harness {
    harness_with_estimate(config, start, 0.01)
}

fn harness_with_estimate(config: EngineConfig, start: NaiveDateTime, estimate: f64) -> Harness {
    let market = Arc::new(TestMarket::default());
    for t in &config.universe {
        market.set(t, 100.0);
    }
    let llm = Arc::new(ScriptedLlm::new(estimate));
    let engine = DecisionEngine::new(
        config,
        start,
        market.clone(),
        market.clone(),
        market.clone(),
        llm.clone(),
    )
    .expect("engine construction");
    Harness { engine, market, llm }
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.universe = vec!["AAPL".to_string(), "MSFT".to_string(), "NVDA".to_string()];
    config
}

fn buy_reply(ticker: &str, qty: f64, expected_return: f64) -> String {
    format!(
        r#"{{"proposals": [{{"ticker": "{ticker}", "action": "BUY", "quantity": {qty}, "expected_return": {expected_return}}}]}}"#
    )
}

fn windows(events: &[EngineEvent]) -> Vec<&WindowOutcome> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::WindowClosed(o) => Some(o),
            _ => None,
        })
        .collect()
}

fn fills(events: &[EngineEvent]) -> Vec<&crate::engine::types::Fill> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Fill(f) => Some(f),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn fixed_windows_fire_once_per_rth_day() {
    // 2025-01-02 is a Thursday, 2025-01-04 a Saturday.
    let mut h = harness(config(), et(2, 9, 0));

    assert!(windows(&h.engine.tick(et(2, 9, 45)).await).is_empty(), "before the window");

    let events = h.engine.tick(et(2, 10, 0)).await;
    let closed = windows(&events);
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].kind, WindowKind::Fixed);
    assert_eq!(
        closed[0].status,
        WindowStatus::NoTrade { reason: NoTradeReason::NoAcceptedProposals }
    );

    assert!(windows(&h.engine.tick(et(2, 10, 5)).await).is_empty(), "already fired today");

    // 15:30 window catches up even on a late tick
    let events = h.engine.tick(et(2, 15, 45)).await;
    assert_eq!(windows(&events).len(), 1);

    // Saturday: due by time, suppressed outside trading hours
    assert!(windows(&h.engine.tick(et(4, 10, 0)).await).is_empty());

    // next trading day fires again
    assert_eq!(windows(&h.engine.tick(et(6, 10, 0)).await).len(), 1);
}

#[tokio::test]
async fn accepted_buy_executes_and_arms_default_exits() {
    let mut h = harness(config(), et(2, 9, 0));
    h.llm.push_text(&buy_reply("AAPL", 20.0, 0.08), 0.01);

    let events = h.engine.tick(et(2, 10, 0)).await;
    let closed = windows(&events);
    assert_eq!(closed[0].status, WindowStatus::Traded);
    assert_eq!(closed[0].executed.len(), 1);
    let fill = &closed[0].executed[0];
    assert_eq!(fill.ticker, "AAPL");
    // midpoint 100.00, 2 bps adverse slippage
    assert!((fill.price - 100.02).abs() < 1e-9);

    let state = h.engine.state();
    let state = state.lock();
    assert_eq!(state.portfolio.held_qty("AAPL"), 20.0);
    // 100000 - 20 * 100.02 - 10 commission
    assert!((state.portfolio.cash - 97_989.6).abs() < 1e-6);
    let pos = state.portfolio.position("AAPL").unwrap();
    assert!((pos.stop_price.unwrap() - 100.02 * 0.92).abs() < 1e-9);
    assert!((pos.take_profit_price.unwrap() - 100.02 * 1.12).abs() < 1e-9);
    assert_eq!(state.execution_log.len(), 1);
}

#[tokio::test]
async fn stop_forces_exit_then_cooldown_blocks_reentry() {
    let mut h = harness(config(), et(2, 9, 0));
    h.llm.push_text(&buy_reply("AAPL", 20.0, 0.08), 0.01);
    h.engine.tick(et(2, 10, 0)).await;

    // price gaps below the armed stop (100.02 * 0.92)
    h.market.set("AAPL", 80.0);
    let events = h.engine.tick(et(2, 10, 5)).await;
    let exits = fills(&events);
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].reason, OrderReason::Stop);
    assert_eq!(exits[0].side, Side::Sell);
    assert_eq!(exits[0].quantity, 20.0);
    {
        let state = h.engine.state();
        let state = state.lock();
        assert!(!state.portfolio.holds("AAPL"), "position closed by the monitor");
    }

    // an event window proposing the same ticker inside the cooldown is rejected
    h.llm.push_text(&buy_reply("AAPL", 20.0, 0.08), 0.01);
    let outcome = h
        .engine
        .run_event_window(vec!["AAPL".to_string()], et(2, 10, 30))
        .await;
    assert_eq!(outcome.kind, WindowKind::Event);
    assert!(outcome.executed.is_empty());
    assert_eq!(outcome.rejected.len(), 1);
    assert_eq!(outcome.rejected[0].code, "cooldown_active");
}

#[tokio::test]
async fn forced_exit_precedes_a_same_tick_llm_order_on_the_ticker() {
    let mut h = harness(config(), et(2, 9, 0));
    h.llm.push_text(&buy_reply("AAPL", 20.0, 0.08), 0.01);
    h.engine.tick(et(2, 10, 0)).await;

    // gap below the stop, then a single tick carrying both the monitor
    // sweep and the 15:30 window, whose reply re-buys the stopped ticker
    h.market.set("AAPL", 80.0);
    h.llm.push_text(&buy_reply("AAPL", 20.0, 0.08), 0.01);
    let events = h.engine.tick(et(2, 15, 30)).await;

    let exits = fills(&events);
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].reason, OrderReason::Stop);
    let exit_idx = events
        .iter()
        .position(|e| matches!(e, EngineEvent::Fill(_)))
        .unwrap();
    let window_idx = events
        .iter()
        .position(|e| matches!(e, EngineEvent::WindowClosed(_)))
        .unwrap();
    assert!(exit_idx < window_idx, "the stop executes ahead of the window");

    let closed = windows(&events);
    assert!(closed[0].executed.is_empty(), "the re-buy never fills");
    assert_eq!(closed[0].rejected.len(), 1);
    assert_eq!(closed[0].rejected[0].ticker, "AAPL");
    assert_eq!(closed[0].rejected[0].code, "cooldown_active");
    let state = h.engine.state();
    assert!(!state.lock().portfolio.holds("AAPL"));
}

#[tokio::test]
async fn sells_execute_before_buys_within_a_window() {
    let mut h = harness(config(), et(2, 9, 0));
    h.llm.push_text(&buy_reply("MSFT", 30.0, 0.08), 0.01);
    h.engine.tick(et(2, 10, 0)).await;

    // one reply carrying a buy listed ahead of a sell
    h.llm.push_text(
        r#"{"proposals": [
            {"ticker": "NVDA", "action": "BUY", "quantity": 15, "expected_return": 0.08},
            {"ticker": "MSFT", "action": "SELL", "quantity": 30}
        ]}"#,
        0.01,
    );
    let events = h.engine.tick(et(2, 15, 30)).await;
    let closed = windows(&events);
    assert_eq!(closed[0].executed.len(), 2);
    assert_eq!(closed[0].executed[0].side, Side::Sell, "sell frees cash first");
    assert_eq!(closed[0].executed[0].ticker, "MSFT");
    assert_eq!(closed[0].executed[1].side, Side::Buy);
    assert_eq!(closed[0].executed[1].ticker, "NVDA");
}

#[tokio::test]
async fn timed_out_window_is_abandoned_without_partial_state() {
    let mut h = harness(config(), et(2, 9, 0));
    h.llm.push_error(LlmCallError::Timeout);

    let events = h.engine.tick(et(2, 10, 0)).await;
    let closed = windows(&events);
    assert_eq!(
        closed[0].status,
        WindowStatus::NoTrade { reason: NoTradeReason::Timeout }
    );
    let record = closed[0].llm.as_ref().unwrap();
    assert_eq!(record.outcome, CallOutcome::Timeout);
    assert_eq!(record.cost_usd, 0.0);

    let state = h.engine.state();
    let state = state.lock();
    assert_eq!(state.portfolio.cash, 100_000.0, "nothing applied");
    assert!(state.execution_log.is_empty());
    assert_eq!(state.budget_snapshot().daily_spent_usd, 0.0);
}

#[tokio::test]
async fn transport_errors_close_the_window_as_no_trade() {
    let mut h = harness(config(), et(2, 9, 0));
    h.llm.push_error(LlmCallError::Transport("connection reset".to_string()));

    let events = h.engine.tick(et(2, 10, 0)).await;
    let closed = windows(&events);
    assert_eq!(
        closed[0].status,
        WindowStatus::NoTrade { reason: NoTradeReason::TransportError }
    );
}

#[tokio::test]
async fn invalid_payload_is_a_no_trade_with_spend_recorded() {
    let mut h = harness(config(), et(2, 9, 0));
    h.llm.push_text("not json", 0.5);

    let events = h.engine.tick(et(2, 10, 0)).await;
    let closed = windows(&events);
    assert_eq!(
        closed[0].status,
        WindowStatus::NoTrade { reason: NoTradeReason::InvalidResponse }
    );
    let state = h.engine.state();
    let state = state.lock();
    assert_eq!(state.budget_snapshot().daily_spent_usd, 0.5, "the bad call still cost money");
    assert!(state.execution_log.is_empty());
}

#[tokio::test]
async fn budget_exhaustion_closes_later_windows_without_calling() {
    let mut config = config();
    config.llm.daily_cap_usd = 10.0;
    // the client estimates $6 per call; two calls cannot fit under $10
    let mut h = harness_with_estimate(config, et(2, 9, 0), 6.0);
    h.llm.push_text(r#"{"proposals": []}"#, 6.0);

    let events = h.engine.tick(et(2, 10, 0)).await;
    assert!(matches!(
        windows(&events)[0].status,
        WindowStatus::NoTrade { reason: NoTradeReason::NoAcceptedProposals }
    ));

    let events = h.engine.tick(et(2, 15, 30)).await;
    let closed = windows(&events);
    match &closed[0].status {
        WindowStatus::NoTrade { reason: NoTradeReason::BudgetExhausted(ex) } => {
            assert_eq!(ex.estimated_cost_usd, 6.0);
            assert!((ex.remaining_daily_usd - 4.0).abs() < 1e-9);
        }
        other => panic!("expected budget exhaustion, got {other:?}"),
    }
    assert!(closed[0].llm.is_none(), "no call was made");
}

#[tokio::test]
async fn event_windows_respect_daily_count_and_breadth_caps() {
    let mut config = config();
    config.llm.max_event_windows_per_day = 1;
    config.llm.max_tickers_per_event_window = 2;
    let mut h = harness(config, et(2, 9, 0));

    let outcome = h
        .engine
        .run_event_window(
            vec!["AAPL".to_string(), "MSFT".to_string(), "NVDA".to_string()],
            et(2, 11, 0),
        )
        .await;
    assert_eq!(outcome.candidates.len(), 2, "breadth truncated");

    let outcome = h
        .engine
        .run_event_window(vec!["AAPL".to_string()], et(2, 11, 30))
        .await;
    assert_eq!(
        outcome.status,
        WindowStatus::NoTrade { reason: NoTradeReason::EventCapReached }
    );
    assert!(outcome.llm.is_none(), "capped windows never reach the model");

    // the cap resets on the next day
    let outcome = h
        .engine
        .run_event_window(vec!["AAPL".to_string()], et(3, 11, 0))
        .await;
    assert_ne!(
        outcome.status,
        WindowStatus::NoTrade { reason: NoTradeReason::EventCapReached }
    );
}

#[tokio::test]
async fn disabled_event_windows_are_ignored() {
    let mut config = config();
    config.cadence.allow_event_window = false;
    let mut h = harness(config, et(2, 9, 0));
    let outcome = h
        .engine
        .run_event_window(vec!["AAPL".to_string()], et(2, 11, 0))
        .await;
    assert_eq!(
        outcome.status,
        WindowStatus::NoTrade { reason: NoTradeReason::EventWindowDisabled }
    );
}

#[tokio::test]
async fn day_rollover_prunes_prior_day_window_bookkeeping() {
    let mut h = harness(config(), et(2, 9, 0));
    h.engine.tick(et(2, 10, 0)).await;
    h.engine.tick(et(2, 15, 30)).await;
    assert_eq!(h.engine.fired_window_count(), 2);

    // Friday's entries are dropped when Monday's first tick rolls the day
    let events = h.engine.tick(et(6, 10, 0)).await;
    assert_eq!(windows(&events).len(), 1, "the new day's window still fires");
    assert_eq!(h.engine.fired_window_count(), 1);
}

#[tokio::test]
async fn order_count_cap_rejects_the_second_proposal_in_one_window() {
    let mut config = config();
    config.limits.max_orders_per_day = 1;
    let mut h = harness(config, et(2, 9, 0));
    h.llm.push_text(
        r#"{"proposals": [
            {"ticker": "AAPL", "action": "BUY", "quantity": 20, "expected_return": 0.08},
            {"ticker": "MSFT", "action": "BUY", "quantity": 20, "expected_return": 0.08}
        ]}"#,
        0.01,
    );

    let events = h.engine.tick(et(2, 10, 0)).await;
    let closed = windows(&events);
    assert_eq!(closed[0].status, WindowStatus::Traded);
    assert_eq!(closed[0].executed.len(), 1);
    assert_eq!(closed[0].executed[0].ticker, "AAPL");
    assert_eq!(closed[0].rejected.len(), 1);
    assert_eq!(closed[0].rejected[0].ticker, "MSFT");
    assert_eq!(closed[0].rejected[0].code, "max_orders_per_day_exceeded");
}

#[tokio::test]
async fn gated_proposals_are_recorded_on_the_outcome() {
    let mut h = harness(config(), et(2, 9, 0));
    h.llm.push_text(&buy_reply("AAPL", 20.0, 0.03), 0.01); // below the 5% gate

    let events = h.engine.tick(et(2, 10, 0)).await;
    let closed = windows(&events);
    assert_eq!(
        closed[0].status,
        WindowStatus::NoTrade { reason: NoTradeReason::NoAcceptedProposals }
    );
    assert_eq!(closed[0].rejected.len(), 1);
    assert_eq!(closed[0].rejected[0].code, "expected_return_gate");
}

#[tokio::test]
async fn day_rollover_emits_an_equity_snapshot_and_resets_counters() {
    let mut h = harness(config(), et(2, 9, 0));
    h.llm.push_text(&buy_reply("AAPL", 20.0, 0.08), 0.01);
    h.engine.tick(et(2, 10, 0)).await;
    {
        let state = h.engine.state();
        assert_eq!(state.lock().counters.orders, 1);
    }

    let events = h.engine.tick(et(3, 9, 35)).await;
    let snapshot = events.iter().find_map(|e| match e {
        EngineEvent::EquitySnapshot { equity, .. } => Some(*equity),
        _ => None,
    });
    let equity = snapshot.expect("snapshot on the first tick of a new day");
    // 20 shares marked at 100 plus remaining cash
    assert!((equity - (97_989.6 + 2_000.0)).abs() < 1e-6);

    let state = h.engine.state();
    let state = state.lock();
    assert_eq!(state.counters.orders, 0, "day counters reset");
    assert_eq!(state.counters.date, day(3));
    assert!((state.counters.prior_close_equity - equity).abs() < 1e-9);
}

//! Decision Scheduler
//!
//! Drives the engine cadence through pull-based ticks:
//!
//! ```text
//! tick(now)
//!   ├─ day/month rollover (counters, budget, equity snapshot)
//!   ├─ stop/take-profit monitor pass (forced exits execute first)
//!   └─ due fixed windows → run_window
//! run_event_window(tickers, now)   external trigger, shares the day caps
//! ```
//!
//! Window evaluation walks `Idle → WindowOpen → ContextBuilt → LlmResolved →
//! RiskGated → Executed`; the traversed phases are recorded on the outcome.
//!
//! # Lock Discipline
//!
//! Portfolio, budget, cooldowns, and day counters live in one [`EngineState`]
//! behind a single `parking_lot::Mutex`. Context building, reference-bar
//! prefetch, and the LLM await all happen with the lock released; only the
//! short prepare (fingerprint/cache/budget) and gate-and-execute steps hold
//! it. A window that times out is abandoned before the execute step, so
//! nothing is ever partially applied.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::engine::budget::{BudgetExhausted, BudgetLedger, BudgetSnapshot};
use crate::engine::clock::is_rth;
use crate::engine::config::EngineConfig;
use crate::engine::context::{ContextBuilder, NewsMetricsSource, PriceMetricsSource, SalienceWeights};
use crate::engine::fills::{BarSource, FillSimulator};
use crate::engine::llm::{
    DroppedProposal, LlmCallError, LlmCallRecord, LlmClient, Orchestrator, Prepared, Proposal,
    Validated,
};
use crate::engine::portfolio::Portfolio;
use crate::engine::risk::{CooldownBook, DayCounters, RiskContext, RiskEngine};
use crate::engine::types::{Bar, BarTimeframe, Fill, OrderIntent, OrderReason, Price, Side};

/// Window trigger type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Fixed,
    Event,
}

/// Phases a window traversed, recorded in order on the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowPhase {
    WindowOpen,
    ContextBuilt,
    LlmResolved,
    RiskGated,
    Executed,
}

/// Terminal no-trade reasons. None of these are errors; every window closes
/// with a well-defined outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoTradeReason {
    BudgetExhausted(BudgetExhausted),
    Timeout,
    TransportError,
    InvalidResponse,
    EventCapReached,
    EventWindowDisabled,
    NoAcceptedProposals,
}

impl NoTradeReason {
    pub fn code(&self) -> &'static str {
        match self {
            NoTradeReason::BudgetExhausted(_) => "budget_exhausted",
            NoTradeReason::Timeout => "timeout",
            NoTradeReason::TransportError => "transport_error",
            NoTradeReason::InvalidResponse => "invalid_response",
            NoTradeReason::EventCapReached => "event_cap_reached",
            NoTradeReason::EventWindowDisabled => "event_window_disabled",
            NoTradeReason::NoAcceptedProposals => "no_accepted_proposals",
        }
    }
}

/// Window terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WindowStatus {
    Traded,
    NoTrade { reason: NoTradeReason },
}

/// A proposal that did not execute, with its reason code. Risk violations
/// are expected outcomes and are always recorded, never silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedProposal {
    pub ticker: String,
    pub side: Option<Side>,
    pub quantity: Option<f64>,
    pub code: String,
    pub detail: String,
}

/// Closed decision window. Never mutated after closing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowOutcome {
    pub kind: WindowKind,
    pub as_of: NaiveDateTime,
    pub candidates: Vec<String>,
    pub executed: Vec<Fill>,
    pub rejected: Vec<RejectedProposal>,
    pub llm: Option<LlmCallRecord>,
    pub status: WindowStatus,
    pub phases: Vec<WindowPhase>,
}

/// Events published on the broadcast channel for any subscriber (HTTP, SSE,
/// CLI — transport is a collaborator concern).
#[derive(Debug, Clone, Serialize)]
pub enum EngineEvent {
    WindowClosed(WindowOutcome),
    Fill(Fill),
    EquitySnapshot {
        ts_et: NaiveDateTime,
        equity: f64,
        cash: f64,
    },
}

/// Process-wide mutable engine state. All mutation funnels through
/// [`EngineState::apply_fill`] under the scheduler's single lock.
pub struct EngineState {
    pub portfolio: Portfolio,
    pub cooldowns: CooldownBook,
    pub counters: DayCounters,
    pub budget: BudgetLedger,
    pub execution_log: Vec<Fill>,
}

impl EngineState {
    fn new(config: &EngineConfig, start: NaiveDateTime) -> Self {
        Self {
            portfolio: Portfolio::new(config.initial_cash_usd),
            cooldowns: CooldownBook::default(),
            counters: DayCounters::new(start.date(), config.initial_cash_usd),
            budget: BudgetLedger::new(config.llm.daily_cap_usd, config.llm.monthly_cap_usd, start),
            execution_log: Vec::new(),
        }
    }

    /// Apply an executed fill: portfolio, day counters, execution log, and
    /// cooldown on position exits.
    fn apply_fill(&mut self, fill: Fill) -> Result<Fill, crate::engine::portfolio::PortfolioError> {
        self.portfolio.apply_fill(&fill)?;
        self.counters.record_fill(fill.notional());
        if fill.side == Side::Sell && !self.portfolio.holds(&fill.ticker) {
            self.cooldowns.record_exit(&fill.ticker, fill.ts_et);
        }
        self.execution_log.push(fill.clone());
        Ok(fill)
    }

    pub fn budget_snapshot(&self) -> BudgetSnapshot {
        self.budget.snapshot()
    }
}

/// Reference bars prefetched outside the lock, so the gate-and-execute step
/// never does I/O while holding it.
struct SnapshotBars {
    bars: HashMap<(String, BarTimeframe), Bar>,
}

impl SnapshotBars {
    fn prefetch(
        source: &dyn BarSource,
        tickers: impl IntoIterator<Item = String>,
        now: NaiveDateTime,
    ) -> Self {
        let mut bars = HashMap::new();
        for ticker in tickers {
            for tf in [BarTimeframe::Minute, BarTimeframe::FiveMinute, BarTimeframe::Daily] {
                if let Some(bar) = source.bar_at_or_before(&ticker, now, tf) {
                    bars.insert((ticker.clone(), tf), bar);
                }
            }
        }
        Self { bars }
    }
}

impl BarSource for SnapshotBars {
    fn bar_at_or_before(
        &self,
        ticker: &str,
        _ts: NaiveDateTime,
        timeframe: BarTimeframe,
    ) -> Option<Bar> {
        self.bars.get(&(ticker.to_string(), timeframe)).copied()
    }
}

/// The decision-and-risk engine: scheduler, risk gate, and executor wired
/// around injected market-data and LLM capabilities.
pub struct DecisionEngine {
    config: EngineConfig,
    window_times: Vec<NaiveTime>,
    state: Arc<Mutex<EngineState>>,
    risk: RiskEngine,
    fills: FillSimulator,
    context: ContextBuilder,
    orchestrator: Orchestrator,
    prices: Arc<dyn PriceMetricsSource>,
    news: Arc<dyn NewsMetricsSource>,
    bars: Arc<dyn BarSource>,
    llm: Arc<dyn LlmClient>,
    events: broadcast::Sender<EngineEvent>,
    fired_windows: BTreeSet<(NaiveDate, NaiveTime)>,
    event_window_day: NaiveDate,
    event_windows_today: u32,
}

impl DecisionEngine {
    pub fn new(
        config: EngineConfig,
        start: NaiveDateTime,
        prices: Arc<dyn PriceMetricsSource>,
        news: Arc<dyn NewsMetricsSource>,
        bars: Arc<dyn BarSource>,
        llm: Arc<dyn LlmClient>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let window_times = config.window_times()?;
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            state: Arc::new(Mutex::new(EngineState::new(&config, start))),
            risk: RiskEngine::new(
                config.risk.clone(),
                config.limits.clone(),
                config.execution.commission_usd,
            ),
            fills: FillSimulator::new(config.execution.clone()),
            context: ContextBuilder::new(
                SalienceWeights::default(),
                config.llm.window_top_k_tickers,
                config.llm.context_token_budget,
            ),
            orchestrator: Orchestrator::new(config.llm.clone()),
            prices,
            news,
            bars,
            llm,
            events,
            fired_windows: BTreeSet::new(),
            event_window_day: start.date(),
            event_windows_today: 0,
            config,
            window_times,
        })
    }

    /// Subscribe to window outcomes, fills, and equity snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Shared engine state, for read-side observers.
    pub fn state(&self) -> Arc<Mutex<EngineState>> {
        Arc::clone(&self.state)
    }

    #[cfg(test)]
    pub(crate) fn fired_window_count(&self) -> usize {
        self.fired_windows.len()
    }

    fn publish(&self, event: EngineEvent) {
        // No subscribers is fine; outcomes are also returned to the caller.
        let _ = self.events.send(event);
    }

    /// Latest marks for the given tickers, queried outside the lock.
    fn marks_for(&self, tickers: &[String], now: NaiveDateTime) -> BTreeMap<String, Price> {
        let mut marks = BTreeMap::new();
        for t in tickers {
            if let Some(m) = self.prices.metrics(t, now) {
                marks.insert(t.clone(), m.last_price);
            }
        }
        marks
    }

    /// One cooperative tick: rollover, monitor pass, due fixed windows.
    /// Invoked by the external driver at a finer-than-window cadence.
    pub async fn tick(&mut self, now: NaiveDateTime) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        self.rollover(now, &mut out);
        self.monitor_exits(now, &mut out);
        for window_time in self.due_fixed_windows(now) {
            let outcome = self.run_window(WindowKind::Fixed, None, now).await;
            info!(
                window = %window_time,
                status = ?outcome.status,
                executed = outcome.executed.len(),
                rejected = outcome.rejected.len(),
                "fixed decision window closed"
            );
            out.push(EngineEvent::WindowClosed(outcome));
        }
        out
    }

    /// Day/month boundary handling: equity snapshot, counter reset, budget
    /// reset. Runs under the lock; price marks are fetched outside it.
    fn rollover(&mut self, now: NaiveDateTime, out: &mut Vec<EngineEvent>) {
        let held = self.state.lock().portfolio.held_tickers();
        let marks = self.marks_for(&held, now);
        let mut state = self.state.lock();
        state.budget.rollover(now);
        if state.counters.date != now.date() {
            let equity = state.portfolio.equity(&marks);
            let cash = state.portfolio.cash;
            state.counters.rollover(now.date(), equity);
            drop(state);
            let snapshot = EngineEvent::EquitySnapshot {
                ts_et: now,
                equity,
                cash,
            };
            self.publish(snapshot.clone());
            out.push(snapshot);
        }
        if self.event_window_day != now.date() {
            self.event_window_day = now.date();
            self.event_windows_today = 0;
            // Past days never fire again; drop their bookkeeping so neither
            // collection grows without bound in a long-running process.
            self.fired_windows.retain(|(d, _)| *d >= now.date());
            self.orchestrator.prune_expired(now);
        }
    }

    /// Continuous stop/take-profit monitoring. Forced exits bypass the rule
    /// chain and always execute when reference data exists; they run before
    /// any window in the same tick, so exits take precedence over LLM orders
    /// touching the same ticker.
    fn monitor_exits(&mut self, now: NaiveDateTime, out: &mut Vec<EngineEvent>) {
        let held = self.state.lock().portfolio.held_tickers();
        if held.is_empty() {
            return;
        }
        let marks = self.marks_for(&held, now);
        let snapshot_bars = SnapshotBars::prefetch(self.bars.as_ref(), held, now);

        let mut state = self.state.lock();
        let intents = self.risk.check_exits(&state.portfolio, &marks);
        for intent in intents {
            let held_qty = state.portfolio.held_qty(&intent.ticker);
            match self.fills.simulate(&snapshot_bars, &intent, held_qty, now) {
                Ok(fill) => match state.apply_fill(fill) {
                    Ok(fill) => {
                        info!(
                            ticker = %fill.ticker,
                            reason = fill.reason.tag(),
                            price = fill.price,
                            qty = fill.quantity,
                            "forced exit executed"
                        );
                        let event = EngineEvent::Fill(fill);
                        let _ = self.events.send(event.clone());
                        out.push(event);
                    }
                    Err(err) => warn!(ticker = %intent.ticker, error = %err, "forced exit not applied"),
                },
                Err(err) => {
                    // Degrade: keep the position, retry at the next tick.
                    warn!(ticker = %intent.ticker, error = %err, "forced exit skipped");
                }
            }
        }
    }

    /// Fixed windows due at `now` that have not fired today. RTH only.
    fn due_fixed_windows(&mut self, now: NaiveDateTime) -> Vec<NaiveTime> {
        let mut due = Vec::new();
        for &t in &self.window_times {
            let window_ts = now.date().and_time(t);
            if now >= window_ts
                && is_rth(window_ts)
                && self.fired_windows.insert((now.date(), t))
            {
                due.push(t);
            }
        }
        due
    }

    /// Event-triggered window. Shares the per-day caps: triggers past
    /// `max_event_windows_per_day` are ignored (logged, not erroring) and
    /// ticker breadth is truncated to `max_tickers_per_event_window`.
    pub async fn run_event_window(
        &mut self,
        mut tickers: Vec<String>,
        now: NaiveDateTime,
    ) -> WindowOutcome {
        self.rollover(now, &mut Vec::new());
        let cap = self.config.llm.max_event_windows_per_day;
        let refused = if !self.config.cadence.allow_event_window {
            Some(NoTradeReason::EventWindowDisabled)
        } else if self.event_windows_today >= cap {
            Some(NoTradeReason::EventCapReached)
        } else {
            None
        };
        if let Some(reason) = refused {
            info!(
                count = self.event_windows_today,
                cap,
                code = reason.code(),
                "event window ignored"
            );
            let outcome = WindowOutcome {
                kind: WindowKind::Event,
                as_of: now,
                candidates: tickers,
                executed: Vec::new(),
                rejected: Vec::new(),
                llm: None,
                status: WindowStatus::NoTrade { reason },
                phases: Vec::new(),
            };
            self.publish(EngineEvent::WindowClosed(outcome.clone()));
            return outcome;
        }
        let breadth = self.config.llm.max_tickers_per_event_window;
        if tickers.len() > breadth {
            info!(requested = tickers.len(), breadth, "event window tickers truncated");
            tickers.truncate(breadth);
        }
        self.event_windows_today += 1;
        let outcome = self.run_window(WindowKind::Event, Some(tickers), now).await;
        self.publish(EngineEvent::WindowClosed(outcome.clone()));
        outcome
    }

    /// Evaluate one decision window end to end.
    async fn run_window(
        &mut self,
        kind: WindowKind,
        tickers: Option<Vec<String>>,
        now: NaiveDateTime,
    ) -> WindowOutcome {
        let candidates = tickers.unwrap_or_else(|| self.config.universe.clone());
        let mut outcome = WindowOutcome {
            kind,
            as_of: now,
            candidates: candidates.clone(),
            executed: Vec::new(),
            rejected: Vec::new(),
            llm: None,
            status: WindowStatus::NoTrade {
                reason: NoTradeReason::NoAcceptedProposals,
            },
            phases: vec![WindowPhase::WindowOpen],
        };

        // Context is built outside the lock; data gaps exclude tickers.
        let ctx = self
            .context
            .build(&candidates, now, self.prices.as_ref(), self.news.as_ref());
        outcome.phases.push(WindowPhase::ContextBuilt);
        if ctx.tickers.is_empty() {
            warn!(%now, "no candidate had usable data; window closes as no-trade");
            return outcome;
        }

        // Short lock: fingerprint, cache lookup, budget reservation.
        let prepared = {
            let state = self.state.lock();
            self.orchestrator
                .prepare(&ctx, &state.budget, self.llm.as_ref(), now)
        };

        let (record, proposals, dropped) = match prepared {
            Prepared::Exhausted(exhausted) => {
                outcome.status = WindowStatus::NoTrade {
                    reason: NoTradeReason::BudgetExhausted(exhausted),
                };
                return outcome;
            }
            Prepared::CacheHit { record, proposals } => {
                outcome.phases.push(WindowPhase::LlmResolved);
                (record, proposals, Vec::new())
            }
            Prepared::Call { fingerprint, prompt, .. } => {
                // The await happens with no lock held. A window past its
                // deadline is abandoned before anything is applied.
                let deadline = Duration::from_secs(self.config.execution.window_timeout_secs);
                let reply = match tokio::time::timeout(deadline, self.llm.complete(&prompt)).await
                {
                    Err(_) => Err(LlmCallError::Timeout),
                    Ok(result) => result,
                };
                match reply {
                    Err(err) => {
                        warn!(error = %err, "llm call failed; window closes as no-trade");
                        outcome.llm = Some(self.orchestrator.finish_failure(&fingerprint, &err));
                        outcome.status = WindowStatus::NoTrade {
                            reason: match err {
                                LlmCallError::Timeout => NoTradeReason::Timeout,
                                LlmCallError::Transport(_) => NoTradeReason::TransportError,
                            },
                        };
                        return outcome;
                    }
                    Ok(reply) => {
                        let validated = {
                            let mut state = self.state.lock();
                            let budget = &mut state.budget;
                            self.orchestrator
                                .finish_success(&fingerprint, &reply, budget, now)
                        };
                        outcome.phases.push(WindowPhase::LlmResolved);
                        match validated {
                            Validated::Invalid { record } => {
                                outcome.llm = Some(record);
                                outcome.status = WindowStatus::NoTrade {
                                    reason: NoTradeReason::InvalidResponse,
                                };
                                return outcome;
                            }
                            Validated::Proposals {
                                record,
                                proposals,
                                dropped,
                            } => (record, proposals, dropped),
                        }
                    }
                }
            }
        };
        outcome.llm = Some(record);
        for d in &dropped {
            outcome.rejected.push(RejectedProposal {
                ticker: d.ticker.clone(),
                side: None,
                quantity: None,
                code: d.code.clone(),
                detail: d.detail.clone(),
            });
        }

        // Prefetch reference bars for proposal tickers outside the lock.
        let proposal_tickers: BTreeSet<String> =
            proposals.iter().map(|p| p.ticker.clone()).collect();
        let snapshot_bars = SnapshotBars::prefetch(
            self.bars.as_ref(),
            proposal_tickers.iter().cloned(),
            now,
        );
        let marks = {
            let held = self.state.lock().portfolio.held_tickers();
            let mut all: Vec<String> = proposal_tickers.iter().cloned().collect();
            all.extend(held);
            self.marks_for(&all, now)
        };

        // Gate and execute atomically under the lock.
        self.gate_and_execute(&mut outcome, proposals, &snapshot_bars, &marks, now);
        outcome
    }

    fn gate_and_execute(
        &mut self,
        outcome: &mut WindowOutcome,
        proposals: Vec<Proposal>,
        snapshot_bars: &SnapshotBars,
        marks: &BTreeMap<String, Price>,
        now: NaiveDateTime,
    ) {
        let mut state = self.state.lock();

        let held: BTreeSet<String> = state.portfolio.held_tickers().into_iter().collect();
        let (kept, gated): (Vec<Proposal>, Vec<DroppedProposal>) =
            self.orchestrator.gate(proposals, &held);
        for d in gated {
            outcome.rejected.push(RejectedProposal {
                ticker: d.ticker,
                side: Some(Side::Buy),
                quantity: None,
                code: d.code,
                detail: d.detail,
            });
        }
        outcome.phases.push(WindowPhase::RiskGated);

        // Sells first, to free cash before new positions are sized.
        let (sells, buys): (Vec<Proposal>, Vec<Proposal>) =
            kept.into_iter().partition(|p| p.action == Side::Sell);
        for proposal in sells.into_iter().chain(buys) {
            let intent = OrderIntent::new(
                &proposal.ticker,
                proposal.action,
                proposal.quantity,
                OrderReason::LlmProposal,
            );

            let Some(est_price) =
                self.fills
                    .reference_price(snapshot_bars, &intent.ticker, now)
            else {
                outcome.rejected.push(RejectedProposal {
                    ticker: intent.ticker.clone(),
                    side: Some(intent.side),
                    quantity: Some(intent.quantity),
                    code: "no_reference_data".to_string(),
                    detail: "no reference bar within the staleness window".to_string(),
                });
                continue;
            };

            let risk_ctx = RiskContext {
                portfolio: &state.portfolio,
                marks,
                counters: &state.counters,
                cooldowns: &state.cooldowns,
                now,
            };
            if let Err(reason) = self.risk.evaluate(&intent, est_price, &risk_ctx) {
                info!(ticker = %intent.ticker, code = reason.code(), "proposal rejected by risk");
                outcome.rejected.push(RejectedProposal {
                    ticker: intent.ticker.clone(),
                    side: Some(intent.side),
                    quantity: Some(intent.quantity),
                    code: reason.code().to_string(),
                    detail: reason.to_string(),
                });
                continue;
            }

            let held_qty = state.portfolio.held_qty(&intent.ticker);
            let fill = match self.fills.simulate(snapshot_bars, &intent, held_qty, now) {
                Ok(fill) => fill,
                Err(err) => {
                    outcome.rejected.push(RejectedProposal {
                        ticker: intent.ticker.clone(),
                        side: Some(intent.side),
                        quantity: Some(intent.quantity),
                        code: err.code().to_string(),
                        detail: err.to_string(),
                    });
                    continue;
                }
            };

            match state.apply_fill(fill) {
                Ok(fill) => {
                    if fill.side == Side::Buy {
                        let stop = proposal
                            .stop
                            .unwrap_or(fill.price * (1.0 - self.config.risk.stop_loss_pct));
                        let take = proposal
                            .take_profit
                            .unwrap_or(fill.price * (1.0 + self.config.risk.take_profit_pct));
                        state
                            .portfolio
                            .arm_exits(&fill.ticker, Some(stop), Some(take));
                    }
                    let _ = self.events.send(EngineEvent::Fill(fill.clone()));
                    outcome.executed.push(fill);
                }
                Err(err) => {
                    outcome.rejected.push(RejectedProposal {
                        ticker: intent.ticker.clone(),
                        side: Some(intent.side),
                        quantity: Some(intent.quantity),
                        code: "cash_floor".to_string(),
                        detail: err.to_string(),
                    });
                }
            }
        }

        outcome.phases.push(WindowPhase::Executed);
        if !outcome.executed.is_empty() {
            outcome.status = WindowStatus::Traded;
        }
    }
}

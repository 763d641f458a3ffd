//! Risk Engine
//!
//! Pre-trade rule chain plus the continuous stop/take-profit monitor.
//!
//! The rule chain runs in a fixed order and the first failing check wins, so
//! every rejection carries exactly one reason code:
//!
//! 1. cooldown — no re-entry before the per-ticker cooldown elapses
//! 2. cash floor — ending cash ≥ min_cash_pct of ending equity
//! 3. concentration — single-ticker weight ≤ max_position_pct of equity
//! 4. position count — new names blocked at max_positions
//! 5. daily turnover — day's notional (this order included) ≤ cap
//! 6. daily order count — blocked at max_orders_per_day
//!
//! Forced exits (stop/take-profit/liquidation) never pass through the chain;
//! they execute whenever reference data exists, and a successful exit starts
//! the ticker's cooldown.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::engine::clock::minutes_between;
use crate::engine::config::{LimitsConfig, RiskConfig};
use crate::engine::portfolio::Portfolio;
use crate::engine::types::{OrderIntent, OrderReason, Price, Side};

/// Tagged rejection from the rule chain. Codes match the execution log
/// vocabulary and are stable across releases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    CooldownActive { ticker: String, remaining_minutes: f64 },
    MinCashBreach { ending_cash: f64, required: f64 },
    ConcentrationCap { weight: f64, cap: f64 },
    MaxPositionsReached { open: usize, cap: usize },
    TurnoverCapExceeded { day_notional: f64, cap_notional: f64 },
    OrderCountCapReached { orders: usize, cap: usize },
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::CooldownActive { .. } => "cooldown_active",
            RejectReason::MinCashBreach { .. } => "min_cash_buffer_breach",
            RejectReason::ConcentrationCap { .. } => "max_position_pct_breach",
            RejectReason::MaxPositionsReached { .. } => "max_positions_reached",
            RejectReason::TurnoverCapExceeded { .. } => "max_turnover_daily_breach",
            RejectReason::OrderCountCapReached { .. } => "max_orders_per_day_exceeded",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::CooldownActive { ticker, remaining_minutes } => {
                write!(f, "{ticker} in cooldown for another {remaining_minutes:.1} minutes")
            }
            RejectReason::MinCashBreach { ending_cash, required } => {
                write!(f, "ending cash ${ending_cash:.2} below required ${required:.2}")
            }
            RejectReason::ConcentrationCap { weight, cap } => {
                write!(f, "resulting weight {:.1}% above cap {:.1}%", weight * 100.0, cap * 100.0)
            }
            RejectReason::MaxPositionsReached { open, cap } => {
                write!(f, "{open} open positions at cap {cap}")
            }
            RejectReason::TurnoverCapExceeded { day_notional, cap_notional } => {
                write!(f, "day notional ${day_notional:.0} above cap ${cap_notional:.0}")
            }
            RejectReason::OrderCountCapReached { orders, cap } => {
                write!(f, "{orders} orders today at cap {cap}")
            }
        }
    }
}

/// Per-ticker last-exit timestamps backing the cooldown rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CooldownBook {
    last_exit: BTreeMap<String, NaiveDateTime>,
}

impl CooldownBook {
    pub fn record_exit(&mut self, ticker: &str, ts: NaiveDateTime) {
        self.last_exit.insert(ticker.to_string(), ts);
    }

    /// Minutes of cooldown remaining, or `None` if the ticker is clear.
    pub fn remaining_minutes(
        &self,
        ticker: &str,
        now: NaiveDateTime,
        cooldown_minutes: i64,
    ) -> Option<f64> {
        let exit = self.last_exit.get(ticker)?;
        let elapsed = minutes_between(*exit, now);
        let remaining = cooldown_minutes as f64 - elapsed;
        (remaining > 0.0).then_some(remaining)
    }
}

/// Rolling per-day counters feeding turnover and order-count checks.
/// Rolls over at the ET day boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayCounters {
    pub date: NaiveDate,
    pub turnover_notional: f64,
    pub orders: usize,
    /// Equity at the prior day's close; turnover is capped against it.
    pub prior_close_equity: f64,
}

impl DayCounters {
    pub fn new(date: NaiveDate, starting_equity: f64) -> Self {
        Self {
            date,
            turnover_notional: 0.0,
            orders: 0,
            prior_close_equity: starting_equity,
        }
    }

    /// Start a new day. `close_equity` is equity observed at rollover time
    /// and becomes the new turnover base.
    pub fn rollover(&mut self, date: NaiveDate, close_equity: f64) {
        self.date = date;
        self.turnover_notional = 0.0;
        self.orders = 0;
        self.prior_close_equity = close_equity;
    }

    pub fn record_fill(&mut self, notional: f64) {
        self.turnover_notional += notional;
        self.orders += 1;
    }
}

/// Pre-trade risk state snapshot handed to the rule chain.
pub struct RiskContext<'a> {
    pub portfolio: &'a Portfolio,
    pub marks: &'a BTreeMap<String, Price>,
    pub counters: &'a DayCounters,
    pub cooldowns: &'a CooldownBook,
    pub now: NaiveDateTime,
}

/// Enforces the ordered rule chain and produces monitor-driven exits.
#[derive(Debug, Clone)]
pub struct RiskEngine {
    risk: RiskConfig,
    limits: LimitsConfig,
    commission_usd: f64,
}

impl RiskEngine {
    pub fn new(risk: RiskConfig, limits: LimitsConfig, commission_usd: f64) -> Self {
        Self {
            risk,
            limits,
            commission_usd,
        }
    }

    /// Evaluate a candidate order against the rule chain. `est_price` is the
    /// reference price used for notional and weight arithmetic. Forced exits
    /// must not be routed through here.
    pub fn evaluate(
        &self,
        intent: &OrderIntent,
        est_price: Price,
        ctx: &RiskContext<'_>,
    ) -> Result<(), RejectReason> {
        debug_assert!(!intent.reason.is_forced_exit(), "forced exits bypass the rule chain");
        let notional = intent.quantity * est_price;
        let is_buy = intent.side == Side::Buy;

        // (1) cooldown
        if is_buy {
            if let Some(remaining) = ctx.cooldowns.remaining_minutes(
                &intent.ticker,
                ctx.now,
                self.limits.cooldown_minutes_after_exit,
            ) {
                return Err(RejectReason::CooldownActive {
                    ticker: intent.ticker.clone(),
                    remaining_minutes: remaining,
                });
            }
        }

        let equity = ctx.portfolio.equity(ctx.marks);

        // (2) cash floor
        if is_buy {
            let ending_cash = ctx.portfolio.cash - notional - self.commission_usd;
            let ending_equity = equity - self.commission_usd;
            let required = self.risk.min_cash_pct * ending_equity;
            if ending_cash < required {
                return Err(RejectReason::MinCashBreach { ending_cash, required });
            }
        }

        // (3) per-ticker concentration
        if is_buy {
            let ending_equity = equity - self.commission_usd;
            let held_value = ctx.portfolio.held_qty(&intent.ticker) * est_price;
            let weight = if ending_equity > 0.0 {
                (held_value + notional) / ending_equity
            } else {
                f64::INFINITY
            };
            if weight > self.risk.max_position_pct {
                return Err(RejectReason::ConcentrationCap {
                    weight,
                    cap: self.risk.max_position_pct,
                });
            }
        }

        // (4) position count, new names only
        if is_buy && !ctx.portfolio.holds(&intent.ticker) {
            let open = ctx.portfolio.open_position_count();
            if open >= self.risk.max_positions {
                return Err(RejectReason::MaxPositionsReached {
                    open,
                    cap: self.risk.max_positions,
                });
            }
        }

        // (5) daily turnover, this order included
        let cap_notional =
            self.limits.max_turnover_daily_pct * ctx.counters.prior_close_equity;
        let day_notional = ctx.counters.turnover_notional + notional;
        if day_notional > cap_notional {
            return Err(RejectReason::TurnoverCapExceeded {
                day_notional,
                cap_notional,
            });
        }

        // (6) daily order count
        if ctx.counters.orders >= self.limits.max_orders_per_day {
            return Err(RejectReason::OrderCountCapReached {
                orders: ctx.counters.orders,
                cap: self.limits.max_orders_per_day,
            });
        }

        Ok(())
    }

    /// Continuous monitor pass: emit full-position forced exits for every
    /// open position whose latest mark crosses its armed stop or take-profit
    /// trigger. Positions without a fresh mark are left alone.
    pub fn check_exits(
        &self,
        portfolio: &Portfolio,
        marks: &BTreeMap<String, Price>,
    ) -> Vec<OrderIntent> {
        let mut exits = Vec::new();
        for pos in portfolio.positions() {
            let Some(mark) = marks.get(&pos.ticker) else {
                continue;
            };
            let stop = pos
                .stop_price
                .unwrap_or(pos.avg_cost * (1.0 - self.risk.stop_loss_pct));
            let take = pos
                .take_profit_price
                .unwrap_or(pos.avg_cost * (1.0 + self.risk.take_profit_pct));
            if *mark <= stop {
                tracing::info!(ticker = %pos.ticker, mark, stop, "stop-loss triggered");
                exits.push(OrderIntent::forced_exit(
                    &pos.ticker,
                    pos.quantity,
                    OrderReason::Stop,
                ));
            } else if *mark >= take {
                tracing::info!(ticker = %pos.ticker, mark, take, "take-profit triggered");
                exits.push(OrderIntent::forced_exit(
                    &pos.ticker,
                    pos.quantity,
                    OrderReason::TakeProfit,
                ));
            }
        }
        exits
    }
}

//! Portfolio and Position Accounting
//!
//! Plain value aggregates mutated only by fill application. The cash-floor
//! invariant (cash never negative after an accepted fill) is checked before
//! any state is touched, so a rejected fill leaves the portfolio unchanged.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::engine::types::{Fill, Price, Qty, Side};

/// Quantities below this are treated as a closed position.
const QTY_EPSILON: f64 = 1e-9;

/// Open long position in a single ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticker: String,
    pub quantity: Qty,
    pub avg_cost: Price,
    pub entered_at: NaiveDateTime,
    /// Armed stop-loss trigger price, if any.
    pub stop_price: Option<Price>,
    /// Armed take-profit trigger price, if any.
    pub take_profit_price: Option<Price>,
}

impl Position {
    pub fn market_value(&self, mark: Price) -> f64 {
        self.quantity * mark
    }

    pub fn unrealized_pnl(&self, mark: Price) -> f64 {
        (mark - self.avg_cost) * self.quantity
    }
}

/// Why a fill could not be applied.
#[derive(Debug, Clone, PartialEq)]
pub enum PortfolioError {
    /// Applying the fill would drive cash negative.
    CashFloorViolated { required: f64, available: f64 },
    /// Sell against a ticker with no open position.
    NoSuchPosition { ticker: String },
}

impl std::fmt::Display for PortfolioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortfolioError::CashFloorViolated { required, available } => write!(
                f,
                "fill requires ${required:.2} cash but only ${available:.2} is available"
            ),
            PortfolioError::NoSuchPosition { ticker } => {
                write!(f, "no open position in {ticker}")
            }
        }
    }
}

impl std::error::Error for PortfolioError {}

/// Cash plus open positions. Total equity = cash + Σ position market values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub cash: f64,
    /// Keyed by ticker; BTreeMap keeps iteration deterministic.
    positions: BTreeMap<String, Position>,
    pub realized_pnl: f64,
}

impl Portfolio {
    pub fn new(initial_cash: f64) -> Self {
        Self {
            cash: initial_cash,
            positions: BTreeMap::new(),
            realized_pnl: 0.0,
        }
    }

    pub fn position(&self, ticker: &str) -> Option<&Position> {
        self.positions.get(ticker)
    }

    pub fn held_qty(&self, ticker: &str) -> Qty {
        self.positions.get(ticker).map_or(0.0, |p| p.quantity)
    }

    pub fn holds(&self, ticker: &str) -> bool {
        self.held_qty(ticker) > QTY_EPSILON
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }

    /// Open positions in ticker order.
    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn held_tickers(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    /// Total equity given per-ticker marks. Positions without a mark fall
    /// back to average cost so equity stays defined under data gaps.
    pub fn equity(&self, marks: &BTreeMap<String, Price>) -> f64 {
        let positions_value: f64 = self
            .positions
            .values()
            .map(|p| p.market_value(*marks.get(&p.ticker).unwrap_or(&p.avg_cost)))
            .sum();
        self.cash + positions_value
    }

    /// Arm stop/take-profit triggers on an open position. No-op for tickers
    /// without a position.
    pub fn arm_exits(&mut self, ticker: &str, stop: Option<Price>, take_profit: Option<Price>) {
        if let Some(pos) = self.positions.get_mut(ticker) {
            pos.stop_price = stop;
            pos.take_profit_price = take_profit;
        }
    }

    /// Apply an executed fill. The only mutation entry point for cash and
    /// positions. Checks the cash floor before touching state.
    pub fn apply_fill(&mut self, fill: &Fill) -> Result<(), PortfolioError> {
        match fill.side {
            Side::Buy => {
                let required = fill.notional() + fill.commission_usd;
                if required > self.cash {
                    return Err(PortfolioError::CashFloorViolated {
                        required,
                        available: self.cash,
                    });
                }
                let pos = self
                    .positions
                    .entry(fill.ticker.clone())
                    .or_insert_with(|| Position {
                        ticker: fill.ticker.clone(),
                        quantity: 0.0,
                        avg_cost: 0.0,
                        entered_at: fill.ts_et,
                        stop_price: None,
                        take_profit_price: None,
                    });
                let new_qty = pos.quantity + fill.quantity;
                pos.avg_cost = if new_qty > QTY_EPSILON {
                    (pos.avg_cost * pos.quantity + fill.notional()) / new_qty
                } else {
                    0.0
                };
                pos.quantity = new_qty;
                self.cash -= required;
            }
            Side::Sell => {
                let pos = self.positions.get_mut(&fill.ticker).ok_or_else(|| {
                    PortfolioError::NoSuchPosition {
                        ticker: fill.ticker.clone(),
                    }
                })?;
                // The fill simulator clamps sells to held quantity.
                debug_assert!(fill.quantity <= pos.quantity + QTY_EPSILON);
                let proceeds = fill.notional();
                if self.cash + proceeds < fill.commission_usd {
                    return Err(PortfolioError::CashFloorViolated {
                        required: fill.commission_usd,
                        available: self.cash + proceeds,
                    });
                }
                self.realized_pnl += (fill.price - pos.avg_cost) * fill.quantity;
                pos.quantity -= fill.quantity;
                self.cash += proceeds - fill.commission_usd;
                if pos.quantity <= QTY_EPSILON {
                    self.positions.remove(&fill.ticker);
                }
            }
        }
        Ok(())
    }
}

//! Core Order and Market Data Types
//!
//! Shared value types for the decision-and-risk engine. Everything here is a
//! plain serializable value; persistence and transport are collaborator
//! concerns.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Price in USD.
pub type Price = f64;

/// Share quantity. Fractional shares are supported.
pub type Qty = f64;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[inline]
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Why an order intent was created. Forced exits (`Stop`, `TakeProfit`,
/// `ForcedExit`) bypass the risk rule chain and the minimum-notional rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderReason {
    /// Accepted LLM proposal from a decision window.
    LlmProposal,
    /// Stop-loss trigger from the continuous monitor.
    Stop,
    /// Take-profit trigger from the continuous monitor.
    TakeProfit,
    /// Risk-driven liquidation outside the monitor triggers.
    ForcedExit,
}

impl OrderReason {
    /// Stable tag recorded on fills, matching the execution log vocabulary.
    pub fn tag(&self) -> &'static str {
        match self {
            OrderReason::LlmProposal => "llm",
            OrderReason::Stop => "stop",
            OrderReason::TakeProfit => "target",
            OrderReason::ForcedExit => "forced",
        }
    }

    /// Forced exits skip the rule chain and the minimum-notional check.
    #[inline]
    pub fn is_forced_exit(&self) -> bool {
        matches!(
            self,
            OrderReason::Stop | OrderReason::TakeProfit | OrderReason::ForcedExit
        )
    }
}

/// Bar granularity ladder used for reference-price fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarTimeframe {
    Minute,
    FiveMinute,
    Daily,
}

impl BarTimeframe {
    /// Next coarser granularity, or `None` past daily.
    pub fn coarser(&self) -> Option<BarTimeframe> {
        match self {
            BarTimeframe::Minute => Some(BarTimeframe::FiveMinute),
            BarTimeframe::FiveMinute => Some(BarTimeframe::Daily),
            BarTimeframe::Daily => None,
        }
    }
}

/// OHLCV price bar in ET time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts_et: NaiveDateTime,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: f64,
}

impl Bar {
    /// Fill reference price: midpoint of the bar's range.
    #[inline]
    pub fn midpoint(&self) -> Price {
        (self.high + self.low) / 2.0
    }
}

/// A request to trade, consumed exactly once by the fill simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub ticker: String,
    pub side: Side,
    pub quantity: Qty,
    pub reason: OrderReason,
}

impl OrderIntent {
    pub fn new(ticker: impl Into<String>, side: Side, quantity: Qty, reason: OrderReason) -> Self {
        Self {
            ticker: ticker.into(),
            side,
            quantity,
            reason,
        }
    }

    /// Full-position exit emitted by the stop/take-profit monitor.
    pub fn forced_exit(ticker: impl Into<String>, quantity: Qty, reason: OrderReason) -> Self {
        debug_assert!(reason.is_forced_exit());
        Self::new(ticker, Side::Sell, quantity, reason)
    }
}

/// An executed trade. Immutable once created; appended to the execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub ts_et: NaiveDateTime,
    pub ticker: String,
    pub side: Side,
    pub quantity: Qty,
    /// Executed price with slippage already applied.
    pub price: Price,
    pub slippage_bps: f64,
    pub commission_usd: f64,
    pub reason: OrderReason,
}

impl Fill {
    /// Traded notional, excluding commission.
    #[inline]
    pub fn notional(&self) -> f64 {
        self.quantity * self.price
    }
}

/// Aggregated news metrics for one ticker as of a window, supplied by the
/// news collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NewsMetrics {
    pub count_1d: u32,
    pub count_7d: u32,
    /// Fraction of recent items not seen in the prior window (0..=1).
    pub novelty: f64,
    /// Recency-weighted mean sentiment (-1..=1).
    pub recency_weighted_sentiment: f64,
}

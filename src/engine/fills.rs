//! Fill Simulator
//!
//! Turns an order intent plus a reference bar into an executed trade:
//! midpoint price, slippage adverse to the trader's side, fixed per-order
//! commission. Produces exactly one fill or none; never partial fills.
//!
//! Reference data comes from an injected [`BarSource`]. When no fresh minute
//! bar exists the simulator walks the fallback ladder (minute → 5-minute →
//! daily) before giving up with `InsufficientReferenceData`.

use chrono::{Duration, NaiveDateTime};

use crate::engine::config::ExecutionConfig;
use crate::engine::types::{Bar, BarTimeframe, Fill, OrderIntent, Price, Qty, Side};

/// Daily bars stay usable across a weekend.
const DAILY_STALENESS_MINUTES: i64 = 4 * 24 * 60;

/// Source of OHLCV reference bars, supplied by the price collaborator.
pub trait BarSource: Send + Sync {
    /// Latest bar at or before `ts` for the given granularity, if any.
    fn bar_at_or_before(&self, ticker: &str, ts: NaiveDateTime, timeframe: BarTimeframe)
        -> Option<Bar>;
}

/// Why an order intent produced no fill.
#[derive(Debug, Clone, PartialEq)]
pub enum FillError {
    /// No bar at or before the timestamp within the staleness window, at any
    /// granularity. The caller skips the order.
    InsufficientReferenceData { ticker: String, ts: NaiveDateTime },
    /// Opening/adding order below the minimum notional. Exits are exempt.
    BelowMinNotional { notional: f64, min: f64 },
    /// Nothing to trade after clamping (e.g. sell with no held shares, or a
    /// sub-share order with fractional trading disabled).
    ZeroQuantity { ticker: String },
}

impl FillError {
    /// Stable reason code recorded on rejected proposals.
    pub fn code(&self) -> &'static str {
        match self {
            FillError::InsufficientReferenceData { .. } => "no_reference_data",
            FillError::BelowMinNotional { .. } => "min_order_breach",
            FillError::ZeroQuantity { .. } => "zero_quantity",
        }
    }
}

impl std::fmt::Display for FillError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FillError::InsufficientReferenceData { ticker, ts } => {
                write!(f, "no reference bar for {ticker} at or before {ts}")
            }
            FillError::BelowMinNotional { notional, min } => {
                write!(f, "order notional ${notional:.2} below minimum ${min:.2}")
            }
            FillError::ZeroQuantity { ticker } => {
                write!(f, "nothing to fill for {ticker}")
            }
        }
    }
}

impl std::error::Error for FillError {}

/// Simulates fills against reference bars under fixed execution rules.
#[derive(Debug, Clone)]
pub struct FillSimulator {
    config: ExecutionConfig,
}

impl FillSimulator {
    pub fn new(config: ExecutionConfig) -> Self {
        Self { config }
    }

    /// Reference price for risk sizing: midpoint of the freshest usable bar.
    pub fn reference_price(
        &self,
        bars: &dyn BarSource,
        ticker: &str,
        ts: NaiveDateTime,
    ) -> Option<Price> {
        self.reference_bar(bars, ticker, ts).map(|(bar, _)| bar.midpoint())
    }

    fn staleness_limit(&self, timeframe: BarTimeframe) -> Duration {
        match timeframe {
            BarTimeframe::Minute | BarTimeframe::FiveMinute => {
                Duration::minutes(self.config.max_staleness_minutes)
            }
            BarTimeframe::Daily => Duration::minutes(DAILY_STALENESS_MINUTES),
        }
    }

    fn reference_bar(
        &self,
        bars: &dyn BarSource,
        ticker: &str,
        ts: NaiveDateTime,
    ) -> Option<(Bar, BarTimeframe)> {
        let mut timeframe = Some(BarTimeframe::Minute);
        while let Some(tf) = timeframe {
            if let Some(bar) = bars.bar_at_or_before(ticker, ts, tf) {
                if bar.ts_et <= ts && ts - bar.ts_et <= self.staleness_limit(tf) {
                    return Some((bar, tf));
                }
            }
            timeframe = tf.coarser();
        }
        None
    }

    /// Execute an order intent. `held_qty` is the caller's current position
    /// in the ticker; sells are clamped to it (long-only, no shorting).
    pub fn simulate(
        &self,
        bars: &dyn BarSource,
        intent: &OrderIntent,
        held_qty: Qty,
        now: NaiveDateTime,
    ) -> Result<Fill, FillError> {
        let (bar, timeframe) = self.reference_bar(bars, &intent.ticker, now).ok_or_else(|| {
            FillError::InsufficientReferenceData {
                ticker: intent.ticker.clone(),
                ts: now,
            }
        })?;
        if timeframe != BarTimeframe::Minute {
            tracing::debug!(
                ticker = %intent.ticker,
                timeframe = ?timeframe,
                bar_ts = %bar.ts_et,
                "fill reference fell back to coarser bar"
            );
        }

        let mut quantity = match intent.side {
            Side::Buy => intent.quantity,
            Side::Sell => intent.quantity.min(held_qty),
        };
        if !self.config.allow_fractional {
            quantity = quantity.floor();
        }
        if quantity <= 0.0 {
            return Err(FillError::ZeroQuantity {
                ticker: intent.ticker.clone(),
            });
        }

        // Slippage is adverse: buys pay up, sells receive less.
        let slip = self.config.slippage_bps / 10_000.0;
        let price = bar.midpoint() * (1.0 + intent.side.sign() * slip);

        let notional = quantity * price;
        if intent.side == Side::Buy
            && !intent.reason.is_forced_exit()
            && notional < self.config.min_order_usd
        {
            return Err(FillError::BelowMinNotional {
                notional,
                min: self.config.min_order_usd,
            });
        }

        Ok(Fill {
            ts_et: now,
            ticker: intent.ticker.clone(),
            side: intent.side,
            quantity,
            price,
            slippage_bps: self.config.slippage_bps,
            commission_usd: self.config.commission_usd,
            reason: intent.reason,
        })
    }
}

//! Context Builder
//!
//! Ranks the candidate universe by salience (momentum + news novelty ×
//! recency-weighted sentiment magnitude), keeps the top-k, and compacts each
//! survivor into a bounded summary under the per-window token budget.
//!
//! # Determinism Contract
//!
//! Identical inputs must produce byte-identical payloads: selection ties
//! break by ticker symbol, summaries keep a fixed field order, and
//! truncation strips fields in a fixed sequence from the least-salient
//! ticker first. The dedupe fingerprint hashes these bytes, so any
//! nondeterminism here would defeat request dedupe.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::engine::types::{NewsMetrics, Price};

/// Per-ticker price metrics as of a decision window, supplied by the price
/// collaborator (intraday indicator snapshots in the source system).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceMetrics {
    pub last_price: Price,
    /// 1-day return.
    pub r1d: f64,
    /// 5-day return; the momentum leg of the salience score.
    pub r5d: f64,
    /// 20-day return.
    pub r20d: f64,
    pub rsi_14: Option<f64>,
    pub macd: Option<f64>,
}

/// Price metrics source. Returning `None` excludes the ticker from the
/// window rather than blocking it.
pub trait PriceMetricsSource: Send + Sync {
    fn metrics(&self, ticker: &str, as_of: NaiveDateTime) -> Option<PriceMetrics>;
}

/// News metrics source. Missing metrics degrade to a zero news signal.
pub trait NewsMetricsSource: Send + Sync {
    fn metrics(&self, ticker: &str, as_of: NaiveDateTime) -> Option<NewsMetrics>;
}

/// Relative weights of the two salience legs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SalienceWeights {
    pub momentum: f64,
    pub news: f64,
}

impl Default for SalienceWeights {
    fn default() -> Self {
        Self {
            momentum: 0.6,
            news: 0.4,
        }
    }
}

/// Compact per-ticker summary sent to the LLM. Field order is part of the
/// canonical payload; do not reorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerSummary {
    pub ticker: String,
    pub price: Price,
    pub r1d: f64,
    pub r5d: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r20d: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsi_14: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd: Option<f64>,
    pub news_count_1d: u32,
    pub news_count_7d: u32,
    pub news_novelty: f64,
    pub news_sentiment: f64,
    /// Salience score; carried for observability, not sent as a gate input.
    pub salience: f64,
}

/// The compacted decision-window context. `canonical_json` is the exact
/// byte sequence the fingerprint hashes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionContext {
    pub as_of: NaiveDateTime,
    /// Top-k summaries in descending salience order (ties by symbol).
    pub tickers: Vec<TickerSummary>,
    /// Not part of the canonical payload.
    #[serde(skip)]
    pub estimated_tokens: usize,
}

impl DecisionContext {
    pub fn canonical_json(&self) -> String {
        // Struct field order is fixed, ticker order is fixed by the builder,
        // so serde_json output is canonical as-is.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn ticker_symbols(&self) -> Vec<String> {
        self.tickers.iter().map(|t| t.ticker.clone()).collect()
    }
}

/// Rough token estimate: four characters per token.
pub fn estimate_tokens(payload: &str) -> usize {
    (payload.len() + 3) / 4
}

/// Builds token-budgeted, deterministic decision contexts.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    weights: SalienceWeights,
    top_k: usize,
    token_budget: usize,
}

impl ContextBuilder {
    pub fn new(weights: SalienceWeights, top_k: usize, token_budget: usize) -> Self {
        Self {
            weights,
            top_k,
            token_budget,
        }
    }

    fn salience(&self, price: &PriceMetrics, news: Option<&NewsMetrics>) -> f64 {
        let news_signal = news
            .map(|n| n.novelty * n.recency_weighted_sentiment.abs())
            .unwrap_or(0.0);
        self.weights.momentum * price.r5d + self.weights.news * news_signal
    }

    /// Build the context for one decision window. Tickers without price
    /// metrics are skipped (logged), never fatal.
    pub fn build(
        &self,
        universe: &[String],
        as_of: NaiveDateTime,
        prices: &dyn PriceMetricsSource,
        news: &dyn NewsMetricsSource,
    ) -> DecisionContext {
        let mut scored: Vec<TickerSummary> = Vec::with_capacity(universe.len());
        for ticker in universe {
            let Some(pm) = prices.metrics(ticker, as_of) else {
                tracing::warn!(ticker = %ticker, %as_of, "no price metrics; excluding from window");
                continue;
            };
            let nm = news.metrics(ticker, as_of);
            let salience = self.salience(&pm, nm.as_ref());
            let nm = nm.unwrap_or(NewsMetrics {
                count_1d: 0,
                count_7d: 0,
                novelty: 0.0,
                recency_weighted_sentiment: 0.0,
            });
            scored.push(TickerSummary {
                ticker: ticker.clone(),
                price: pm.last_price,
                r1d: pm.r1d,
                r5d: pm.r5d,
                r20d: Some(pm.r20d),
                rsi_14: pm.rsi_14,
                macd: pm.macd,
                news_count_1d: nm.count_1d,
                news_count_7d: nm.count_7d,
                news_novelty: nm.novelty,
                news_sentiment: nm.recency_weighted_sentiment,
                salience,
            });
        }

        // Descending salience, ties by symbol ascending for determinism.
        scored.sort_by(|a, b| {
            b.salience
                .total_cmp(&a.salience)
                .then_with(|| a.ticker.cmp(&b.ticker))
        });
        scored.truncate(self.top_k);

        let mut ctx = DecisionContext {
            as_of,
            tickers: scored,
            estimated_tokens: 0,
        };
        self.compact(&mut ctx);
        ctx
    }

    /// Trim the context under the token budget: optional indicator fields
    /// are stripped from the least-salient ticker first (macd, then rsi_14,
    /// then r20d), then whole tickers are dropped from the tail. Survivor
    /// order never changes.
    fn compact(&self, ctx: &mut DecisionContext) {
        ctx.estimated_tokens = estimate_tokens(&ctx.canonical_json());
        if ctx.estimated_tokens <= self.token_budget {
            return;
        }

        for strip in [
            |t: &mut TickerSummary| t.macd = None,
            |t: &mut TickerSummary| t.rsi_14 = None,
            |t: &mut TickerSummary| t.r20d = None,
        ] {
            for idx in (0..ctx.tickers.len()).rev() {
                strip(&mut ctx.tickers[idx]);
                ctx.estimated_tokens = estimate_tokens(&ctx.canonical_json());
                if ctx.estimated_tokens <= self.token_budget {
                    return;
                }
            }
        }

        while ctx.tickers.len() > 1 {
            ctx.tickers.pop();
            ctx.estimated_tokens = estimate_tokens(&ctx.canonical_json());
            if ctx.estimated_tokens <= self.token_budget {
                return;
            }
        }
        tracing::warn!(
            tokens = ctx.estimated_tokens,
            budget = self.token_budget,
            "context still over token budget after full compaction"
        );
    }
}

//! LLM Orchestrator
//!
//! Drives one decision window's call lifecycle:
//!
//! ```text
//! Built → Fingerprinted → {CacheHit | Budgeted → Called → Validated → Gated} → Closed
//! ```
//!
//! The orchestrator itself is synchronous on both sides of the external call
//! (`prepare` / `finish_*`), so the scheduler can hold the portfolio lock
//! only around those steps and never across the await. The LLM is an
//! injected [`LlmClient`]; the orchestrator never assumes the call succeeds.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::engine::budget::{BudgetExhausted, BudgetLedger};
use crate::engine::clock::minutes_between;
use crate::engine::config::LlmConfig;
use crate::engine::context::{estimate_tokens, DecisionContext};
use crate::engine::fingerprint::window_fingerprint;
use crate::engine::types::Side;

/// One trade proposal from the model, after schema validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub ticker: String,
    pub action: Side,
    pub quantity: f64,
    /// Model-stated expected return (fraction); gated for new-position buys.
    #[serde(default)]
    pub expected_return: Option<f64>,
    #[serde(default)]
    pub thesis: Option<String>,
    #[serde(default)]
    pub horizon_days: Option<u32>,
    #[serde(default)]
    pub stop: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// A proposal dropped before risk gating, with its reason code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedProposal {
    pub ticker: String,
    pub code: String,
    pub detail: String,
}

/// Successful raw completion from the model.
#[derive(Debug, Clone)]
pub struct LlmReply {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost_usd: f64,
}

/// Failure modes of the external call. The scheduler applies the window
/// timeout, so `Timeout` can originate on either side.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmCallError {
    Timeout,
    Transport(String),
}

impl std::fmt::Display for LlmCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmCallError::Timeout => write!(f, "llm call timed out"),
            LlmCallError::Transport(msg) => write!(f, "llm transport error: {msg}"),
        }
    }
}

impl std::error::Error for LlmCallError {}

/// Injected LLM capability.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<LlmReply, LlmCallError>;

    /// Pre-call cost estimate for the budget check.
    fn estimate_cost_usd(&self, prompt_tokens: usize) -> f64;
}

/// Terminal outcome of the call itself (not of the window).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Ok,
    SchemaInvalid,
    Timeout,
    TransportError,
}

/// Observable record of one LLM call (or cache hit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmCallRecord {
    pub fingerprint: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost_usd: f64,
    pub cache_hit: bool,
    pub outcome: CallOutcome,
}

#[derive(Debug, Clone)]
struct CachedWindow {
    ts: NaiveDateTime,
    record: LlmCallRecord,
    /// Validated proposals, pre-gate. The gate re-runs on every hit because
    /// the held set may have changed since the original call.
    proposals: Vec<Proposal>,
}

/// Outcome of the pre-call phase.
#[derive(Debug)]
pub enum Prepared {
    /// Fingerprint seen within the dedupe horizon; no budget consumed.
    CacheHit {
        record: LlmCallRecord,
        proposals: Vec<Proposal>,
    },
    /// Budget reserved; caller performs the external call.
    Call {
        fingerprint: String,
        prompt: String,
        prompt_tokens: usize,
    },
    /// Would exceed a spend cap; window closes as no-trade.
    Exhausted(BudgetExhausted),
}

/// Result of validating a completed call.
#[derive(Debug)]
pub enum Validated {
    Proposals {
        record: LlmCallRecord,
        proposals: Vec<Proposal>,
        dropped: Vec<DroppedProposal>,
    },
    /// Top-level payload unparseable; whole window fails, no retry.
    Invalid { record: LlmCallRecord },
}

/// Budget- and cache-aware LLM call coordinator.
pub struct Orchestrator {
    config: LlmConfig,
    cache: HashMap<String, CachedWindow>,
}

impl Orchestrator {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            config,
            cache: HashMap::new(),
        }
    }

    /// Prompt for one window. The template version participates in the
    /// fingerprint, so any change here invalidates old cache entries.
    pub fn render_prompt(&self, ctx: &DecisionContext) -> String {
        format!(
            concat!(
                "You manage a long-only US equity portfolio. Given the market context\n",
                "below, propose trades as JSON: {{\"proposals\": [{{\"ticker\", \"action\"\n",
                "(BUY|SELL), \"quantity\", \"expected_return\", \"thesis\", \"stop\",\n",
                "\"take_profit\", \"confidence\"}}]}}. Propose nothing if no edge.\n\n",
                "Context ({version}):\n{context}\n"
            ),
            version = self.config.prompt_version,
            context = ctx.canonical_json(),
        )
    }

    /// Fingerprint, cache lookup, and budget reservation. Synchronous; the
    /// scheduler calls this under the state lock. The cost estimate comes
    /// from the injected client, which knows its own pricing.
    pub fn prepare(
        &mut self,
        ctx: &DecisionContext,
        budget: &BudgetLedger,
        client: &dyn LlmClient,
        now: NaiveDateTime,
    ) -> Prepared {
        let canonical = ctx.canonical_json();
        let fingerprint = window_fingerprint(&self.config.prompt_version, &canonical);

        if let Some(hit) = self.cache.get(&fingerprint) {
            if minutes_between(hit.ts, now) <= self.config.dedupe_horizon_minutes as f64 {
                tracing::info!(fingerprint = %fingerprint, "decision window served from cache");
                let mut record = hit.record.clone();
                record.cache_hit = true;
                record.cost_usd = 0.0;
                return Prepared::CacheHit {
                    record,
                    proposals: hit.proposals.clone(),
                };
            }
        }

        let prompt = self.render_prompt(ctx);
        let prompt_tokens = estimate_tokens(&prompt);
        let est_cost = client.estimate_cost_usd(prompt_tokens);
        if let Err(exhausted) = budget.try_reserve(est_cost) {
            tracing::info!(
                estimated_cost = est_cost,
                remaining_daily = exhausted.remaining_daily_usd,
                remaining_monthly = exhausted.remaining_monthly_usd,
                "budget exhausted; window closes as no-trade"
            );
            return Prepared::Exhausted(exhausted);
        }

        Prepared::Call {
            fingerprint,
            prompt,
            prompt_tokens,
        }
    }

    /// Record spend, validate the payload, and cache the validated result.
    /// Synchronous; called under the state lock after the await.
    pub fn finish_success(
        &mut self,
        fingerprint: &str,
        reply: &LlmReply,
        budget: &mut BudgetLedger,
        now: NaiveDateTime,
    ) -> Validated {
        budget.record(reply.cost_usd);
        let mut record = LlmCallRecord {
            fingerprint: fingerprint.to_string(),
            model: self.config.model.clone(),
            prompt_tokens: reply.prompt_tokens,
            completion_tokens: reply.completion_tokens,
            cost_usd: reply.cost_usd,
            cache_hit: false,
            outcome: CallOutcome::Ok,
        };

        let (proposals, dropped) = match parse_proposals(&reply.text) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(fingerprint = %fingerprint, error = %err, "unparseable llm payload");
                record.outcome = CallOutcome::SchemaInvalid;
                return Validated::Invalid { record };
            }
        };

        self.cache.insert(
            fingerprint.to_string(),
            CachedWindow {
                ts: now,
                record: record.clone(),
                proposals: proposals.clone(),
            },
        );
        Validated::Proposals {
            record,
            proposals,
            dropped,
        }
    }

    /// Evict cache entries past the dedupe horizon. Expired entries are
    /// already ignored on lookup; this keeps the map bounded in a
    /// long-running process. Called at day rollover.
    pub fn prune_expired(&mut self, now: NaiveDateTime) {
        let horizon = self.config.dedupe_horizon_minutes as f64;
        self.cache
            .retain(|_, entry| minutes_between(entry.ts, now) <= horizon);
    }

    /// Record for a call that never returned a payload. Failed windows are
    /// not cached; the next trigger may retry.
    pub fn finish_failure(&self, fingerprint: &str, error: &LlmCallError) -> LlmCallRecord {
        LlmCallRecord {
            fingerprint: fingerprint.to_string(),
            model: self.config.model.clone(),
            prompt_tokens: 0,
            completion_tokens: 0,
            cost_usd: 0.0,
            cache_hit: false,
            outcome: match error {
                LlmCallError::Timeout => CallOutcome::Timeout,
                LlmCallError::Transport(_) => CallOutcome::TransportError,
            },
        }
    }

    /// Expected-return gate: a buy opening a new position must state an
    /// expected return at or above the threshold. Adds to held tickers and
    /// all sells pass ungated.
    pub fn gate(
        &self,
        proposals: Vec<Proposal>,
        held: &BTreeSet<String>,
    ) -> (Vec<Proposal>, Vec<DroppedProposal>) {
        let threshold = self.config.expected_return_gate_pct;
        let mut kept = Vec::with_capacity(proposals.len());
        let mut dropped = Vec::new();
        for p in proposals {
            let new_buy = p.action == Side::Buy && !held.contains(&p.ticker);
            if new_buy && p.expected_return.unwrap_or(0.0) < threshold {
                dropped.push(DroppedProposal {
                    ticker: p.ticker.clone(),
                    code: "expected_return_gate".to_string(),
                    detail: format!(
                        "expected return {:.1}% below gate {:.1}%",
                        p.expected_return.unwrap_or(0.0) * 100.0,
                        threshold * 100.0
                    ),
                });
            } else {
                kept.push(p);
            }
        }
        (kept, dropped)
    }
}

/// Parse the top-level payload. An unparseable top level is a whole-window
/// failure; individually malformed proposals are dropped one by one.
pub(crate) fn parse_proposals(raw: &str) -> Result<(Vec<Proposal>, Vec<DroppedProposal>), String> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| format!("invalid json: {e}"))?;
    let items = match &value {
        serde_json::Value::Object(map) => map
            .get("proposals")
            .and_then(|v| v.as_array())
            .ok_or("missing \"proposals\" array")?,
        serde_json::Value::Array(items) => items,
        _ => return Err("payload is neither object nor array".to_string()),
    };

    let mut proposals = Vec::with_capacity(items.len());
    let mut dropped = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        match serde_json::from_value::<Proposal>(item.clone()) {
            Ok(mut p) => {
                p.ticker = p.ticker.trim().to_uppercase();
                if p.ticker.is_empty() || !p.quantity.is_finite() || p.quantity <= 0.0 {
                    dropped.push(DroppedProposal {
                        ticker: p.ticker.clone(),
                        code: "schema_invalid".to_string(),
                        detail: format!("proposal {idx} has empty ticker or non-positive quantity"),
                    });
                } else {
                    proposals.push(p);
                }
            }
            Err(e) => {
                let ticker = item
                    .get("ticker")
                    .and_then(|t| t.as_str())
                    .unwrap_or("?")
                    .to_string();
                dropped.push(DroppedProposal {
                    ticker,
                    code: "schema_invalid".to_string(),
                    detail: format!("proposal {idx}: {e}"),
                });
            }
        }
    }
    Ok((proposals, dropped))
}

//! Decision-and-Risk Engine
//!
//! Core of an LLM-driven, long-only equity trading simulator under strict
//! monetary and token budgets.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       DecisionEngine                            │
//! │  (pull-based ticks, window cadence, single mutation lock)       │
//! └─────────────────────────────────────────────────────────────────┘
//!          │                    │                      │
//!          ▼                    ▼                      ▼
//! ┌───────────────┐    ┌───────────────┐      ┌───────────────┐
//! │ ContextBuilder│───▶│ Orchestrator  │      │  RiskEngine   │
//! │ (salience,    │    │ (fingerprint, │      │ (rule chain,  │
//! │  compaction)  │    │  cache, caps) │      │  exit monitor)│
//! └───────────────┘    └───────┬───────┘      └───────┬───────┘
//!                              │ proposals            │ intents
//!                              ▼                      ▼
//!                      ┌───────────────┐      ┌───────────────┐
//!                      │ FillSimulator │─────▶│   Portfolio   │
//!                      │ (midpoint +   │fills │ (cash, pos,   │
//!                      │  slip + comm) │      │  realized pnl)│
//!                      └───────────────┘      └───────────────┘
//! ```
//!
//! # Determinism Guarantees
//!
//! - All engine time is injected naive ET; components never read system time.
//! - Context selection and compaction are deterministic, so identical window
//!   inputs hash to identical fingerprints and dedupe to one paid call.
//! - Shared state mutates only under one lock, and never across an await.

pub mod budget;
pub mod clock;
pub mod config;
pub mod context;
pub mod fills;
pub mod fingerprint;
pub mod llm;
pub mod portfolio;
pub mod risk;
pub mod scheduler;
pub mod types;

#[cfg(test)]
mod fills_tests;
#[cfg(test)]
mod scheduler_tests;

// Re-exports for convenience
pub use budget::{BudgetExhausted, BudgetLedger, BudgetSnapshot};
pub use clock::{Clock, SimClock, WallClock};
pub use config::EngineConfig;
pub use context::{ContextBuilder, DecisionContext, NewsMetricsSource, PriceMetrics, PriceMetricsSource};
pub use fills::{BarSource, FillError, FillSimulator};
pub use llm::{LlmCallRecord, LlmClient, LlmReply, Orchestrator, Proposal};
pub use portfolio::{Portfolio, Position};
pub use risk::{CooldownBook, DayCounters, RejectReason, RiskEngine};
pub use scheduler::{DecisionEngine, EngineEvent, WindowKind, WindowOutcome, WindowStatus};
pub use types::{Bar, BarTimeframe, Fill, NewsMetrics, OrderIntent, OrderReason, Side};

//! tradebot-engine Library
//!
//! Decision-and-risk engine for an LLM-driven, long-only equity trading
//! simulator. Transport, persistence, and concrete data providers are
//! collaborator concerns; this crate exposes the engine itself.

pub mod engine;

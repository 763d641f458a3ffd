//! Engine Configuration
//!
//! TOML-backed configuration with the full risk/cadence/execution/limits/llm
//! surface. Invalid configuration is fatal at startup (`validate` fails);
//! nothing in this module is consulted fallibly at runtime.

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::engine::clock::{RTH_CLOSE, RTH_OPEN};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub initial_cash_usd: f64,
    /// Default candidate universe when a window does not name tickers.
    pub universe: Vec<String>,
    pub risk: RiskConfig,
    pub cadence: CadenceConfig,
    pub execution: ExecutionConfig,
    pub limits: LimitsConfig,
    pub llm: LlmConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_cash_usd: 100_000.0,
            universe: vec![
                "AAPL".to_string(),
                "MSFT".to_string(),
                "NVDA".to_string(),
                "QQQ".to_string(),
            ],
            risk: RiskConfig::default(),
            cadence: CadenceConfig::default(),
            execution: ExecutionConfig::default(),
            limits: LimitsConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

/// Portfolio-level risk limits. The strategy is long-only by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_positions: usize,
    /// Cap on a single ticker's weight, as a fraction of equity.
    pub max_position_pct: f64,
    /// Minimum ending cash, as a fraction of ending equity.
    pub min_cash_pct: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_positions: 15,
            max_position_pct: 0.10,
            min_cash_pct: 0.05,
            stop_loss_pct: 0.08,
            take_profit_pct: 0.12,
        }
    }
}

/// Decision cadence: fixed ET window times plus event-window enablement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    /// "HH:MM" ET times, must fall inside regular trading hours.
    pub decision_windows_et: Vec<String>,
    pub allow_event_window: bool,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            decision_windows_et: vec!["10:00".to_string(), "15:30".to_string()],
            allow_event_window: true,
        }
    }
}

/// Fill rules and reference-data tolerances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub slippage_bps: f64,
    pub commission_usd: f64,
    pub allow_fractional: bool,
    /// Minimum notional for opening/adding orders. Exits are exempt.
    pub min_order_usd: f64,
    /// Reference bar must be at most this stale (minute/5-minute ladder).
    pub max_staleness_minutes: i64,
    /// A decision window past this deadline closes as no-trade.
    pub window_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            slippage_bps: 2.0,
            commission_usd: 10.0,
            allow_fractional: true,
            min_order_usd: 1000.0,
            max_staleness_minutes: 15,
            window_timeout_secs: 120,
        }
    }
}

/// Daily activity limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Daily traded notional cap, as a fraction of prior day-end equity.
    pub max_turnover_daily_pct: f64,
    pub max_orders_per_day: usize,
    pub cooldown_minutes_after_exit: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_turnover_daily_pct: 0.30,
            max_orders_per_day: 10,
            cooldown_minutes_after_exit: 60,
        }
    }
}

/// LLM spend caps, dedupe, and proposal gating.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub prompt_version: String,
    pub daily_cap_usd: f64,
    pub monthly_cap_usd: f64,
    /// Minimum model-stated expected return for new-position buys.
    pub expected_return_gate_pct: f64,
    pub max_event_windows_per_day: u32,
    pub max_tickers_per_event_window: usize,
    pub window_top_k_tickers: usize,
    /// Token budget for the compacted per-window context.
    pub context_token_budget: usize,
    pub dedupe_horizon_minutes: i64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            prompt_version: "v1".to_string(),
            daily_cap_usd: 10.0,
            monthly_cap_usd: 300.0,
            expected_return_gate_pct: 0.05,
            max_event_windows_per_day: 3,
            max_tickers_per_event_window: 5,
            window_top_k_tickers: 10,
            context_token_budget: 6000,
            dedupe_horizon_minutes: 1440,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file. Missing keys take defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading engine config {}", path.display()))?;
        let config: EngineConfig = toml::from_str(&raw)
            .with_context(|| format!("parsing engine config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parsed fixed decision-window times, in configured order.
    pub fn window_times(&self) -> Result<Vec<NaiveTime>> {
        self.cadence
            .decision_windows_et
            .iter()
            .map(|s| {
                NaiveTime::parse_from_str(s, "%H:%M")
                    .with_context(|| format!("invalid decision window time {s:?}"))
            })
            .collect()
    }

    /// Startup validation. Any failure here aborts initialization.
    pub fn validate(&self) -> Result<()> {
        if self.initial_cash_usd <= 0.0 {
            bail!("initial_cash_usd must be positive");
        }
        if self.risk.max_positions == 0 {
            bail!("risk.max_positions must be at least 1");
        }
        for (name, v) in [
            ("risk.max_position_pct", self.risk.max_position_pct),
            ("risk.min_cash_pct", self.risk.min_cash_pct),
            ("risk.stop_loss_pct", self.risk.stop_loss_pct),
            ("risk.take_profit_pct", self.risk.take_profit_pct),
            ("limits.max_turnover_daily_pct", self.limits.max_turnover_daily_pct),
        ] {
            if !(v > 0.0 && v <= 1.0) {
                bail!("{name} must be in (0, 1], got {v}");
            }
        }
        if self.execution.slippage_bps < 0.0 || self.execution.commission_usd < 0.0 {
            bail!("execution costs must be non-negative");
        }
        if self.execution.min_order_usd < 0.0 {
            bail!("execution.min_order_usd must be non-negative");
        }
        if self.execution.max_staleness_minutes <= 0 {
            bail!("execution.max_staleness_minutes must be positive");
        }
        if self.execution.window_timeout_secs == 0 {
            bail!("execution.window_timeout_secs must be positive");
        }
        if self.limits.max_orders_per_day == 0 {
            bail!("limits.max_orders_per_day must be at least 1");
        }
        if self.limits.cooldown_minutes_after_exit < 0 {
            bail!("limits.cooldown_minutes_after_exit must be non-negative");
        }
        if self.llm.daily_cap_usd <= 0.0 || self.llm.monthly_cap_usd <= 0.0 {
            bail!("llm spend caps must be positive");
        }
        if self.llm.expected_return_gate_pct < 0.0 {
            bail!("llm.expected_return_gate_pct must be non-negative");
        }
        if self.llm.window_top_k_tickers == 0 || self.llm.max_tickers_per_event_window == 0 {
            bail!("llm ticker budgets must be at least 1");
        }
        if self.llm.context_token_budget == 0 {
            bail!("llm.context_token_budget must be positive");
        }
        if self.llm.dedupe_horizon_minutes < 0 {
            bail!("llm.dedupe_horizon_minutes must be non-negative");
        }
        if self.cadence.decision_windows_et.is_empty() {
            bail!("cadence.decision_windows_et must name at least one window");
        }
        for t in self.window_times()? {
            if t < RTH_OPEN || t >= RTH_CLOSE {
                bail!("decision window {t} is outside regular trading hours");
            }
        }
        Ok(())
    }
}

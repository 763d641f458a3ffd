//! tradebot - LLM-driven equity trading simulator driver
//!
//! Runs the decision-and-risk engine over one simulated regular-trading-hours
//! day on seeded synthetic market data, with a stub LLM client that proposes
//! nothing (the engine trades only on real model output). Useful for
//! exercising the cadence, monitoring, and budget machinery end to end.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use clap::Parser;
use dotenv::dotenv;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradebot_engine::engine::clock::{RTH_CLOSE, RTH_OPEN};
use tradebot_engine::engine::context::{NewsMetricsSource, PriceMetrics, PriceMetricsSource};
use tradebot_engine::engine::fills::BarSource;
use tradebot_engine::engine::llm::{LlmCallError, LlmClient, LlmReply};
use tradebot_engine::engine::scheduler::{DecisionEngine, EngineEvent};
use tradebot_engine::engine::types::{Bar, BarTimeframe, NewsMetrics};
use tradebot_engine::engine::EngineConfig;

#[derive(Parser, Debug)]
#[command(name = "tradebot", about = "LLM-driven equity trading simulator")]
struct Args {
    /// Engine configuration file (TOML). Defaults apply when omitted.
    #[arg(long, env = "TRADEBOT_CONFIG")]
    config: Option<PathBuf>,

    /// Simulated trading date (ET), e.g. 2025-01-02.
    #[arg(long, default_value = "2025-01-02")]
    date: NaiveDate,

    /// Seed for the synthetic market data.
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

/// Seeded random-walk market: minute bars plus derived metrics per ticker.
struct SyntheticMarket {
    bars: HashMap<String, Vec<Bar>>,
}

impl SyntheticMarket {
    fn generate(tickers: &[String], date: NaiveDate, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut bars = HashMap::new();
        for ticker in tickers {
            let mut series = Vec::new();
            let mut price: f64 = rng.gen_range(80.0..400.0);
            let mut ts = date.and_time(RTH_OPEN);
            let close_ts = date.and_time(RTH_CLOSE);
            while ts < close_ts {
                let drift: f64 = rng.gen_range(-0.002..0.002);
                let open = price;
                price *= 1.0 + drift;
                let (high, low) = (open.max(price) * 1.0005, open.min(price) * 0.9995);
                series.push(Bar {
                    ts_et: ts,
                    open,
                    high,
                    low,
                    close: price,
                    volume: rng.gen_range(1_000.0..50_000.0),
                });
                ts += Duration::minutes(1);
            }
            bars.insert(ticker.clone(), series);
        }
        Self { bars }
    }

    fn latest(&self, ticker: &str, ts: NaiveDateTime) -> Option<&Bar> {
        self.bars
            .get(ticker)?
            .iter()
            .rev()
            .find(|b| b.ts_et <= ts)
    }
}

impl BarSource for SyntheticMarket {
    fn bar_at_or_before(
        &self,
        ticker: &str,
        ts: NaiveDateTime,
        _timeframe: BarTimeframe,
    ) -> Option<Bar> {
        self.latest(ticker, ts).copied()
    }
}

impl PriceMetricsSource for SyntheticMarket {
    fn metrics(&self, ticker: &str, as_of: NaiveDateTime) -> Option<PriceMetrics> {
        let bar = self.latest(ticker, as_of)?;
        let first = self.bars.get(ticker)?.first()?;
        let day_return = (bar.close - first.open) / first.open;
        Some(PriceMetrics {
            last_price: bar.close,
            r1d: day_return,
            r5d: day_return,
            r20d: day_return,
            rsi_14: None,
            macd: None,
        })
    }
}

impl NewsMetricsSource for SyntheticMarket {
    fn metrics(&self, _ticker: &str, _as_of: NaiveDateTime) -> Option<NewsMetrics> {
        None
    }
}

/// Keyless stub: answers instantly with an empty proposal list, so the
/// simulator never trades without a real model behind it.
struct StubLlmClient;

#[async_trait]
impl LlmClient for StubLlmClient {
    async fn complete(&self, _prompt: &str) -> Result<LlmReply, LlmCallError> {
        Ok(LlmReply {
            text: r#"{"proposals": []}"#.to_string(),
            prompt_tokens: 0,
            completion_tokens: 4,
            cost_usd: 0.0,
        })
    }

    fn estimate_cost_usd(&self, _prompt_tokens: usize) -> f64 {
        0.0
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    config.validate().context("engine configuration invalid")?;

    info!(date = %args.date, seed = args.seed, universe = ?config.universe, "starting simulated day");

    let market = Arc::new(SyntheticMarket::generate(&config.universe, args.date, args.seed));
    let start = args.date.and_time(RTH_OPEN);
    let mut engine = DecisionEngine::new(
        config.clone(),
        start,
        Arc::clone(&market) as Arc<dyn PriceMetricsSource>,
        Arc::clone(&market) as Arc<dyn NewsMetricsSource>,
        Arc::clone(&market) as Arc<dyn BarSource>,
        Arc::new(StubLlmClient),
    )?;

    let mut now = start;
    let close = args.date.and_time(RTH_CLOSE);
    while now < close {
        for event in engine.tick(now).await {
            match event {
                EngineEvent::WindowClosed(outcome) => info!(
                    kind = ?outcome.kind,
                    status = ?outcome.status,
                    executed = outcome.executed.len(),
                    rejected = outcome.rejected.len(),
                    "window closed"
                ),
                EngineEvent::Fill(fill) => info!(
                    ticker = %fill.ticker,
                    side = %fill.side,
                    qty = fill.quantity,
                    price = fill.price,
                    reason = fill.reason.tag(),
                    "fill"
                ),
                EngineEvent::EquitySnapshot { equity, cash, .. } => {
                    info!(equity, cash, "equity snapshot")
                }
            }
        }
        now += Duration::minutes(1);
    }

    let state = engine.state();
    let state = state.lock();
    info!(
        cash = state.portfolio.cash,
        realized_pnl = state.portfolio.realized_pnl,
        positions = state.portfolio.open_position_count(),
        fills = state.execution_log.len(),
        daily_llm_spend = state.budget_snapshot().daily_spent_usd,
        "simulated day complete"
    );
    Ok(())
}

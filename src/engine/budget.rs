//! Budget Ledger
//!
//! Running daily and monthly LLM spend, reset on ET calendar boundaries.
//! A call that would push either total past its cap is rejected before
//! invocation; exhaustion is a normal no-trade outcome, never an error.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::engine::clock::month_key;

/// Outcome of a failed reservation, carried on the window outcome so the
/// remaining budget is always observable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetExhausted {
    pub estimated_cost_usd: f64,
    pub remaining_daily_usd: f64,
    pub remaining_monthly_usd: f64,
}

/// Serializable point-in-time view of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub day: NaiveDate,
    pub daily_spent_usd: f64,
    pub daily_cap_usd: f64,
    pub monthly_spent_usd: f64,
    pub monthly_cap_usd: f64,
}

impl BudgetSnapshot {
    pub fn remaining_daily_usd(&self) -> f64 {
        (self.daily_cap_usd - self.daily_spent_usd).max(0.0)
    }

    pub fn remaining_monthly_usd(&self) -> f64 {
        (self.monthly_cap_usd - self.monthly_spent_usd).max(0.0)
    }
}

/// Daily/monthly spend accounting with cap enforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetLedger {
    daily_cap_usd: f64,
    monthly_cap_usd: f64,
    day: NaiveDate,
    month: (i32, u32),
    daily_spent_usd: f64,
    monthly_spent_usd: f64,
}

impl BudgetLedger {
    pub fn new(daily_cap_usd: f64, monthly_cap_usd: f64, now: NaiveDateTime) -> Self {
        Self {
            daily_cap_usd,
            monthly_cap_usd,
            day: now.date(),
            month: month_key(now),
            daily_spent_usd: 0.0,
            monthly_spent_usd: 0.0,
        }
    }

    /// Reset totals whose ET boundary has passed. Called at the top of every
    /// scheduler tick.
    pub fn rollover(&mut self, now: NaiveDateTime) {
        if now.date() != self.day {
            self.day = now.date();
            self.daily_spent_usd = 0.0;
        }
        if month_key(now) != self.month {
            self.month = month_key(now);
            self.monthly_spent_usd = 0.0;
        }
    }

    /// Pre-call check: would `estimated_cost_usd` fit under both caps?
    /// Does not mutate the ledger; actual spend is recorded post-call.
    pub fn try_reserve(&self, estimated_cost_usd: f64) -> Result<(), BudgetExhausted> {
        let daily_ok = self.daily_spent_usd + estimated_cost_usd <= self.daily_cap_usd;
        let monthly_ok = self.monthly_spent_usd + estimated_cost_usd <= self.monthly_cap_usd;
        if daily_ok && monthly_ok {
            Ok(())
        } else {
            Err(BudgetExhausted {
                estimated_cost_usd,
                remaining_daily_usd: (self.daily_cap_usd - self.daily_spent_usd).max(0.0),
                remaining_monthly_usd: (self.monthly_cap_usd - self.monthly_spent_usd).max(0.0),
            })
        }
    }

    /// Record actual spend after a completed call.
    pub fn record(&mut self, actual_cost_usd: f64) {
        self.daily_spent_usd += actual_cost_usd;
        self.monthly_spent_usd += actual_cost_usd;
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            day: self.day,
            daily_spent_usd: self.daily_spent_usd,
            daily_cap_usd: self.daily_cap_usd,
            monthly_spent_usd: self.monthly_spent_usd,
            monthly_cap_usd: self.monthly_cap_usd,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn et(y: i32, m: u32, d: u32, hh: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(hh, 0, 0).unwrap()
    }

    #[test]
    fn third_call_over_daily_cap_is_rejected_pre_invocation() {
        // Daily cap $10, estimated costs $6, $3, $5: the third must fail.
        let mut ledger = BudgetLedger::new(10.0, 300.0, et(2025, 1, 2, 10));
        ledger.try_reserve(6.0).expect("first call fits");
        ledger.record(6.0);
        ledger.try_reserve(3.0).expect("second call fits");
        ledger.record(3.0);
        let err = ledger.try_reserve(5.0).expect_err("third call must be rejected");
        assert_eq!(err.remaining_daily_usd, 1.0);
        assert_eq!(err.remaining_monthly_usd, 291.0);
        // rejection did not consume budget
        assert_eq!(ledger.snapshot().daily_spent_usd, 9.0);
    }

    #[test]
    fn monthly_cap_binds_independently_of_daily() {
        let mut ledger = BudgetLedger::new(10.0, 12.0, et(2025, 1, 2, 10));
        ledger.record(9.0);
        ledger.rollover(et(2025, 1, 3, 10));
        // new day: daily total reset, monthly still at $9
        assert_eq!(ledger.snapshot().daily_spent_usd, 0.0);
        assert!(ledger.try_reserve(4.0).is_err(), "monthly cap must bind");
        ledger.try_reserve(3.0).expect("within monthly cap");
    }

    #[test]
    fn month_boundary_resets_monthly_total() {
        let mut ledger = BudgetLedger::new(10.0, 20.0, et(2025, 1, 31, 10));
        ledger.record(19.0);
        ledger.rollover(et(2025, 2, 1, 10));
        assert_eq!(ledger.snapshot().monthly_spent_usd, 0.0);
        ledger.try_reserve(10.0).expect("fresh month");
    }
}

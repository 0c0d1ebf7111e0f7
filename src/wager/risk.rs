//! Daily risk ledger.
//!
//! All stake and loss accounting for the current UTC day flows through here.
//! Executions never touch the counters directly: they take a [`Reservation`]
//! under the ledger lock and later commit or release it. The lock is only
//! held for those transitions, never across a network call.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::Database;

use super::error::WagerError;

/// Slack for float comparisons against the daily cap.
const CAP_EPSILON: f64 = 1e-9;

/// Limits applied by the ledger, both expressed as fractions of the balance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskLimits {
    pub max_daily_bet_fraction: f64,
    pub stop_loss_fraction: f64,
}

/// Risk counters for one accounting day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub day: NaiveDate,
    /// Stake of wagers the board accepted today
    pub committed_stake: f64,
    /// Stake reserved by executions still waiting on the board
    pub pending_stake: f64,
    /// Realised loss recorded today
    pub cumulative_loss: f64,
}

impl RiskState {
    pub fn new(day: NaiveDate) -> Self {
        RiskState {
            day,
            committed_stake: 0.0,
            pending_stake: 0.0,
            cumulative_loss: 0.0,
        }
    }

    /// Stake counted against the daily budget: committed plus in flight.
    pub fn cumulative_stake(&self) -> f64 {
        self.committed_stake + self.pending_stake
    }

    /// Whether the day's realised loss has reached the stop-loss limit.
    pub fn stop_loss_hit(&self, balance: f64, stop_loss_fraction: f64) -> bool {
        self.cumulative_loss > 0.0 && self.cumulative_loss >= balance * stop_loss_fraction
    }
}

/// Cloneable handle to the shared daily risk state.
#[derive(Clone)]
pub struct RiskLedger {
    state: Arc<Mutex<RiskState>>,
    limits: RiskLimits,
}

impl RiskLedger {
    pub fn new(limits: RiskLimits) -> Self {
        Self::restore(limits, today(), 0.0, 0.0)
    }

    /// Rebuild the ledger from persisted totals (e.g. after a restart).
    pub fn restore(limits: RiskLimits, day: NaiveDate, committed: f64, loss: f64) -> Self {
        let mut state = RiskState::new(day);
        state.committed_stake = committed.max(0.0);
        state.cumulative_loss = loss.max(0.0);
        RiskLedger {
            state: Arc::new(Mutex::new(state)),
            limits,
        }
    }

    /// Rebuild `day`'s counters from the bet ledger and the settlement log.
    /// Only rows stamped at or after that day's UTC midnight count.
    pub fn restore_from(db: &Database, limits: RiskLimits, day: NaiveDate) -> anyhow::Result<Self> {
        let since = day_start_utc(day);
        let committed = db.committed_stake_since(since)?;
        let loss = db.loss_since(since)?;
        info!(
            "Risk ledger for {}: committed {:.2}, loss {:.2}",
            day, committed, loss
        );
        Ok(Self::restore(limits, day, committed, loss))
    }

    pub fn limits(&self) -> RiskLimits {
        self.limits
    }

    /// Copy of the current day's counters.
    pub fn snapshot(&self) -> RiskState {
        let mut state = self.state.lock();
        roll_if_new_day(&mut state, today());
        state.clone()
    }

    /// Atomically check the daily limits and reserve `stake`.
    ///
    /// On refusal nothing is reserved. The returned guard must be committed
    /// or released; dropping it releases.
    pub fn reserve(&self, stake: f64, balance: f64) -> Result<Reservation, WagerError> {
        if !(stake.is_finite() && stake > 0.0) || stake > balance {
            return Err(WagerError::InsufficientBalance { stake, balance });
        }

        let mut state = self.state.lock();
        roll_if_new_day(&mut state, today());

        if state.stop_loss_hit(balance, self.limits.stop_loss_fraction) {
            return Err(WagerError::LossLimitReached {
                loss: state.cumulative_loss,
                limit: balance * self.limits.stop_loss_fraction,
            });
        }

        let cap = balance * self.limits.max_daily_bet_fraction;
        if state.cumulative_stake() + stake > cap + CAP_EPSILON {
            return Err(WagerError::BudgetExceeded {
                requested: stake,
                committed: state.committed_stake,
                pending: state.pending_stake,
                cap,
            });
        }

        state.pending_stake += stake;
        debug!(
            "Reserved {:.2} (committed {:.2}, pending {:.2}, cap {:.2})",
            stake, state.committed_stake, state.pending_stake, cap
        );
        Ok(Reservation {
            ledger: self.clone(),
            day: state.day,
            amount: stake,
            settled: false,
        })
    }

    /// Record a realised loss against today's stop-loss counter.
    pub fn record_loss(&self, amount: f64) {
        if !(amount.is_finite() && amount > 0.0) {
            return;
        }
        let mut state = self.state.lock();
        roll_if_new_day(&mut state, today());
        state.cumulative_loss += amount;
        info!(
            "Recorded loss {:.2} (day total {:.2})",
            amount, state.cumulative_loss
        );
    }

    /// Start a new accounting day if `day` is later than the current one.
    ///
    /// In-flight reservations keep the day they were taken on, so settling
    /// them later cannot leak stake into the new day's counters.
    pub fn rollover(&self, day: NaiveDate) -> bool {
        let mut state = self.state.lock();
        roll_if_new_day(&mut state, day)
    }

    fn settle(&self, day: NaiveDate, amount: f64, commit: bool) {
        let mut state = self.state.lock();
        roll_if_new_day(&mut state, today());
        if state.day != day {
            debug!(
                "Settling {:.2} from {} after rollover to {}; not counted",
                amount, day, state.day
            );
            return;
        }
        state.pending_stake = (state.pending_stake - amount).max(0.0);
        if commit {
            state.committed_stake += amount;
        }
    }
}

/// Stake held against the daily budget by one execution attempt.
#[must_use = "a reservation is released when dropped"]
pub struct Reservation {
    ledger: RiskLedger,
    day: NaiveDate,
    amount: f64,
    settled: bool,
}

impl Reservation {
    pub fn amount(&self) -> f64 {
        self.amount
    }

    /// Keep the stake counted in today's committed total.
    pub fn commit(mut self) {
        self.settled = true;
        self.ledger.settle(self.day, self.amount, true);
    }

    /// Return the stake to the daily budget.
    pub fn release(mut self) {
        self.settled = true;
        self.ledger.settle(self.day, self.amount, false);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            warn!("Reservation of {:.2} dropped unsettled; releasing", self.amount);
            self.ledger.settle(self.day, self.amount, false);
        }
    }
}

fn roll_if_new_day(state: &mut RiskState, day: NaiveDate) -> bool {
    if day <= state.day {
        return false;
    }
    info!(
        "Risk ledger rollover {} → {} (committed {:.2}, loss {:.2}, pending {:.2} carried by their day)",
        state.day, day, state.committed_stake, state.cumulative_loss, state.pending_stake
    );
    *state = RiskState::new(day);
    true
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Midnight (UTC) that starts `day`.
pub fn day_start_utc(day: NaiveDate) -> DateTime<Utc> {
    day.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or_else(Utc::now)
}

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Every way a single match's wager can fail to happen.
///
/// None of these are fatal: the engine logs them, records what it must, and
/// moves on to the next match or the next poll cycle.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WagerError {
    #[error("match feed unavailable: {0}")]
    FeedUnavailable(String),

    #[error("wager rejected by both endpoints (primary: {primary}; backup: {backup})")]
    SubmissionFailed { primary: String, backup: String },

    #[error(
        "daily budget exceeded: requested {requested:.2}, committed {committed:.2}, pending {pending:.2}, cap {cap:.2}"
    )]
    BudgetExceeded {
        requested: f64,
        committed: f64,
        pending: f64,
        cap: f64,
    },

    #[error("daily stop-loss reached: loss {loss:.2} >= limit {limit:.2}")]
    LossLimitReached { loss: f64, limit: f64 },

    #[error("insufficient balance: stake {stake:.2} > balance {balance:.2}")]
    InsufficientBalance { stake: f64, balance: f64 },

    #[error("already wagered on match {match_id} option {option_id}")]
    DuplicateWager { match_id: String, option_id: String },

    #[error("missed wager window for match {match_id} (fire time {fire_at})")]
    MissedWindow {
        match_id: String,
        fire_at: DateTime<Utc>,
    },

    #[error("bet ledger error: {0}")]
    Ledger(String),
}

impl WagerError {
    /// Short machine-friendly label for logs and notifications.
    pub fn kind(&self) -> &'static str {
        match self {
            WagerError::FeedUnavailable(_) => "feed_unavailable",
            WagerError::SubmissionFailed { .. } => "submission_failed",
            WagerError::BudgetExceeded { .. } => "budget_exceeded",
            WagerError::LossLimitReached { .. } => "loss_limit_reached",
            WagerError::InsufficientBalance { .. } => "insufficient_balance",
            WagerError::DuplicateWager { .. } => "duplicate_wager",
            WagerError::MissedWindow { .. } => "missed_window",
            WagerError::Ledger(_) => "ledger",
        }
    }
}

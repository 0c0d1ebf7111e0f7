use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Status label the betting board uses for matches still open for wagers.
pub const LIVE_STATUS: &str = "LIVE";

/// A time-boxed betting match as published by the board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    /// Board game ID
    pub id: String,
    pub title: String,
    /// Wagers are refused by the board after this instant
    pub close_time: DateTime<Utc>,
    /// "LIVE" | anything else (settled, cancelled, ...)
    pub status: String,
    /// Options in board order; selection ties resolve to the earliest one
    pub options: Vec<MatchOption>,
    /// Rake applied to payouts (0.05 = 5%)
    pub tax_rate: f64,
}

impl Match {
    pub fn is_live(&self) -> bool {
        self.status.eq_ignore_ascii_case(LIVE_STATUS)
    }

    /// Sum of the stake currently backing every option.
    pub fn backed_total(&self) -> f64 {
        self.options.iter().map(|o| o.backed_total.max(0.0)).sum()
    }
}

/// One selectable outcome of a match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchOption {
    /// Board option ID (unique within its match)
    pub id: String,
    pub text: String,
    /// Decimal odds offered by the board (> 1.0 to be eligible)
    pub odds: f64,
    /// Total stake other users already placed on this option
    pub backed_total: f64,
}

/// Externally observed odds per option text for one match.
pub type ReferenceOdds = HashMap<String, f64>;

/// Which of the two board hosts accepted a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Primary,
    Backup,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Primary => "primary",
            Endpoint::Backup => "backup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(Endpoint::Primary),
            "backup" => Some(Endpoint::Backup),
            _ => None,
        }
    }
}

/// One submission attempt recorded in the append-only bet ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetRecord {
    pub id: Option<i64>,
    pub match_id: String,
    pub option_id: String,
    pub match_title: String,
    pub option_text: String,
    pub stake: f64,
    /// Odds offered when the wager was armed
    pub odds: f64,
    /// "arbitrage" | "equilibrium" | "fallback"
    pub rule: String,
    pub success: bool,
    /// Endpoint that accepted the wager (None when both failed)
    pub endpoint: Option<Endpoint>,
    /// Message returned by the board (or the transport error)
    pub message: Option<String>,
    /// Whether this wager went to the simulated gateway
    pub dry_run: bool,
    pub submitted_at: DateTime<Utc>,
}

/// A wager as listed by the board for one match (any user's)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteBet {
    pub id: String,
    pub match_id: String,
    pub option_id: String,
    pub user_id: String,
    pub stake: f64,
    /// Board-local timestamp, passed through as sent
    pub created_at: String,
}

/// A scheduled wager the executor refused to submit (duplicate, over
/// budget, stop-loss, ...). Kept so the refusals show up next to the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedWager {
    pub id: Option<i64>,
    pub match_id: String,
    pub option_id: String,
    pub match_title: String,
    pub option_text: String,
    pub stake: f64,
    pub rule: String,
    /// `WagerError::kind()` label
    pub reason_kind: String,
    pub reason: String,
    pub skipped_at: DateTime<Utc>,
}

/// Outcome of a settled wager, used to track realised losses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    pub id: Option<i64>,
    pub match_id: String,
    pub option_id: String,
    pub stake: f64,
    /// Points credited back by the board (0 for a lost wager)
    pub payout: f64,
    pub recorded_at: DateTime<Utc>,
}

impl Settlement {
    /// Realised loss of this wager (never negative).
    pub fn loss(&self) -> f64 {
        (self.stake - self.payout).max(0.0)
    }
}

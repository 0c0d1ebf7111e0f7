use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::models::{Endpoint, Match, RemoteBet};

use super::error::WagerError;

/// Board answer to a wager submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub success: bool,
    pub message: String,
}

/// Source of the live match list.
#[async_trait]
pub trait MatchFeed: Send + Sync {
    /// Current LIVE matches. Fails with [`WagerError::FeedUnavailable`] only
    /// when every source is unreachable.
    async fn fetch_live_matches(&self) -> Result<Vec<Match>, WagerError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

/// Remote side of wager placement.
#[async_trait]
pub trait WagerGateway: Send + Sync {
    /// Submit a stake on one option against the given endpoint.
    /// `Err` means transport/protocol failure; a board refusal is
    /// `Ok(Submission { success: false, .. })`.
    async fn submit_wager(
        &self,
        endpoint: Endpoint,
        option_id: &str,
        stake: f64,
    ) -> Result<Submission>;

    /// Current spendable balance in board points.
    async fn fetch_balance(&self) -> Result<f64>;

    /// Whether submissions are simulated.
    fn is_dry_run(&self) -> bool {
        false
    }
}

/// Read-only board lookups served by the status API.
#[async_trait]
pub trait BoardLookup: Send + Sync {
    /// Every wager the board holds for one match, from all users.
    async fn fetch_bet_details(&self, match_id: &str) -> Result<Vec<RemoteBet>>;

    /// One page of match-result announcements from the board forum.
    async fn fetch_result_posts(&self, page: u32, size: u32) -> Result<Vec<Value>>;

    /// Body of one result announcement.
    async fn fetch_post_detail(&self, tid: &str) -> Result<Value>;
}

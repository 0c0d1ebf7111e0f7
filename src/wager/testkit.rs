//! Fixtures shared by the wager tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{json, Value};

use crate::db::models::{Endpoint, Match, MatchOption, RemoteBet, LIVE_STATUS};

use super::decision::Wager;
use super::error::WagerError;
use super::gateway::{BoardLookup, MatchFeed, Submission, WagerGateway};
use super::scheduler::{FireHandler, ScheduledWager};

pub fn make_option(id: &str, odds: f64, backed: f64) -> MatchOption {
    MatchOption {
        id: id.to_string(),
        text: id.to_string(),
        odds,
        backed_total: backed,
    }
}

/// LIVE match closing in an hour.
pub fn make_match(id: &str, options: Vec<MatchOption>) -> Match {
    Match {
        id: id.to_string(),
        title: format!("Match {}", id),
        close_time: Utc::now() + ChronoDuration::hours(1),
        status: LIVE_STATUS.to_string(),
        options,
        tax_rate: 0.0,
    }
}

/// Wager on the match's first option, decided at a balance of 1000.
pub fn scheduled(m: Match, stake: f64) -> ScheduledWager {
    let option = m.options[0].clone();
    ScheduledWager::new(m, Wager { option, stake }, "fallback", 1000.0)
}

/// What a scripted endpoint answers.
#[derive(Clone)]
pub enum Script {
    Accept,
    Refuse(&'static str),
    Transport(&'static str),
}

/// Gateway with a fixed answer per endpoint that records every call.
pub struct ScriptedGateway {
    scripts: HashMap<Endpoint, Script>,
    balance: Mutex<Option<f64>>,
    delay: Duration,
    calls: Mutex<Vec<(Endpoint, String, f64)>>,
}

impl ScriptedGateway {
    pub fn new(primary: Script, backup: Script) -> Self {
        ScriptedGateway {
            scripts: HashMap::from([(Endpoint::Primary, primary), (Endpoint::Backup, backup)]),
            balance: Mutex::new(Some(1000.0)),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn accepting() -> Self {
        Self::new(Script::Accept, Script::Accept)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// `None` makes balance lookups fail.
    pub fn set_balance(&self, balance: Option<f64>) {
        *self.balance.lock() = balance;
    }

    pub fn calls(&self) -> Vec<(Endpoint, String, f64)> {
        self.calls.lock().clone()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.calls.lock().iter().map(|(e, _, _)| *e).collect()
    }
}

#[async_trait]
impl WagerGateway for ScriptedGateway {
    async fn submit_wager(&self, endpoint: Endpoint, option_id: &str, stake: f64) -> Result<Submission> {
        self.calls.lock().push((endpoint, option_id.to_string(), stake));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.scripts.get(&endpoint).cloned().unwrap_or(Script::Accept) {
            Script::Accept => Ok(Submission {
                success: true,
                message: "SUCCESS".into(),
            }),
            Script::Refuse(msg) => Ok(Submission {
                success: false,
                message: msg.into(),
            }),
            Script::Transport(msg) => Err(anyhow!(msg)),
        }
    }

    async fn fetch_balance(&self) -> Result<f64> {
        let balance = *self.balance.lock();
        balance.ok_or_else(|| anyhow!("profile unavailable"))
    }
}

/// Feed returning a fixed board, or failing when empty of answers.
pub struct StaticFeed {
    matches: Mutex<Result<Vec<Match>, WagerError>>,
}

impl StaticFeed {
    pub fn new(matches: Vec<Match>) -> Self {
        StaticFeed {
            matches: Mutex::new(Ok(matches)),
        }
    }

    pub fn set(&self, matches: Result<Vec<Match>, WagerError>) {
        *self.matches.lock() = matches;
    }
}

#[async_trait]
impl MatchFeed for StaticFeed {
    async fn fetch_live_matches(&self) -> Result<Vec<Match>, WagerError> {
        self.matches.lock().clone()
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Fire handler that counts invocations and remembers stakes.
#[derive(Default)]
pub struct CountingHandler {
    fired: AtomicUsize,
    stakes: Mutex<Vec<f64>>,
    delay: Duration,
}

impl CountingHandler {
    pub fn with_delay(delay: Duration) -> Self {
        CountingHandler {
            delay,
            ..Default::default()
        }
    }

    pub fn count(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn stakes(&self) -> Vec<f64> {
        self.stakes.lock().clone()
    }
}

#[async_trait]
impl FireHandler for CountingHandler {
    async fn on_fire(&self, wager: ScheduledWager) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.stakes.lock().push(wager.stake);
        self.fired.fetch_add(1, Ordering::SeqCst);
    }
}

/// Board lookups answered from memory; bets are keyed by match ID.
#[derive(Default)]
pub struct StaticBoard {
    pub bets: HashMap<String, Vec<RemoteBet>>,
    pub posts: Vec<Value>,
}

#[async_trait]
impl BoardLookup for StaticBoard {
    async fn fetch_bet_details(&self, match_id: &str) -> Result<Vec<RemoteBet>> {
        self.bets
            .get(match_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown game {}", match_id))
    }

    async fn fetch_result_posts(&self, page: u32, size: u32) -> Result<Vec<Value>> {
        let start = (page.max(1) as usize - 1) * size as usize;
        Ok(self.posts.iter().skip(start).take(size as usize).cloned().collect())
    }

    async fn fetch_post_detail(&self, tid: &str) -> Result<Value> {
        self.posts
            .iter()
            .find(|p| p["tid"] == tid)
            .map(|p| json!({ "topic": p }))
            .ok_or_else(|| anyhow!("unknown topic {}", tid))
    }
}

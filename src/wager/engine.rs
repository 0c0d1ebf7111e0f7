//! Poll cycle: feed → decision → scheduler.

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::models::Match;
use crate::notify::{Notifier, NotifyEvent, OptionQuote};

use super::decision::DecisionEngine;
use super::gateway::{MatchFeed, WagerGateway};
use super::odds_cache::OddsCache;
use super::risk::RiskLedger;
use super::scheduler::{DeadlineScheduler, ScheduleOutcome, ScheduledWager, TimerState};

/// Finished scheduler entries are forgotten after this long.
const SCHEDULE_RETENTION_HOURS: i64 = 24;

/// What one poll cycle did.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub live: usize,
    pub scheduled: usize,
    pub rescheduled: usize,
    pub unchanged: usize,
    pub cancelled: usize,
    pub missed: usize,
    pub no_decision: usize,
    /// Set when the cycle was abandoned (feed or balance unavailable)
    pub aborted: Option<String>,
}

impl CycleReport {
    fn tally(&mut self, outcome: ScheduleOutcome) {
        match outcome {
            ScheduleOutcome::Scheduled { .. } => self.scheduled += 1,
            ScheduleOutcome::Rescheduled { .. } => self.rescheduled += 1,
            ScheduleOutcome::Unchanged { .. } => self.unchanged += 1,
            ScheduleOutcome::Missed { .. } => self.missed += 1,
            ScheduleOutcome::AlreadyHandled(_) | ScheduleOutcome::ShuttingDown => {}
        }
    }
}

pub struct WagerEngine {
    feed: Arc<dyn MatchFeed>,
    gateway: Arc<dyn WagerGateway>,
    odds: OddsCache,
    risk: RiskLedger,
    decision: DecisionEngine,
    scheduler: DeadlineScheduler,
    notifier: Notifier,
    seen: Mutex<HashSet<String>>,
}

impl WagerEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        feed: Arc<dyn MatchFeed>,
        gateway: Arc<dyn WagerGateway>,
        odds: OddsCache,
        risk: RiskLedger,
        decision: DecisionEngine,
        scheduler: DeadlineScheduler,
        notifier: Notifier,
    ) -> Self {
        WagerEngine {
            feed,
            gateway,
            odds,
            risk,
            decision,
            scheduler,
            notifier,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Fetch the board and the balance, then process every match.
    pub async fn run_cycle(&self) -> CycleReport {
        let matches = match self.feed.fetch_live_matches().await {
            Ok(m) => m,
            Err(e) => {
                warn!("Poll cycle skipped, {} feed failed: {}", self.feed.name(), e);
                self.notifier.notify(NotifyEvent::FeedUnavailable {
                    reason: e.to_string(),
                });
                return CycleReport {
                    aborted: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };

        let balance = match self.gateway.fetch_balance().await {
            Ok(b) => b,
            Err(e) => {
                warn!("Poll cycle skipped, balance unavailable: {:#}", e);
                return CycleReport {
                    aborted: Some(format!("balance unavailable: {:#}", e)),
                    ..Default::default()
                };
            }
        };

        let report = self.process_matches(&matches, balance).await;
        info!(
            "Cycle: {} live, {} scheduled, {} rescheduled, {} cancelled, {} missed, {} without decision (balance {:.2})",
            report.live,
            report.scheduled,
            report.rescheduled,
            report.cancelled,
            report.missed,
            report.no_decision,
            balance
        );
        report
    }

    pub async fn process_matches(&self, matches: &[Match], balance: f64) -> CycleReport {
        let mut report = CycleReport::default();
        let listed: HashSet<&str> = matches.iter().map(|m| m.id.as_str()).collect();

        // Pending timers for matches that fell off the board
        for entry in self.scheduler.snapshot() {
            if entry.state == TimerState::Pending
                && !listed.contains(entry.match_id.as_str())
                && self.scheduler.cancel(&entry.match_id)
            {
                report.cancelled += 1;
            }
        }

        for m in matches {
            if !m.is_live() {
                if self.scheduler.cancel(&m.id) {
                    report.cancelled += 1;
                }
                continue;
            }
            report.live += 1;
            self.announce(m);

            if matches!(
                self.scheduler.state(&m.id),
                Some(TimerState::Fired | TimerState::Settled | TimerState::Expired)
            ) {
                continue;
            }

            let reference = self.odds.fetch_reference_odds(&m.id).await;
            let decision = self.decision.select(m, balance, &reference, &self.risk.snapshot());
            let Some(wager) = decision.wager().cloned() else {
                debug!("Match {} ({}): no decision", m.id, m.title);
                report.no_decision += 1;
                // An armed wager keeps its captured decision but follows the
                // board's close time.
                if let Some(outcome) = self.scheduler.refresh_close_time(m) {
                    report.tally(outcome);
                }
                continue;
            };

            let scheduled = ScheduledWager::new(m.clone(), wager, decision.rule(), balance);
            report.tally(self.scheduler.schedule(scheduled));
        }

        self.seen.lock().retain(|id| listed.contains(id.as_str()));
        self.scheduler
            .prune(Utc::now() - ChronoDuration::hours(SCHEDULE_RETENTION_HOURS));
        report
    }

    fn announce(&self, m: &Match) {
        if !self.seen.lock().insert(m.id.clone()) {
            return;
        }
        info!("New match {}: {} (closes {})", m.id, m.title, m.close_time);
        self.notifier.notify(NotifyEvent::NewMatch {
            match_id: m.id.clone(),
            title: m.title.clone(),
            close_time: m.close_time,
            options: m
                .options
                .iter()
                .map(|o| OptionQuote {
                    text: o.text.clone(),
                    odds: o.odds,
                })
                .collect(),
        });
    }
}

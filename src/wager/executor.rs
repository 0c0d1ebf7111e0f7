//! Fire-time wager execution.
//!
//! Re-validates a scheduled wager, reserves its stake, submits it to the
//! primary endpoint (then the backup), and records the outcome in both the
//! bet ledger and the risk ledger. Refused wagers are stored as skipped.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::db::models::{BetRecord, Endpoint, SkippedWager};
use crate::db::Database;
use crate::notify::{Notifier, NotifyEvent};

use super::error::WagerError;
use super::gateway::WagerGateway;
use super::risk::RiskLedger;
use super::scheduler::{FireHandler, ScheduledWager};

#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Placed(BetRecord),
    Failed(BetRecord),
    /// Nothing was submitted
    Skipped(WagerError),
}

type PairKey = (String, String);

#[derive(Clone)]
pub struct WagerExecutor {
    gateway: Arc<dyn WagerGateway>,
    db: Database,
    risk: RiskLedger,
    notifier: Notifier,
    in_flight: Arc<Mutex<HashSet<PairKey>>>,
    /// Pairs accepted by the board in this process. Backs up the ledger
    /// check when a record could not be written.
    placed: Arc<Mutex<HashSet<PairKey>>>,
}

/// Marks a (match, option) pair as executing until dropped.
struct InFlight {
    set: Arc<Mutex<HashSet<PairKey>>>,
    key: PairKey,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

impl WagerExecutor {
    pub fn new(
        gateway: Arc<dyn WagerGateway>,
        db: Database,
        risk: RiskLedger,
        notifier: Notifier,
    ) -> Self {
        WagerExecutor {
            gateway,
            db,
            risk,
            notifier,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            placed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub async fn execute(&self, w: &ScheduledWager) -> ExecutionOutcome {
        let match_id = w.matched.id.clone();
        let option_id = w.option.id.clone();

        let _guard = match self.claim(&match_id, &option_id) {
            Some(g) => g,
            None => return self.skip(w, duplicate(&match_id, &option_id)),
        };

        match self.db.has_successful_bet(&match_id, &option_id) {
            Ok(false) => {}
            Ok(true) => return self.skip(w, duplicate(&match_id, &option_id)),
            Err(e) => return self.skip(w, WagerError::Ledger(format!("{:#}", e))),
        }

        let balance = match self.gateway.fetch_balance().await {
            Ok(b) => b,
            Err(e) => {
                warn!(
                    "Balance lookup failed before wager on {} ({:#}); using {:.2} from decision time",
                    match_id, e, w.balance
                );
                w.balance
            }
        };

        let reservation = match self.risk.reserve(w.stake, balance) {
            Ok(r) => r,
            Err(e) => return self.skip(w, e),
        };

        debug!(
            "Reserved {:.2} for {} option '{}'",
            reservation.amount(),
            match_id,
            w.option.text
        );
        let (endpoint, result) = self.submit(&w.option.id, w.stake).await;
        let mut record = BetRecord {
            id: None,
            match_id: match_id.clone(),
            option_id: option_id.clone(),
            match_title: w.matched.title.clone(),
            option_text: w.option.text.clone(),
            stake: w.stake,
            odds: w.option.odds,
            rule: w.rule.to_string(),
            success: false,
            endpoint: None,
            message: None,
            dry_run: self.gateway.is_dry_run(),
            submitted_at: Utc::now(),
        };

        match result {
            Ok(message) => {
                reservation.commit();
                self.placed
                    .lock()
                    .insert((match_id.clone(), option_id.clone()));
                record.success = true;
                record.endpoint = endpoint;
                record.message = Some(message);
                if let Err(e) = self.append(&mut record) {
                    error!(
                        "Wager on {}/{} was PLACED but the bet record is lost: {:#}",
                        match_id, option_id, e
                    );
                    self.notifier.notify(NotifyEvent::LedgerWriteFailed {
                        match_id: match_id.clone(),
                        option_id: option_id.clone(),
                        title: w.matched.title.clone(),
                        stake: w.stake,
                        reason: format!("{:#}", e),
                    });
                }
                info!(
                    "Wager PLACED on {} ({}): {:.2} on '{}' @ {:.2} via {} [{}]",
                    match_id,
                    w.matched.title,
                    w.stake,
                    w.option.text,
                    w.option.odds,
                    endpoint.map(|e| e.as_str()).unwrap_or("-"),
                    w.rule
                );
                self.notifier.notify(NotifyEvent::WagerPlaced {
                    match_id,
                    title: w.matched.title.clone(),
                    option_text: w.option.text.clone(),
                    odds: w.option.odds,
                    stake: w.stake,
                    endpoint: endpoint.map(|e| e.as_str()).unwrap_or("-").to_string(),
                    rule: w.rule.to_string(),
                });
                ExecutionOutcome::Placed(record)
            }
            Err(e) => {
                reservation.release();
                record.message = Some(e.to_string());
                if let Err(err) = self.append(&mut record) {
                    error!(
                        "Failed to append bet record for {}/{}: {:#}",
                        match_id, option_id, err
                    );
                }
                error!("Wager FAILED on {} ({}): {}", match_id, w.matched.title, e);
                self.notifier.notify(NotifyEvent::WagerFailed {
                    match_id,
                    title: w.matched.title.clone(),
                    option_text: w.option.text.clone(),
                    stake: w.stake,
                    reason: e.to_string(),
                });
                ExecutionOutcome::Failed(record)
            }
        }
    }

    fn claim(&self, match_id: &str, option_id: &str) -> Option<InFlight> {
        let key = (match_id.to_string(), option_id.to_string());
        if self.placed.lock().contains(&key) {
            return None;
        }
        if !self.in_flight.lock().insert(key.clone()) {
            return None;
        }
        Some(InFlight {
            set: Arc::clone(&self.in_flight),
            key,
        })
    }

    /// Primary first, one retry against the backup.
    async fn submit(&self, option_id: &str, stake: f64) -> (Option<Endpoint>, Result<String, WagerError>) {
        let primary = match self.gateway.submit_wager(Endpoint::Primary, option_id, stake).await {
            Ok(s) if s.success => return (Some(Endpoint::Primary), Ok(s.message)),
            Ok(s) => s.message,
            Err(e) => format!("{:#}", e),
        };
        warn!("Primary endpoint refused option {}: {}; trying backup", option_id, primary);

        let backup = match self.gateway.submit_wager(Endpoint::Backup, option_id, stake).await {
            Ok(s) if s.success => return (Some(Endpoint::Backup), Ok(s.message)),
            Ok(s) => s.message,
            Err(e) => format!("{:#}", e),
        };
        (None, Err(WagerError::SubmissionFailed { primary, backup }))
    }

    /// Append to the bet ledger, retrying once.
    fn append(&self, record: &mut BetRecord) -> anyhow::Result<()> {
        let id = match self.db.insert_bet_record(record) {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    "Bet record for {}/{} not written ({:#}); retrying",
                    record.match_id, record.option_id, e
                );
                self.db.insert_bet_record(record)?
            }
        };
        record.id = Some(id);
        Ok(())
    }

    fn skip(&self, w: &ScheduledWager, reason: WagerError) -> ExecutionOutcome {
        warn!("Wager on {} skipped [{}]: {}", w.matched.id, reason.kind(), reason);
        let skipped = SkippedWager {
            id: None,
            match_id: w.matched.id.clone(),
            option_id: w.option.id.clone(),
            match_title: w.matched.title.clone(),
            option_text: w.option.text.clone(),
            stake: w.stake,
            rule: w.rule.to_string(),
            reason_kind: reason.kind().to_string(),
            reason: reason.to_string(),
            skipped_at: Utc::now(),
        };
        if let Err(e) = self.db.insert_skipped_wager(&skipped) {
            error!("Failed to record skipped wager for {}: {:#}", w.matched.id, e);
        }
        self.notifier.notify(NotifyEvent::WagerSkipped {
            match_id: w.matched.id.clone(),
            title: w.matched.title.clone(),
            reason: reason.to_string(),
        });
        ExecutionOutcome::Skipped(reason)
    }
}

fn duplicate(match_id: &str, option_id: &str) -> WagerError {
    WagerError::DuplicateWager {
        match_id: match_id.to_string(),
        option_id: option_id.to_string(),
    }
}

#[async_trait]
impl FireHandler for WagerExecutor {
    async fn on_fire(&self, wager: ScheduledWager) {
        self.execute(&wager).await;
    }
}

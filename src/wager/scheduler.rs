//! Deadline scheduler: one timer per match.
//!
//! Per match ID the state machine is
//! `unscheduled → pending → fired → settled`, with `pending → expired` on
//! cancellation, shutdown or a missed window.
//!
//! Each pending timer is a tokio task sleeping until `close_time − lead`.
//! The `pending → fired` transition and every cancellation happen under the
//! same lock and are keyed by a per-registration generation number, so a
//! replaced or cancelled timer can never fire and a fired timer can never be
//! cancelled.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::models::{Match, MatchOption};
use crate::notify::{Notifier, NotifyEvent};

use super::decision::Wager;
use super::error::WagerError;

/// Two fire times closer than this are the same deadline.
const RESCHEDULE_TOLERANCE_MS: i64 = 1_000;

/// Everything the executor needs, captured when the timer is armed so a
/// later refresh of the match cannot change what gets submitted.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledWager {
    pub matched: Match,
    pub option: MatchOption,
    pub stake: f64,
    pub rule: &'static str,
    /// Balance seen when the decision was made
    pub balance: f64,
}

impl ScheduledWager {
    pub fn new(matched: Match, wager: Wager, rule: &'static str, balance: f64) -> Self {
        ScheduledWager {
            matched,
            option: wager.option,
            stake: wager.stake,
            rule,
            balance,
        }
    }
}

/// Called exactly once per fired timer.
#[async_trait]
pub trait FireHandler: Send + Sync {
    async fn on_fire(&self, wager: ScheduledWager);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerState {
    Pending,
    Fired,
    Settled,
    Expired,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOutcome {
    Scheduled { fire_at: DateTime<Utc> },
    Rescheduled {
        fire_at: DateTime<Utc>,
        previous: DateTime<Utc>,
    },
    /// A pending timer already targets (about) the same instant
    Unchanged { fire_at: DateTime<Utc> },
    /// Fire time already passed; the match is expired and never fires
    Missed { fire_at: DateTime<Utc> },
    /// The match already fired or expired
    AlreadyHandled(TimerState),
    ShuttingDown,
}

/// Read-only view of one scheduler entry.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleEntry {
    pub match_id: String,
    pub title: String,
    pub state: TimerState,
    pub fire_at: DateTime<Utc>,
    pub option_text: String,
    pub stake: f64,
    pub rule: &'static str,
    pub updated_at: DateTime<Utc>,
}

struct Slot {
    state: TimerState,
    generation: u64,
    fire_at: DateTime<Utc>,
    wager: ScheduledWager,
    handle: Option<JoinHandle<()>>,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct Table {
    slots: HashMap<String, Slot>,
    next_generation: u64,
    shutting_down: bool,
}

struct Inner {
    table: Mutex<Table>,
    lead: ChronoDuration,
    handler: Arc<dyn FireHandler>,
    notifier: Notifier,
}

#[derive(Clone)]
pub struct DeadlineScheduler {
    inner: Arc<Inner>,
}

impl DeadlineScheduler {
    pub fn new(lead_seconds: u64, handler: Arc<dyn FireHandler>, notifier: Notifier) -> Self {
        DeadlineScheduler {
            inner: Arc::new(Inner {
                table: Mutex::new(Table::default()),
                lead: ChronoDuration::seconds(lead_seconds as i64),
                handler,
                notifier,
            }),
        }
    }

    /// Arm (or re-arm) the timer for `wager.matched`.
    pub fn schedule(&self, wager: ScheduledWager) -> ScheduleOutcome {
        let now = Utc::now();
        let match_id = wager.matched.id.clone();
        let fire_at = wager.matched.close_time - self.inner.lead;

        let mut table = self.inner.table.lock();
        if table.shutting_down {
            return ScheduleOutcome::ShuttingDown;
        }

        let mut previous = None;
        if let Some(slot) = table.slots.get_mut(&match_id) {
            if slot.state != TimerState::Pending {
                return ScheduleOutcome::AlreadyHandled(slot.state);
            }
            let drift = (slot.fire_at - fire_at).num_milliseconds().abs();
            if drift <= RESCHEDULE_TOLERANCE_MS {
                return ScheduleOutcome::Unchanged {
                    fire_at: slot.fire_at,
                };
            }
            // Cancel-and-replace; the old task sees a stale generation even
            // if it is already past its sleep.
            if let Some(h) = slot.handle.take() {
                h.abort();
            }
            previous = Some(slot.fire_at);
        }

        if fire_at <= now {
            let title = wager.matched.title.clone();
            table.slots.insert(
                match_id.clone(),
                Slot {
                    state: TimerState::Expired,
                    generation: 0,
                    fire_at,
                    wager,
                    handle: None,
                    updated_at: now,
                },
            );
            drop(table);
            let missed = WagerError::MissedWindow {
                match_id: match_id.clone(),
                fire_at,
            };
            warn!("{} ({}, {}ms late)", missed, title, (now - fire_at).num_milliseconds());
            self.inner.notifier.notify(NotifyEvent::MissedWindow {
                match_id,
                title,
                fire_at,
            });
            return ScheduleOutcome::Missed { fire_at };
        }

        table.next_generation += 1;
        let generation = table.next_generation;
        let delay = (fire_at - now).to_std().unwrap_or_default();
        let inner = Arc::clone(&self.inner);
        let task_id = match_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.fire(&task_id, generation).await;
        });

        info!(
            "Armed wager for {} ({}) at {}: {:.2} on '{}' [{}]",
            match_id, wager.matched.title, fire_at, wager.stake, wager.option.text, wager.rule
        );
        table.slots.insert(
            match_id,
            Slot {
                state: TimerState::Pending,
                generation,
                fire_at,
                wager,
                handle: Some(handle),
                updated_at: now,
            },
        );

        match previous {
            Some(previous) => ScheduleOutcome::Rescheduled { fire_at, previous },
            None => ScheduleOutcome::Scheduled { fire_at },
        }
    }

    /// Move a pending timer to `m`'s current close time, keeping the wager
    /// captured when it was armed. `None` when nothing is pending for `m`.
    pub fn refresh_close_time(&self, m: &Match) -> Option<ScheduleOutcome> {
        let mut wager = {
            let table = self.inner.table.lock();
            let slot = table.slots.get(&m.id)?;
            if slot.state != TimerState::Pending {
                return None;
            }
            slot.wager.clone()
        };
        wager.matched.close_time = m.close_time;
        Some(self.schedule(wager))
    }

    /// Cancel a pending timer (e.g. the match is no longer LIVE).
    /// Returns false when nothing was pending; a fired timer is untouched.
    pub fn cancel(&self, match_id: &str) -> bool {
        let mut table = self.inner.table.lock();
        let Some(slot) = table.slots.get_mut(match_id) else {
            return false;
        };
        if slot.state != TimerState::Pending {
            return false;
        }
        if let Some(h) = slot.handle.take() {
            h.abort();
        }
        slot.state = TimerState::Expired;
        slot.updated_at = Utc::now();
        info!("Cancelled pending wager for {}", match_id);
        true
    }

    pub fn state(&self, match_id: &str) -> Option<TimerState> {
        self.inner.table.lock().slots.get(match_id).map(|s| s.state)
    }

    /// Number of timers still waiting to fire.
    pub fn pending_count(&self) -> usize {
        self.inner
            .table
            .lock()
            .slots
            .values()
            .filter(|s| s.state == TimerState::Pending)
            .count()
    }

    /// All entries, soonest fire time first.
    pub fn snapshot(&self) -> Vec<ScheduleEntry> {
        let table = self.inner.table.lock();
        let mut entries: Vec<ScheduleEntry> = table
            .slots
            .iter()
            .map(|(id, s)| ScheduleEntry {
                match_id: id.clone(),
                title: s.wager.matched.title.clone(),
                state: s.state,
                fire_at: s.fire_at,
                option_text: s.wager.option.text.clone(),
                stake: s.wager.stake,
                rule: s.wager.rule,
                updated_at: s.updated_at,
            })
            .collect();
        entries.sort_by_key(|e| e.fire_at);
        entries
    }

    /// Forget settled/expired entries last touched before `older_than`.
    pub fn prune(&self, older_than: DateTime<Utc>) -> usize {
        let mut table = self.inner.table.lock();
        let before = table.slots.len();
        table.slots.retain(|_, s| {
            matches!(s.state, TimerState::Pending | TimerState::Fired) || s.updated_at >= older_than
        });
        before - table.slots.len()
    }

    /// Cancel every pending timer without firing it, then wait for
    /// executions that already fired so no reservation is left dangling.
    pub async fn shutdown(&self) {
        let in_flight: Vec<JoinHandle<()>> = {
            let mut table = self.inner.table.lock();
            table.shutting_down = true;
            let now = Utc::now();
            let mut in_flight = Vec::new();
            for slot in table.slots.values_mut() {
                match slot.state {
                    TimerState::Pending => {
                        if let Some(h) = slot.handle.take() {
                            h.abort();
                        }
                        slot.state = TimerState::Expired;
                        slot.updated_at = now;
                    }
                    TimerState::Fired => {
                        if let Some(h) = slot.handle.take() {
                            in_flight.push(h);
                        }
                    }
                    TimerState::Settled | TimerState::Expired => {}
                }
            }
            in_flight
        };
        if !in_flight.is_empty() {
            info!("Waiting for {} in-flight wager(s)", in_flight.len());
        }
        futures_util::future::join_all(in_flight).await;
        info!("Deadline scheduler stopped");
    }
}

impl Inner {
    async fn fire(&self, match_id: &str, generation: u64) {
        let wager = {
            let mut table = self.table.lock();
            match table.slots.get_mut(match_id) {
                Some(slot) if slot.generation == generation && slot.state == TimerState::Pending => {
                    slot.state = TimerState::Fired;
                    slot.updated_at = Utc::now();
                    slot.wager.clone()
                }
                _ => {
                    debug!("Stale timer for {} (generation {}) ignored", match_id, generation);
                    return;
                }
            }
        };

        debug!("Timer fired for {}", match_id);
        self.handler.on_fire(wager).await;

        let mut table = self.table.lock();
        if let Some(slot) = table.slots.get_mut(match_id) {
            if slot.generation == generation && slot.state == TimerState::Fired {
                slot.state = TimerState::Settled;
                slot.updated_at = Utc::now();
                slot.handle = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wager::testkit::{make_match, make_option, scheduled, CountingHandler};
    use std::time::Duration;

    const LEAD: u64 = 10;

    fn closing_in(id: &str, millis: i64) -> Match {
        let mut m = make_match(id, vec![make_option("A", 2.0, 10.0)]);
        m.close_time = Utc::now() + ChronoDuration::seconds(LEAD as i64) + ChronoDuration::milliseconds(millis);
        m
    }

    fn scheduler(handler: &Arc<CountingHandler>) -> DeadlineScheduler {
        DeadlineScheduler::new(LEAD, handler.clone(), Notifier::disabled())
    }

    #[tokio::test]
    async fn test_fires_once_then_settles() {
        let handler = Arc::new(CountingHandler::default());
        let s = scheduler(&handler);
        let out = s.schedule(scheduled(closing_in("g1", 100), 50.0));
        assert!(matches!(out, ScheduleOutcome::Scheduled { .. }));
        assert_eq!(s.state("g1"), Some(TimerState::Pending));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(handler.count(), 1);
        assert_eq!(s.state("g1"), Some(TimerState::Settled));

        // Re-observing a settled match is a no-op
        let again = s.schedule(scheduled(closing_in("g1", 100), 50.0));
        assert_eq!(again, ScheduleOutcome::AlreadyHandled(TimerState::Settled));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handler.count(), 1);
    }

    #[tokio::test]
    async fn test_past_fire_time_expires_without_firing() {
        let handler = Arc::new(CountingHandler::default());
        let (notifier, mut rx) = Notifier::new(4);
        let s = DeadlineScheduler::new(LEAD, handler.clone(), notifier);

        // close in 5s with a 10s lead → fire time 5s ago
        let mut m = make_match("g1", vec![make_option("A", 2.0, 10.0)]);
        m.close_time = Utc::now() + ChronoDuration::seconds(5);
        let out = s.schedule(scheduled(m, 50.0));
        assert!(matches!(out, ScheduleOutcome::Missed { .. }));
        assert_eq!(s.state("g1"), Some(TimerState::Expired));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.count(), 0);
        assert!(matches!(rx.try_recv(), Ok(NotifyEvent::MissedWindow { .. })));
    }

    #[tokio::test]
    async fn test_reschedule_replaces_timer() {
        let handler = Arc::new(CountingHandler::default());
        let s = scheduler(&handler);
        s.schedule(scheduled(closing_in("g1", 1_500), 10.0));
        let out = s.schedule(scheduled(closing_in("g1", 150), 20.0));
        assert!(matches!(out, ScheduleOutcome::Rescheduled { .. }));

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(handler.count(), 1);
        assert_eq!(handler.stakes(), vec![20.0]);
    }

    #[tokio::test]
    async fn test_small_drift_keeps_existing_timer() {
        let handler = Arc::new(CountingHandler::default());
        let s = scheduler(&handler);
        s.schedule(scheduled(closing_in("g1", 200), 10.0));
        let out = s.schedule(scheduled(closing_in("g1", 400), 99.0));
        assert!(matches!(out, ScheduleOutcome::Unchanged { .. }));

        tokio::time::sleep(Duration::from_millis(700)).await;
        // captured decision from the first registration is what fired
        assert_eq!(handler.stakes(), vec![10.0]);
    }

    #[tokio::test]
    async fn test_refresh_close_time_keeps_captured_wager() {
        let handler = Arc::new(CountingHandler::default());
        let s = scheduler(&handler);
        assert_eq!(s.refresh_close_time(&closing_in("g1", 100)), None);

        s.schedule(scheduled(closing_in("g1", 5_000), 10.0));
        let moved = closing_in("g1", 150);
        let out = s.refresh_close_time(&moved);
        assert!(matches!(out, Some(ScheduleOutcome::Rescheduled { .. })));
        assert_eq!(s.snapshot()[0].fire_at, moved.close_time - ChronoDuration::seconds(LEAD as i64));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(handler.stakes(), vec![10.0]);
        assert_eq!(s.refresh_close_time(&moved), None);
    }

    #[tokio::test]
    async fn test_cancel_prevents_fire() {
        let handler = Arc::new(CountingHandler::default());
        let s = scheduler(&handler);
        s.schedule(scheduled(closing_in("g1", 200), 10.0));
        assert!(s.cancel("g1"));
        assert!(!s.cancel("g1"));
        assert_eq!(s.state("g1"), Some(TimerState::Expired));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(handler.count(), 0);
        // expired matches are not re-armed
        let again = s.schedule(scheduled(closing_in("g1", 200), 10.0));
        assert_eq!(again, ScheduleOutcome::AlreadyHandled(TimerState::Expired));
    }

    #[tokio::test]
    async fn test_cancel_after_fire_is_noop() {
        let handler = Arc::new(CountingHandler::with_delay(Duration::from_millis(300)));
        let s = scheduler(&handler);
        s.schedule(scheduled(closing_in("g1", 50), 10.0));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(s.state("g1"), Some(TimerState::Fired));
        assert!(!s.cancel("g1"));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(handler.count(), 1);
        assert_eq!(s.state("g1"), Some(TimerState::Settled));
    }

    #[tokio::test]
    async fn test_different_matches_fire_concurrently() {
        let handler = Arc::new(CountingHandler::with_delay(Duration::from_millis(300)));
        let s = scheduler(&handler);
        for id in ["g1", "g2", "g3"] {
            s.schedule(scheduled(closing_in(id, 100), 10.0));
        }
        // Serial execution would need ~1s
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(handler.count(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_and_waits_for_fired() {
        let handler = Arc::new(CountingHandler::with_delay(Duration::from_millis(200)));
        let s = scheduler(&handler);
        s.schedule(scheduled(closing_in("fired", 50), 10.0));
        s.schedule(scheduled(closing_in("pending", 5_000), 10.0));
        tokio::time::sleep(Duration::from_millis(120)).await;

        s.shutdown().await;
        // the in-flight execution completed before shutdown returned
        assert_eq!(handler.count(), 1);
        assert_eq!(s.state("pending"), Some(TimerState::Expired));
        assert_eq!(
            s.schedule(scheduled(closing_in("late", 500), 10.0)),
            ScheduleOutcome::ShuttingDown
        );
    }

    #[tokio::test]
    async fn test_prune_keeps_live_entries() {
        let handler = Arc::new(CountingHandler::default());
        let s = scheduler(&handler);
        s.schedule(scheduled(closing_in("pending", 5_000), 10.0));
        s.schedule(scheduled(closing_in("gone", 5_000), 10.0));
        s.cancel("gone");

        let removed = s.prune(Utc::now() + ChronoDuration::seconds(1));
        assert_eq!(removed, 1);
        assert_eq!(s.snapshot().len(), 1);
        assert_eq!(s.pending_count(), 1);
        s.shutdown().await;
    }
}

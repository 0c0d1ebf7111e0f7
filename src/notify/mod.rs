//! Fire-and-forget notifications.
//!
//! The engine pushes [`NotifyEvent`]s into a bounded channel with `try_send`
//! and never waits on delivery. A background task drains the channel, logs
//! every event and, when configured, POSTs it to a webhook.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// One option line of a new-match announcement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionQuote {
    pub text: String,
    pub odds: f64,
}

/// Something worth telling the operator about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifyEvent {
    NewMatch {
        match_id: String,
        title: String,
        close_time: DateTime<Utc>,
        /// Board order
        options: Vec<OptionQuote>,
    },
    WagerPlaced {
        match_id: String,
        title: String,
        option_text: String,
        odds: f64,
        stake: f64,
        endpoint: String,
        rule: String,
    },
    WagerFailed {
        match_id: String,
        title: String,
        option_text: String,
        stake: f64,
        reason: String,
    },
    WagerSkipped {
        match_id: String,
        title: String,
        reason: String,
    },
    /// The board accepted a wager but the bet ledger could not store it.
    LedgerWriteFailed {
        match_id: String,
        option_id: String,
        title: String,
        stake: f64,
        reason: String,
    },
    MissedWindow {
        match_id: String,
        title: String,
        fire_at: DateTime<Utc>,
    },
    FeedUnavailable {
        reason: String,
    },
}

impl NotifyEvent {
    pub fn title(&self) -> &'static str {
        match self {
            NotifyEvent::NewMatch { .. } => "New match",
            NotifyEvent::WagerPlaced { .. } => "Wager placed",
            NotifyEvent::WagerFailed { .. } => "Wager failed",
            NotifyEvent::WagerSkipped { .. } => "Wager skipped",
            NotifyEvent::LedgerWriteFailed { .. } => "Bet ledger write failed",
            NotifyEvent::MissedWindow { .. } => "Missed wager window",
            NotifyEvent::FeedUnavailable { .. } => "Match feed unavailable",
        }
    }

    /// Human-readable body.
    pub fn text(&self) -> String {
        match self {
            NotifyEvent::NewMatch {
                title,
                close_time,
                options,
                ..
            } => {
                let mut text = format!(
                    "{} closes at {}",
                    title,
                    close_time.format("%Y-%m-%d %H:%M:%S UTC")
                );
                for o in options {
                    text.push_str(&format!("\n{} - {:.2}", o.text, o.odds));
                }
                text
            }
            NotifyEvent::WagerPlaced {
                title,
                option_text,
                odds,
                stake,
                endpoint,
                rule,
                ..
            } => format!(
                "{}: {:.2} on '{}' @ {:.2} via {} ({})",
                title, stake, option_text, odds, endpoint, rule
            ),
            NotifyEvent::WagerFailed {
                title,
                option_text,
                stake,
                reason,
                ..
            } => format!("{}: {:.2} on '{}' failed: {}", title, stake, option_text, reason),
            NotifyEvent::WagerSkipped { title, reason, .. } => format!("{}: {}", title, reason),
            NotifyEvent::LedgerWriteFailed {
                title,
                option_id,
                stake,
                reason,
                ..
            } => format!(
                "{}: {:.2} on option {} was PLACED but not recorded: {}",
                title, stake, option_id, reason
            ),
            NotifyEvent::MissedWindow { title, fire_at, .. } => format!(
                "{}: fire time {} already passed",
                title,
                fire_at.format("%H:%M:%S")
            ),
            NotifyEvent::FeedUnavailable { reason } => reason.clone(),
        }
    }
}

/// Cheap, cloneable sending side. A disabled notifier drops everything.
#[derive(Clone)]
pub struct Notifier {
    tx: Option<mpsc::Sender<NotifyEvent>>,
}

impl Notifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<NotifyEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Notifier { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Notifier { tx: None }
    }

    /// Queue an event without waiting. Failures are logged, never returned.
    pub fn notify(&self, event: NotifyEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(event) {
            warn!("Notification DROPPED: {}", e);
        }
    }
}

/// Optional HTTP sink for notifications.
#[derive(Clone)]
pub struct WebhookSink {
    http: Client,
    url: String,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    title: &'a str,
    text: String,
    event: &'a NotifyEvent,
}

impl WebhookSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(WebhookSink {
            http,
            url: url.to_string(),
        })
    }

    async fn deliver(&self, event: &NotifyEvent) -> Result<()> {
        let payload = WebhookPayload {
            title: event.title(),
            text: event.text(),
            event,
        };
        let resp = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("Webhook request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("Webhook returned {}", resp.status());
        }
        Ok(())
    }
}

/// Spawn the delivery task. It ends when every [`Notifier`] clone is dropped.
pub fn spawn_delivery(
    mut rx: mpsc::Receiver<NotifyEvent>,
    webhook: Option<WebhookSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            info!("[notify] {}: {}", event.title(), event.text());
            if let Some(sink) = &webhook {
                if let Err(e) = sink.deliver(&event).await {
                    error!("Notification delivery failed: {:#}", e);
                }
            }
        }
    })
}

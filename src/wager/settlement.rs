use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::info;

use crate::db::models::Settlement;
use crate::db::Database;

use super::risk::RiskLedger;

/// Record the payout of a placed wager and feed its loss into the stop-loss.
///
/// Returns `None` when the wager was already settled; settling twice never
/// counts a loss twice.
pub fn record_settlement(
    db: &Database,
    risk: &RiskLedger,
    match_id: &str,
    option_id: &str,
    payout: f64,
) -> Result<Option<Settlement>> {
    if !(payout.is_finite() && payout >= 0.0) {
        bail!("Invalid payout {}", payout);
    }
    let Some(stake) = db
        .successful_stake(match_id, option_id)
        .context("Failed to look up wager")?
    else {
        bail!("No placed wager for match {} option {}", match_id, option_id);
    };
    if db.is_settled(match_id, option_id)? {
        return Ok(None);
    }

    let mut settlement = Settlement {
        id: None,
        match_id: match_id.to_string(),
        option_id: option_id.to_string(),
        stake,
        payout,
        recorded_at: Utc::now(),
    };
    settlement.id = Some(
        db.insert_settlement(&settlement)
            .context("Failed to store settlement")?,
    );
    risk.record_loss(settlement.loss());
    info!(
        "Settled {}/{}: stake {:.2}, payout {:.2}",
        match_id, option_id, stake, payout
    );
    Ok(Some(settlement))
}

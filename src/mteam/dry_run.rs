use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::db::models::Endpoint;
use crate::wager::gateway::{Submission, WagerGateway};

/// Simulated gateway: accepts every wager and debits a local balance.
pub struct DryRunGateway {
    balance: Mutex<f64>,
}

impl DryRunGateway {
    pub fn new(initial_balance: f64) -> Self {
        DryRunGateway {
            balance: Mutex::new(initial_balance),
        }
    }
}

#[async_trait]
impl WagerGateway for DryRunGateway {
    async fn submit_wager(&self, endpoint: Endpoint, option_id: &str, stake: f64) -> Result<Submission> {
        let mut balance = self.balance.lock();
        if stake > *balance {
            return Ok(Submission {
                success: false,
                message: format!("[DRY RUN] insufficient balance {:.2}", *balance),
            });
        }
        *balance -= stake;
        info!(
            "[DRY RUN] wager {:.2} on option {} via {} (balance {:.2})",
            stake,
            option_id,
            endpoint.as_str(),
            *balance
        );
        Ok(Submission {
            success: true,
            message: "[DRY RUN] accepted".into(),
        })
    }

    async fn fetch_balance(&self) -> Result<f64> {
        Ok(*self.balance.lock())
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}

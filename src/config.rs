use clap::Parser;

/// Deadline-driven auto-wagering engine for the M-Team betting board
#[derive(Parser, Debug, Clone)]
#[command(name = "autobet", version, about)]
pub struct Config {
    /// Run in dry-run mode (wagers are simulated, nothing is submitted)
    #[arg(long, env = "DRY_RUN", default_value = "false")]
    pub dry_run: bool,

    /// Simulated balance for dry-run mode (board points)
    #[arg(long, env = "INITIAL_BALANCE", default_value = "10000.0")]
    pub initial_balance: f64,

    /// M-Team API key (x-api-key header)
    #[arg(long, env = "MTEAM_API_KEY")]
    pub api_key: Option<String>,

    /// M-Team user ID, used to look up the balance
    #[arg(long, env = "MTEAM_UID")]
    pub uid: Option<String>,

    /// Primary M-Team API host
    #[arg(long, env = "MTEAM_PRIMARY_URL", default_value = "https://api.m-team.io")]
    pub primary_url: String,

    /// Backup M-Team API host
    #[arg(long, env = "MTEAM_BACKUP_URL", default_value = "https://api.m-team.cc")]
    pub backup_url: String,

    /// UTC offset (hours) of the naive timestamps published by the board
    #[arg(long, env = "FEED_UTC_OFFSET_HOURS", default_value = "8", allow_hyphen_values = true)]
    pub feed_utc_offset_hours: i32,

    /// HTTP request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "10")]
    pub request_timeout_secs: u64,

    /// Minimum offered odds for an option to be considered
    #[arg(long, env = "MIN_ODDS", default_value = "1.5")]
    pub min_odds: f64,

    /// Upper bound on a single stake (board points)
    #[arg(long, env = "BET_AMOUNT", default_value = "100.0")]
    pub bet_amount: f64,

    /// Daily stake cap as a fraction of the balance
    #[arg(long, env = "MAX_DAILY_BET", default_value = "0.2")]
    pub max_daily_bet_fraction: f64,

    /// Daily realised-loss limit as a fraction of the balance
    #[arg(long, env = "STOP_LOSS", default_value = "0.2")]
    pub stop_loss_fraction: f64,

    /// Seconds before a match closes at which its wager is submitted
    #[arg(long, env = "BET_BEFORE_SECONDS", default_value = "10")]
    pub lead_seconds: u64,

    /// Match category label (informational)
    #[arg(long, env = "MATCH_TYPE", default_value = "英雄联盟")]
    pub match_type: String,

    /// Strategy label (informational)
    #[arg(long, env = "BET_STRATEGY", default_value = "套利")]
    pub strategy: String,

    /// Match feed polling interval in seconds
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value = "60")]
    pub poll_interval_secs: u64,

    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "autobet.db")]
    pub database_path: String,

    /// JSON file holding reference odds per match
    #[arg(long, env = "ODDS_PATH", default_value = "external_odds.json")]
    pub odds_path: String,

    /// Status API listen address
    #[arg(long, env = "STATUS_ADDR", default_value = "127.0.0.1:8080")]
    pub status_addr: String,

    /// Emit notifications (new matches, wager results)
    #[arg(long, env = "NOTIFY", default_value_t = true, action = clap::ArgAction::Set)]
    pub notify: bool,

    /// Optional webhook receiving notifications as JSON
    #[arg(long, env = "NOTIFY_WEBHOOK_URL")]
    pub notify_webhook_url: Option<String>,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_key.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("MTEAM_API_KEY is required to read the match board.");
        }
        if !self.dry_run && self.uid.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("MTEAM_UID is required in live mode. Use --dry-run for simulation.");
        }
        if !(self.min_odds.is_finite() && self.min_odds >= 1.0) {
            anyhow::bail!("min_odds must be at least 1.0");
        }
        if !(self.bet_amount.is_finite() && self.bet_amount > 0.0) {
            anyhow::bail!("bet_amount must be positive");
        }
        if !(self.max_daily_bet_fraction > 0.0 && self.max_daily_bet_fraction <= 1.0) {
            anyhow::bail!("max_daily_bet_fraction must be in (0.0, 1.0]");
        }
        if !(self.stop_loss_fraction > 0.0 && self.stop_loss_fraction <= 1.0) {
            anyhow::bail!("stop_loss_fraction must be in (0.0, 1.0]");
        }
        if self.lead_seconds == 0 {
            anyhow::bail!("lead_seconds must be at least 1");
        }
        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be at least 1");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be at least 1");
        }
        if !(-12..=14).contains(&self.feed_utc_offset_hours) {
            anyhow::bail!("feed_utc_offset_hours must be between -12 and 14");
        }
        if self.dry_run && self.initial_balance <= 0.0 {
            anyhow::bail!("initial_balance must be positive");
        }
        Ok(())
    }
}

pub mod client;
pub mod dry_run;

pub use client::MTeamClient;
pub use dry_run::DryRunGateway;

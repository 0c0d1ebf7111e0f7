pub mod decision;
pub mod engine;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod kelly;
pub mod odds_cache;
pub mod risk;
pub mod scheduler;
pub mod settlement;

#[cfg(test)]
pub mod testkit;

pub use decision::{DecisionEngine, DecisionParams};
pub use engine::WagerEngine;
pub use executor::WagerExecutor;
pub use gateway::WagerGateway;
pub use odds_cache::OddsCache;
pub use risk::{RiskLedger, RiskLimits};
pub use scheduler::DeadlineScheduler;

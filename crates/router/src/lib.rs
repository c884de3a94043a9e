//! Failover routing: provider selection, per-session audit of provider
//! switches and the end-to-end turn protocol.

pub mod audit;
pub mod failover;
mod request_router;
pub mod stats;

pub use audit::TransitionAuditor;
pub use failover::{ActiveState, Decision, FailoverController, Transition};
pub use request_router::{RequestRouter, RestoreReport, RoutedResponse, RouterComponents};
pub use stats::{ActiveFallbackGuard, RouterStatistics, StatisticsSnapshot};

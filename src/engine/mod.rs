//! Core engine: adaptive filters, candidate ranking, and the coordinator
//! that runs analyses and scans under the shared quota.

pub mod coordinator;
pub mod filters;
pub mod scanner;

pub use coordinator::{
    AnalysisCoordinator, Collaborators, CoordinatorConfig, MarketOverview, ScanAndAnalyze,
};
pub use filters::AdaptiveFilterEngine;

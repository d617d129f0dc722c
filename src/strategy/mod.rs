//! Strategy: turning independent layer scores into actionable signals.

pub mod convergence;

pub use convergence::{
    Convergence, ConvergenceAnalyzer, ConvergenceConfig, LayerWeights, StrengthThresholds,
};

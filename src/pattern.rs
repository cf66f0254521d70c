use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::PatternError;

/// Downstream pattern stage driven by the pipeline after indicators.
///
/// The pipeline only triggers these operations and checks their counters;
/// pattern contents stay opaque to it.
pub trait PatternStage: Send + Sync {
    fn is_build_in_progress(&self) -> bool;

    fn pattern_count(&self) -> BoxFuture<'_, Result<u64, Report<PatternError>>>;

    /// Continue building patterns from where the last build stopped.
    fn resume_pattern_building(&self) -> BoxFuture<'_, Result<(), Report<PatternError>>>;

    /// Evaluate the current patterns; returns how many were evaluated.
    fn evaluate_patterns(&self) -> BoxFuture<'_, Result<u64, Report<PatternError>>>;
}

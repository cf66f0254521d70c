//! Linear orchestration: sync, indicators, pattern build, pattern evaluation.
//!
//! Stages run strictly in order and the first failure ends the run. Each
//! stage refuses to start while its own latch is held by an independently
//! triggered run, and is checked against a postcondition afterwards.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use error_stack::{Report, ResultExt, bail};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::{CalcOutcome, IndicatorEngine};
use crate::error::PipelineError;
use crate::pattern::PatternStage;
use crate::single_flight::SingleFlight;
use crate::storage::{CandleStore, IndicatorStore};
use crate::sync::{CandleSynchronizer, SyncOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Sync,
    Indicators,
    BuildPatterns,
    EvaluatePatterns,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Sync,
        Stage::Indicators,
        Stage::BuildPatterns,
        Stage::EvaluatePatterns,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Indicators => "indicators",
            Self::BuildPatterns => "build patterns",
            Self::EvaluatePatterns => "evaluate patterns",
        }
    }

    fn progress_message(self) -> &'static str {
        match self {
            Self::Sync => "syncing candles",
            Self::Indicators => "calculating indicators",
            Self::BuildPatterns => "building patterns",
            Self::EvaluatePatterns => "evaluating patterns",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    NotExecuted,
    Skipped,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "FAILED",
            Self::NotExecuted => "not executed",
            Self::Skipped => "skipped",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    pub elapsed: Duration,
    pub detail: String,
}

impl StageReport {
    fn not_executed(stage: Stage) -> Self {
        Self {
            stage,
            status: StageStatus::NotExecuted,
            elapsed: Duration::ZERO,
            detail: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub success: bool,
    pub stages: Vec<StageReport>,
    pub failure: Option<String>,
}

impl PipelineReport {
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn elapsed(&self) -> Duration {
        self.stages.iter().map(|s| s.elapsed).sum()
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failure {
            None => writeln!(
                f,
                "pipeline run {}: ok in {} ms",
                self.run_id,
                self.elapsed().as_millis()
            )?,
            Some(reason) => writeln!(f, "pipeline run {}: failed: {reason}", self.run_id)?,
        }
        for s in &self.stages {
            write!(
                f,
                "  {:<18} {:<13} {:>7} ms",
                s.stage.as_str(),
                s.status.to_string(),
                s.elapsed.as_millis()
            )?;
            if !s.detail.is_empty() {
                write!(f, "  {}", s.detail)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

enum StageResult {
    Done(String),
    Skipped(String),
}

type ProgressFn = Box<dyn Fn(&str) + Send + Sync>;

pub struct Pipeline {
    sync: Arc<CandleSynchronizer>,
    engine: Arc<IndicatorEngine>,
    candles: Arc<dyn CandleStore>,
    indicators: Arc<dyn IndicatorStore>,
    patterns: Option<Arc<dyn PatternStage>>,
    progress: Option<ProgressFn>,
    flight: SingleFlight,
}

impl Pipeline {
    pub fn new(
        sync: Arc<CandleSynchronizer>,
        engine: Arc<IndicatorEngine>,
        candles: Arc<dyn CandleStore>,
        indicators: Arc<dyn IndicatorStore>,
    ) -> Self {
        Self {
            sync,
            engine,
            candles,
            indicators,
            patterns: None,
            progress: None,
            flight: SingleFlight::new(),
        }
    }

    /// Attach the pattern stage; without one, stages 3 and 4 are skipped.
    pub fn with_patterns(mut self, patterns: Arc<dyn PatternStage>) -> Self {
        self.patterns = Some(patterns);
        self
    }

    /// Called with a short status line as each stage starts.
    pub fn with_progress(mut self, progress: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn is_in_progress(&self) -> bool {
        self.flight.is_active()
    }

    pub fn flight(&self) -> &SingleFlight {
        &self.flight
    }

    pub async fn run(&self) -> PipelineReport {
        let run_id = Uuid::new_v4();
        let Some(_guard) = self.flight.try_acquire() else {
            info!(%run_id, "pipeline already in progress, run rejected");
            return PipelineReport {
                run_id,
                success: false,
                stages: Stage::ALL.into_iter().map(StageReport::not_executed).collect(),
                failure: Some("pipeline already in progress".into()),
            };
        };

        info!(%run_id, "pipeline run started");
        let mut stages = Vec::with_capacity(Stage::ALL.len());
        let mut failure: Option<String> = None;

        for stage in Stage::ALL {
            if failure.is_some() {
                stages.push(StageReport::not_executed(stage));
                continue;
            }

            self.report_progress(stage.progress_message());
            let started = Instant::now();
            let result = self.run_stage(stage).await;
            let elapsed = started.elapsed();

            let (status, detail) = match result {
                Ok(StageResult::Done(detail)) => (StageStatus::Succeeded, detail),
                Ok(StageResult::Skipped(detail)) => (StageStatus::Skipped, detail),
                Err(report) => {
                    warn!(%run_id, stage = %stage, error = ?report, "pipeline stage failed");
                    let message = report.current_context().to_string();
                    failure = Some(message.clone());
                    (StageStatus::Failed, message)
                }
            };
            info!(
                %run_id,
                stage = %stage,
                status = %status,
                elapsed_ms = elapsed.as_millis() as u64,
                "pipeline stage finished"
            );
            stages.push(StageReport {
                stage,
                status,
                elapsed,
                detail,
            });
        }

        let report = PipelineReport {
            run_id,
            success: failure.is_none(),
            stages,
            failure,
        };
        info!(
            %run_id,
            success = report.success,
            elapsed_ms = report.elapsed().as_millis() as u64,
            "pipeline run finished"
        );
        report
    }

    fn report_progress(&self, message: &str) {
        if let Some(progress) = &self.progress
            && catch_unwind(AssertUnwindSafe(|| progress(message))).is_err()
        {
            warn!(message, "progress callback panicked");
        }
    }

    async fn run_stage(&self, stage: Stage) -> Result<StageResult, Report<PipelineError>> {
        match stage {
            Stage::Sync => self.sync_stage().await,
            Stage::Indicators => self.indicator_stage().await,
            Stage::BuildPatterns => self.build_stage().await,
            Stage::EvaluatePatterns => self.evaluate_stage().await,
        }
    }

    async fn sync_stage(&self) -> Result<StageResult, Report<PipelineError>> {
        let stage = Stage::Sync;
        if self.sync.is_in_progress() {
            bail!(busy(stage));
        }

        let stored = self.candles.count_candles().await.change_context(failed(stage))?;
        // An empty store has nothing to follow, so page through history first.
        let outcome = if stored == 0 {
            self.sync.initial_load().await
        } else {
            self.sync.update_latest().await
        }
        .change_context(failed(stage))?;
        let SyncOutcome::Completed(stats) = outcome else {
            bail!(busy(stage));
        };

        let stored = self.candles.count_candles().await.change_context(failed(stage))?;
        if stored == 0 {
            bail!(postcondition(stage, "candle store is still empty"));
        }
        if self.sync.is_in_progress() {
            bail!(postcondition(stage, "sync still flagged in progress"));
        }
        Ok(StageResult::Done(format!(
            "{} new candles, {stored} stored",
            stats.saved
        )))
    }

    async fn indicator_stage(&self) -> Result<StageResult, Report<PipelineError>> {
        let stage = Stage::Indicators;
        if self.engine.is_in_progress() {
            bail!(busy(stage));
        }

        let outcome = self
            .engine
            .resume_calculation()
            .await
            .change_context(failed(stage))?;
        let CalcOutcome::Completed(stats) = outcome else {
            bail!(busy(stage));
        };

        let stored = self
            .indicators
            .count_indicators()
            .await
            .change_context(failed(stage))?;
        if stored == 0 {
            bail!(postcondition(stage, "no indicator records exist"));
        }
        if self.engine.is_in_progress() {
            bail!(postcondition(stage, "calculation still flagged in progress"));
        }
        Ok(StageResult::Done(format!(
            "{} new records ({} failed), {stored} stored",
            stats.saved, stats.failed
        )))
    }

    async fn build_stage(&self) -> Result<StageResult, Report<PipelineError>> {
        let stage = Stage::BuildPatterns;
        let Some(patterns) = &self.patterns else {
            return Ok(StageResult::Skipped("no pattern stage attached".into()));
        };
        if patterns.is_build_in_progress() {
            bail!(busy(stage));
        }

        patterns
            .resume_pattern_building()
            .await
            .change_context(failed(stage))?;

        let count = patterns.pattern_count().await.change_context(failed(stage))?;
        if count == 0 {
            bail!(postcondition(stage, "no patterns exist"));
        }
        if patterns.is_build_in_progress() {
            bail!(postcondition(stage, "build still flagged in progress"));
        }
        Ok(StageResult::Done(format!("{count} patterns stored")))
    }

    async fn evaluate_stage(&self) -> Result<StageResult, Report<PipelineError>> {
        let stage = Stage::EvaluatePatterns;
        let Some(patterns) = &self.patterns else {
            return Ok(StageResult::Skipped("no pattern stage attached".into()));
        };

        let evaluated = patterns
            .evaluate_patterns()
            .await
            .change_context(failed(stage))?;
        Ok(StageResult::Done(format!("{evaluated} patterns evaluated")))
    }
}

fn busy(stage: Stage) -> PipelineError {
    PipelineError::StageBusy {
        stage: stage.to_string(),
    }
}

fn failed(stage: Stage) -> PipelineError {
    PipelineError::StageFailed {
        stage: stage.to_string(),
    }
}

fn postcondition(stage: Stage, reason: &str) -> PipelineError {
    PipelineError::Postcondition {
        stage: stage.to_string(),
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DEFAULT_BATCH_SIZE;
    use crate::error::PatternError;
    use crate::model::fixtures::wavy_series;
    use crate::storage::sqlite::SqliteStorage;
    use crate::sync::tests::{SeriesSource, settings};
    use futures::future::BoxFuture;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct FakePatterns {
        patterns: AtomicU64,
        builds: AtomicU64,
        evaluations: AtomicU64,
        building: AtomicBool,
    }

    impl PatternStage for FakePatterns {
        fn is_build_in_progress(&self) -> bool {
            self.building.load(Ordering::SeqCst)
        }

        fn pattern_count(&self) -> BoxFuture<'_, Result<u64, Report<PatternError>>> {
            Box::pin(async { Ok(self.patterns.load(Ordering::SeqCst)) })
        }

        fn resume_pattern_building(&self) -> BoxFuture<'_, Result<(), Report<PatternError>>> {
            Box::pin(async {
                self.builds.fetch_add(1, Ordering::SeqCst);
                self.patterns.store(3, Ordering::SeqCst);
                Ok(())
            })
        }

        fn evaluate_patterns(&self) -> BoxFuture<'_, Result<u64, Report<PatternError>>> {
            Box::pin(async {
                self.evaluations.fetch_add(1, Ordering::SeqCst);
                Ok(self.patterns.load(Ordering::SeqCst))
            })
        }
    }

    struct Harness {
        pipeline: Pipeline,
        sync: Arc<CandleSynchronizer>,
        engine: Arc<IndicatorEngine>,
        patterns: Arc<FakePatterns>,
    }

    async fn harness(candles: i64) -> Harness {
        let storage = Arc::new(SqliteStorage::in_memory().await);
        let source = Arc::new(SeriesSource::new(wavy_series(candles), 1000));
        let sync = Arc::new(CandleSynchronizer::new(
            source,
            storage.clone(),
            settings(1000),
            CancellationToken::new(),
        ));
        let engine = Arc::new(
            IndicatorEngine::new(storage.clone(), storage.clone(), DEFAULT_BATCH_SIZE).unwrap(),
        );
        let patterns = Arc::new(FakePatterns::default());
        let pipeline = Pipeline::new(sync.clone(), engine.clone(), storage.clone(), storage)
            .with_patterns(patterns.clone());
        Harness {
            pipeline,
            sync,
            engine,
            patterns,
        }
    }

    fn statuses(report: &PipelineReport) -> Vec<StageStatus> {
        report.stages.iter().map(|s| s.status).collect()
    }

    #[tokio::test]
    async fn all_stages_run_in_order() {
        let h = harness(210).await;
        let report = h.pipeline.run().await;

        assert!(report.success, "{report}");
        assert_eq!(report.failure, None);
        assert_eq!(statuses(&report), vec![StageStatus::Succeeded; 4]);
        let order: Vec<Stage> = report.stages.iter().map(|s| s.stage).collect();
        assert_eq!(order, Stage::ALL.to_vec());
        assert_eq!(h.patterns.builds.load(Ordering::SeqCst), 1);
        assert_eq!(h.patterns.evaluations.load(Ordering::SeqCst), 1);
        assert!(!h.pipeline.is_in_progress());
    }

    #[tokio::test]
    async fn indicator_invariant_violation_aborts_later_stages() {
        // too little history for any record
        let h = harness(50).await;
        let report = h.pipeline.run().await;

        assert!(!report.success);
        assert_eq!(
            statuses(&report),
            vec![
                StageStatus::Succeeded,
                StageStatus::Failed,
                StageStatus::NotExecuted,
                StageStatus::NotExecuted,
            ]
        );
        let failure = report.failure.as_deref().unwrap();
        assert!(failure.contains("indicators"), "{failure}");
        assert_eq!(h.patterns.builds.load(Ordering::SeqCst), 0);
        assert_eq!(h.patterns.evaluations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn independently_running_stage_fails_the_run() {
        let h = harness(210).await;
        let _held = h.engine.flight().try_acquire().unwrap();

        let report = h.pipeline.run().await;
        assert!(!report.success);
        assert_eq!(report.stage(Stage::Sync).unwrap().status, StageStatus::Succeeded);
        assert_eq!(report.stage(Stage::Indicators).unwrap().status, StageStatus::Failed);
        assert_eq!(
            report.failure.as_deref(),
            Some("indicators already in progress")
        );
    }

    #[tokio::test]
    async fn busy_sync_fails_first_stage() {
        let h = harness(210).await;
        let _held = h.sync.flight().try_acquire().unwrap();

        let report = h.pipeline.run().await;
        assert_eq!(
            statuses(&report),
            vec![
                StageStatus::Failed,
                StageStatus::NotExecuted,
                StageStatus::NotExecuted,
                StageStatus::NotExecuted,
            ]
        );
    }

    #[tokio::test]
    async fn busy_pattern_build_fails_third_stage() {
        let h = harness(210).await;
        h.patterns.building.store(true, Ordering::SeqCst);

        let report = h.pipeline.run().await;
        assert!(!report.success);
        assert_eq!(
            report.stage(Stage::BuildPatterns).unwrap().status,
            StageStatus::Failed
        );
        assert_eq!(
            report.stage(Stage::EvaluatePatterns).unwrap().status,
            StageStatus::NotExecuted
        );
    }

    #[tokio::test]
    async fn overlapping_pipeline_run_is_rejected() {
        let h = harness(210).await;
        let _held = h.pipeline.flight().try_acquire().unwrap();

        let report = h.pipeline.run().await;
        assert!(!report.success);
        assert_eq!(statuses(&report), vec![StageStatus::NotExecuted; 4]);
        assert_eq!(
            report.failure.as_deref(),
            Some("pipeline already in progress")
        );
    }

    #[tokio::test]
    async fn second_run_follows_the_first() {
        let h = harness(210).await;
        assert!(h.pipeline.run().await.success);

        let report = h.pipeline.run().await;
        assert!(report.success, "{report}");
        let sync = report.stage(Stage::Sync).unwrap();
        assert!(sync.detail.starts_with("0 new candles"), "{}", sync.detail);
    }

    #[tokio::test]
    async fn progress_reported_per_stage_and_panics_contained() {
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let h = harness(210).await;
        let sink = seen.clone();
        let pipeline = h.pipeline.with_progress(move |msg| {
            sink.lock().unwrap().push(msg.to_owned());
            if msg == "building patterns" {
                panic!("callback failure");
            }
        });

        let report = pipeline.run().await;
        assert!(report.success, "{report}");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "syncing candles",
                "calculating indicators",
                "building patterns",
                "evaluating patterns",
            ]
        );
    }

    #[tokio::test]
    async fn missing_pattern_stage_is_skipped() {
        let storage = Arc::new(SqliteStorage::in_memory().await);
        let source = Arc::new(SeriesSource::new(wavy_series(205), 1000));
        let sync = Arc::new(CandleSynchronizer::new(
            source,
            storage.clone(),
            settings(1000),
            CancellationToken::new(),
        ));
        let engine = Arc::new(
            IndicatorEngine::new(storage.clone(), storage.clone(), DEFAULT_BATCH_SIZE).unwrap(),
        );
        let pipeline = Pipeline::new(sync, engine, storage.clone(), storage);

        let report = pipeline.run().await;
        assert!(report.success);
        assert_eq!(
            statuses(&report),
            vec![
                StageStatus::Succeeded,
                StageStatus::Succeeded,
                StageStatus::Skipped,
                StageStatus::Skipped,
            ]
        );
        let text = report.to_string();
        assert!(text.contains("evaluate patterns"), "{text}");
        assert!(text.contains("no pattern stage attached"), "{text}");
    }
}

// THEORY:
// The `pipeline` module is the top-level API for the engine. It drives one analysis
// request through every stage, from a persisted scan record to a stored result:
//
//   Idle -> LoadingClassifier -> Encoding -> Inferring -> ComputingCam
//        -> Normalizing -> ExtractingMetrics -> Assembling -> Ready
//
// Any non-terminal state may instead move to `Failed(reason)`. Both `Ready` and
// `Failed` are terminal and there are no automatic retries; the caller decides
// whether to re-submit, guided by `AnalysisError::is_retryable`.
//
// A request owns everything it computes. The only shared things are the cached
// classifier (read-only once loaded) and the storage collaborator, so requests can
// run concurrently without locks. A failure anywhere short-circuits the remaining
// stages and nothing is stored for the request.

use std::sync::Arc;

use serde::Serialize;

use crate::config::PipelineConfig;
use crate::core_modules::cam::CamComputer;
use crate::core_modules::classifier::{Classifier, ClassifierCache, ModelLoader};
use crate::core_modules::grid_encoder::GridEncoder;
use crate::core_modules::metrics_extractor::metrics_extractor;
use crate::core_modules::normalizer::normalize;
use crate::core_modules::result_assembler::ResultAssembler;
use crate::core_modules::runtime::RuntimeContext;
use crate::error::{AnalysisError, FailureReason, Result};
use crate::record::ScanRecord;
use crate::storage::Storage;
use crate::{log_debug, log_info, log_warn};

// Re-export key data structures for the public API.
pub use crate::core_modules::feature_map::Heatmap;
pub use crate::core_modules::metrics_extractor::{Centroid, Metrics};
pub use crate::core_modules::result_assembler::AnalysisResult;

const ENABLE_LOGS: bool = true;

/// Lifecycle of a single analysis request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum AnalysisState {
    Idle,
    LoadingClassifier,
    Encoding,
    Inferring,
    ComputingCam,
    Normalizing,
    ExtractingMetrics,
    Assembling,
    Ready,
    Failed(FailureReason),
}

impl AnalysisState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisState::Ready | AnalysisState::Failed(_))
    }

    /// The following state on the success path.
    pub fn successor(&self) -> Option<AnalysisState> {
        use AnalysisState::*;
        match self {
            Idle => Some(LoadingClassifier),
            LoadingClassifier => Some(Encoding),
            Encoding => Some(Inferring),
            Inferring => Some(ComputingCam),
            ComputingCam => Some(Normalizing),
            Normalizing => Some(ExtractingMetrics),
            ExtractingMetrics => Some(Assembling),
            Assembling => Some(Ready),
            Ready | Failed(_) => None,
        }
    }

    pub fn can_advance_to(&self, next: &AnalysisState) -> bool {
        match next {
            AnalysisState::Failed(_) => !self.is_terminal(),
            _ => self.successor().as_ref() == Some(next),
        }
    }
}

/// Records the states a request passed through.
struct StateTrace<'a> {
    scan_id: &'a str,
    states: Vec<AnalysisState>,
}

impl<'a> StateTrace<'a> {
    fn new(scan_id: &'a str) -> Self {
        Self {
            scan_id,
            states: vec![AnalysisState::Idle],
        }
    }

    fn current(&self) -> AnalysisState {
        self.states.last().copied().unwrap_or(AnalysisState::Idle)
    }

    fn advance(&mut self, next: AnalysisState) {
        let current = self.current();
        debug_assert!(current.can_advance_to(&next), "{current:?} -> {next:?}");
        log_debug!("[{}] {:?} -> {:?}", self.scan_id, current, next);
        self.states.push(next);
    }
}

/// The outcome of one request plus the path it took through the state machine.
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub scan_id: String,
    pub states: Vec<AnalysisState>,
    pub outcome: std::result::Result<AnalysisResult, AnalysisError>,
}

impl AnalysisReport {
    pub fn is_ready(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn final_state(&self) -> AnalysisState {
        self.states.last().copied().unwrap_or(AnalysisState::Idle)
    }

    pub fn result(&self) -> Option<&AnalysisResult> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&AnalysisError> {
        self.outcome.as_ref().err()
    }
}

/// The main, top-level struct for the engine.
pub struct AnalysisPipeline<L: ModelLoader, S: Storage> {
    config: PipelineConfig,
    classifiers: Arc<ClassifierCache<L>>,
    storage: Arc<S>,
}

impl<L: ModelLoader, S: Storage> AnalysisPipeline<L, S> {
    pub fn new(config: PipelineConfig, classifiers: Arc<ClassifierCache<L>>, storage: Arc<S>) -> Self {
        Self {
            config,
            classifiers,
            storage,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn classifiers(&self) -> &Arc<ClassifierCache<L>> {
        &self.classifiers
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Runs one request to a terminal state. Never panics on bad input; every
    /// failure is reported through `AnalysisReport::outcome`.
    pub async fn analyze(&self, runtime: &RuntimeContext, scan_id: &str, record: &ScanRecord) -> AnalysisReport {
        let mut trace = StateTrace::new(scan_id);
        let outcome = self.run(runtime, scan_id, record, &mut trace).await;

        match &outcome {
            Ok(result) => {
                trace.advance(AnalysisState::Ready);
                log_info!(
                    "[{scan_id}] ready: {} ({:.3}), {:.1}% affected",
                    result.predicted_label,
                    result.confidence,
                    result.metrics.percent_affected
                );
            }
            Err(err) => {
                let failed_in = trace.current();
                trace.advance(AnalysisState::Failed(err.reason()));
                log_warn!("[{scan_id}] failed in {failed_in:?}: {err}");
            }
        }

        AnalysisReport {
            scan_id: scan_id.to_string(),
            states: trace.states,
            outcome,
        }
    }

    async fn run(
        &self,
        runtime: &RuntimeContext,
        scan_id: &str,
        record: &ScanRecord,
        trace: &mut StateTrace<'_>,
    ) -> Result<AnalysisResult> {
        // Stage 1: Shared classifier
        trace.advance(AnalysisState::LoadingClassifier);
        let classifier = self.classifiers.get().await?;

        // Stage 2: Trails -> occupancy grid
        trace.advance(AnalysisState::Encoding);
        let grid = GridEncoder::for_record(record)?.encode(&record.trails);
        log_debug!(
            "[{scan_id}] encoded {}x{} grid, {} cells occupied",
            grid.rows(),
            grid.cols(),
            grid.occupied_count()
        );

        // Stage 3: Inference
        trace.advance(AnalysisState::Inferring);
        let cam = CamComputer::new(runtime).with_layer(self.config.feature_layer);
        let inference = cam.infer(classifier.as_ref(), &grid).await?;
        let target = inference
            .predicted_class()
            .ok_or_else(|| AnalysisError::ModelIncompatible("classifier produced no scores".into()))?;

        // Stage 4: Activation map for the predicted class
        trace.advance(AnalysisState::ComputingCam);
        let cam_output = cam.attribute(classifier.as_ref(), inference, target).await?;

        // Stage 5: Normalization
        trace.advance(AnalysisState::Normalizing);
        let heatmap = normalize(&cam_output.raw);

        // Stage 6: Shape metrics
        trace.advance(AnalysisState::ExtractingMetrics);
        let metrics = metrics_extractor::extract(&heatmap, self.config.threshold);

        // Stage 7: Assembly and handoff to storage
        trace.advance(AnalysisState::Assembling);
        let assembly = ResultAssembler::new(self.config.render_scale).assemble(
            classifier.labels(),
            &cam_output.scores,
            metrics,
            &heatmap,
        )?;
        let image_ref = self.storage.save_heatmap_image(&assembly.image).await?;
        let result = assembly.pending.finish(image_ref);
        self.storage.save_analysis_result(scan_id, &result).await?;

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AnalysisState::*;

    #[test]
    fn success_path_is_linear() {
        let mut state = Idle;
        let mut visited = vec![state];
        while let Some(next) = state.successor() {
            assert!(state.can_advance_to(&next));
            state = next;
            visited.push(state);
        }
        assert_eq!(visited.len(), 9);
        assert_eq!(state, Ready);
    }

    #[test]
    fn any_live_state_can_fail_but_terminals_cannot_move() {
        let failed = Failed(FailureReason::Encoding);
        for state in [Idle, LoadingClassifier, Encoding, Inferring, ComputingCam, Normalizing, ExtractingMetrics, Assembling] {
            assert!(state.can_advance_to(&failed));
        }
        assert!(!Ready.can_advance_to(&failed));
        assert!(!failed.can_advance_to(&Idle));
        assert!(!Encoding.can_advance_to(&Normalizing));
    }

    #[test]
    fn trace_can_fail_straight_from_idle() {
        let mut trace = StateTrace::new("scan-0");
        assert_eq!(trace.current(), Idle);
        trace.advance(Failed(FailureReason::ModelLoad));
        assert_eq!(trace.states, vec![Idle, Failed(FailureReason::ModelLoad)]);
    }

    #[test]
    fn failed_state_serializes_with_reason() {
        let value = serde_json::to_value(Failed(FailureReason::ModelIncompatible)).unwrap();
        assert_eq!(value["state"], "failed");
        assert_eq!(value["reason"], "model_incompatible");
    }
}

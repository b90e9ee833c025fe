// THEORY:
// This file is the main entry point for the `fieldcam` library crate. It exposes
// the `AnalysisPipeline` and its data structures (`ScanRecord`, `AnalysisResult`,
// `Metrics`, etc.) as the high-level interface for explaining visual-field scan
// classifications.
//
// A request flows through the `core_modules` in a fixed order: the `grid_encoder`
// turns gaze trails into an occupancy grid, `cam` runs the classifier and derives
// a Grad-CAM map for the predicted class, the `normalizer` rescales that map into
// a heatmap, the `metrics_extractor` summarises its shape, and the
// `result_assembler` packages everything for `storage`. The `parallel_pipeline`
// runs many such requests at once.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;
pub mod record;
pub mod storage;

pub use config::PipelineConfig;
pub use core_modules::classifier::{Classifier, ClassifierCache, ModelLoader};
pub use core_modules::conv_classifier::{ArtifactLoader, ConvClassifier, ModelArtifact};
pub use core_modules::runtime::RuntimeContext;
pub use error::{AnalysisError, FailureReason};
pub use parallel_pipeline::ParallelAnalyzer;
pub use pipeline::{AnalysisPipeline, AnalysisReport, AnalysisResult, AnalysisState, Metrics};
pub use record::{OutputRecord, ScanRecord};
pub use storage::{FsStorage, MemoryStorage, Storage};

// THEORY:
// The `ResultAssembler` packages the pieces of a finished analysis (prediction,
// metrics, rendered heatmap) for handoff to storage. It performs no I/O itself.
//
// Assembly is split so that no `AnalysisResult` can exist without a stored image:
// `assemble` returns the rendered image together with a `PendingResult`, and only
// `PendingResult::finish`, given the reference storage handed back for that image,
// produces the final, immutable `AnalysisResult`.

use chrono::{DateTime, Utc};
use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::core_modules::cam::argmax;
use crate::core_modules::feature_map::Heatmap;
use crate::core_modules::metrics_extractor::Metrics;
use crate::core_modules::utils::image_helper::image_helper;
use crate::error::{AnalysisError, Result};
use crate::record::OutputRecord;

/// The persisted outcome of one completed analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub predicted_label: String,
    /// Index of the predicted class in the classifier's score vector.
    pub predicted_class: usize,
    /// Highest class score, in `[0, 1]`.
    pub confidence: f64,
    pub metrics: Metrics,
    /// Where storage put the rendered heatmap.
    pub heatmap_image_ref: String,
    pub timestamp: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn to_output_record(&self) -> OutputRecord {
        OutputRecord {
            predicted_label: self.predicted_label.clone(),
            confidence: self.confidence,
            percent_affected: self.metrics.percent_affected,
            centroid: self.metrics.centroid.into(),
            lcc_size: self.metrics.lcc_size,
            sym_lr: self.metrics.sym_lr,
            sym_tb: self.metrics.sym_tb,
            grad_cam_map_url: self.heatmap_image_ref.clone(),
        }
    }
}

/// Everything but the image reference.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingResult {
    predicted_label: String,
    predicted_class: usize,
    confidence: f64,
    metrics: Metrics,
    timestamp: DateTime<Utc>,
}

impl PendingResult {
    pub fn predicted_label(&self) -> &str {
        &self.predicted_label
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn finish(self, heatmap_image_ref: String) -> AnalysisResult {
        AnalysisResult {
            predicted_label: self.predicted_label,
            predicted_class: self.predicted_class,
            confidence: self.confidence,
            metrics: self.metrics,
            heatmap_image_ref,
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Assembly {
    pub image: RgbaImage,
    pub pending: PendingResult,
}

#[derive(Debug, Clone, Copy)]
pub struct ResultAssembler {
    render_scale: u32,
}

impl ResultAssembler {
    pub fn new(render_scale: u32) -> Self {
        Self {
            render_scale: render_scale.max(1),
        }
    }

    pub fn assemble(&self, labels: &[String], scores: &[f32], metrics: Metrics, heatmap: &Heatmap) -> Result<Assembly> {
        let predicted_class = argmax(scores)
            .ok_or_else(|| AnalysisError::ModelIncompatible("classifier produced no scores".into()))?;
        let predicted_label = labels.get(predicted_class).cloned().ok_or_else(|| {
            AnalysisError::ModelIncompatible(format!(
                "classifier has {} labels for {} scores",
                labels.len(),
                scores.len()
            ))
        })?;
        let top = scores[predicted_class] as f64;
        let confidence = if top.is_finite() { top.clamp(0.0, 1.0) } else { 0.0 };

        Ok(Assembly {
            image: image_helper::render(heatmap, self.render_scale),
            pending: PendingResult {
                predicted_label,
                predicted_class,
                confidence,
                metrics,
                timestamp: Utc::now(),
            },
        })
    }
}

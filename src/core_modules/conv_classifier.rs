// THEORY:
// `ConvClassifier` is the engine's built-in `Classifier`: a compact, fully
// described convolutional scorer loaded from a JSON artifact. It exists so the
// engine can run end to end without an external inference runtime, and it keeps
// its internals honest by exposing every layer through `LayerDescriptor`s.
//
// Architecture (input is the occupancy grid, resampled to the artifact's size):
//   0. conv         [rows, cols, C]        same-padded k x k kernels + bias, ReLU
//   1. pool         [rows/p, cols/p, C]    p x p average pooling (floor)
//   2. global_pool  [1, 1, C]              mean over all pooled positions
//   3. logits       [1, 1, K]              dense layer
// Scores are the softmax of the logits. Gradients are of the target *logit*, which
// is linear in every layer above the ReLU, so they are exact closed forms.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core_modules::classifier::{Classifier, ForwardOutput, LayerDescriptor, ModelLoader};
use crate::core_modules::feature_map::FeatureMap;
use crate::core_modules::grid_encoder::Grid;
use crate::error::{AnalysisError, Result};

pub const LAYER_CONV: usize = 0;
pub const LAYER_POOL: usize = 1;
pub const LAYER_GLOBAL_POOL: usize = 2;
pub const LAYER_LOGITS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputShape {
    pub rows: usize,
    pub cols: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvSpec {
    pub kernel_size: usize,
    /// One flattened `kernel_size x kernel_size` kernel per output channel.
    pub kernels: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseSpec {
    /// `[classes][channels]`
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

/// On-disk description of a `ConvClassifier`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub labels: Vec<String>,
    pub input: InputShape,
    pub conv: ConvSpec,
    pub pool: usize,
    pub dense: DenseSpec,
}

#[derive(Debug, Clone)]
pub struct ConvClassifier {
    artifact: ModelArtifact,
    pooled_rows: usize,
    pooled_cols: usize,
}

impl ConvClassifier {
    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self> {
        let invalid = |msg: String| Err(AnalysisError::ModelLoad(msg));
        let channels = artifact.conv.kernels.len();
        let classes = artifact.labels.len();
        let k = artifact.conv.kernel_size;

        if classes == 0 {
            return invalid("artifact declares no labels".into());
        }
        if artifact.input.rows == 0 || artifact.input.cols == 0 {
            return invalid("artifact input shape must be non-empty".into());
        }
        if k == 0 || k % 2 == 0 {
            return invalid(format!("kernel size must be odd, got {k}"));
        }
        if channels == 0 || artifact.conv.bias.len() != channels {
            return invalid(format!(
                "conv layer has {channels} kernels and {} biases",
                artifact.conv.bias.len()
            ));
        }
        if let Some(bad) = artifact.conv.kernels.iter().position(|kernel| kernel.len() != k * k) {
            return invalid(format!("kernel {bad} does not have {} weights", k * k));
        }
        if artifact.pool == 0 || artifact.pool > artifact.input.rows || artifact.pool > artifact.input.cols {
            return invalid(format!(
                "pool stride {} does not fit a {}x{} input",
                artifact.pool, artifact.input.rows, artifact.input.cols
            ));
        }
        if artifact.dense.weights.len() != classes
            || artifact.dense.bias.len() != classes
            || artifact.dense.weights.iter().any(|row| row.len() != channels)
        {
            return invalid(format!("dense layer must be {classes}x{channels} with {classes} biases"));
        }

        Ok(Self {
            pooled_rows: artifact.input.rows / artifact.pool,
            pooled_cols: artifact.input.cols / artifact.pool,
            artifact,
        })
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let artifact: ModelArtifact = serde_json::from_str(text)
            .map_err(|err| AnalysisError::ModelLoad(format!("invalid model artifact: {err}")))?;
        Self::from_artifact(artifact)
    }

    pub fn artifact(&self) -> &ModelArtifact {
        &self.artifact
    }

    fn channels(&self) -> usize {
        self.artifact.conv.kernels.len()
    }

    fn classes(&self) -> usize {
        self.artifact.labels.len()
    }

    fn descriptor(&self, index: usize) -> Option<LayerDescriptor> {
        let (rows, cols) = (self.artifact.input.rows, self.artifact.input.cols);
        let c = self.channels();
        let (name, height, width, channels) = match index {
            LAYER_CONV => ("conv", rows, cols, c),
            LAYER_POOL => ("pool", self.pooled_rows, self.pooled_cols, c),
            LAYER_GLOBAL_POOL => ("global_pool", 1, 1, c),
            LAYER_LOGITS => ("logits", 1, 1, self.classes()),
            _ => return None,
        };
        Some(LayerDescriptor {
            index,
            name: name.to_string(),
            height,
            width,
            channels,
        })
    }

    /// Nearest-neighbour resample of the grid onto the artifact's input shape.
    fn resample(&self, grid: &Grid) -> Vec<f32> {
        let (rows, cols) = (self.artifact.input.rows, self.artifact.input.cols);
        if grid.shape() == (rows, cols) {
            return grid.cells().to_vec();
        }
        let mut out = vec![0.0; rows * cols];
        if grid.rows() == 0 || grid.cols() == 0 {
            return out;
        }
        for r in 0..rows {
            let src_r = r * grid.rows() / rows;
            for c in 0..cols {
                let src_c = c * grid.cols() / cols;
                out[r * cols + c] = grid.get(src_r, src_c);
            }
        }
        out
    }

    fn convolve(&self, input: &[f32]) -> FeatureMap {
        let (rows, cols) = (self.artifact.input.rows, self.artifact.input.cols);
        let k = self.artifact.conv.kernel_size;
        let half = (k / 2) as isize;
        let mut out = FeatureMap::zeros(rows, cols, self.channels());

        for (ch, kernel) in self.artifact.conv.kernels.iter().enumerate() {
            let bias = self.artifact.conv.bias[ch];
            for r in 0..rows {
                for c in 0..cols {
                    let mut acc = bias;
                    for dy in 0..k {
                        let y = r as isize + dy as isize - half;
                        if y < 0 || y >= rows as isize {
                            continue;
                        }
                        for dx in 0..k {
                            let x = c as isize + dx as isize - half;
                            if x < 0 || x >= cols as isize {
                                continue;
                            }
                            acc += kernel[dy * k + dx] * input[y as usize * cols + x as usize];
                        }
                    }
                    out.set(r, c, ch, acc.max(0.0));
                }
            }
        }
        out
    }

    fn average_pool(&self, conv: &FeatureMap) -> FeatureMap {
        let p = self.artifact.pool;
        let area = (p * p) as f32;
        let mut out = FeatureMap::zeros(self.pooled_rows, self.pooled_cols, self.channels());
        for pr in 0..self.pooled_rows {
            for pc in 0..self.pooled_cols {
                for ch in 0..self.channels() {
                    let mut sum = 0.0;
                    for r in pr * p..(pr + 1) * p {
                        for c in pc * p..(pc + 1) * p {
                            sum += conv.get(r, c, ch);
                        }
                    }
                    out.set(pr, pc, ch, sum / area);
                }
            }
        }
        out
    }

    fn global_pool(&self, pooled: &FeatureMap) -> FeatureMap {
        let positions = (pooled.height() * pooled.width()) as f32;
        let mut out = FeatureMap::zeros(1, 1, self.channels());
        for ch in 0..self.channels() {
            let mut sum = 0.0;
            for r in 0..pooled.height() {
                for c in 0..pooled.width() {
                    sum += pooled.get(r, c, ch);
                }
            }
            out.set(0, 0, ch, sum / positions);
        }
        out
    }

    fn dense(&self, features: &FeatureMap) -> FeatureMap {
        let mut out = FeatureMap::zeros(1, 1, self.classes());
        for (class, row) in self.artifact.dense.weights.iter().enumerate() {
            let logit = row
                .iter()
                .enumerate()
                .map(|(ch, w)| w * features.get(0, 0, ch))
                .sum::<f32>()
                + self.artifact.dense.bias[class];
            out.set(0, 0, class, logit);
        }
        out
    }

    /// Gradient of the `target` logit with respect to layer `layer`'s activations.
    fn logit_gradient(&self, layer: usize, target: usize) -> FeatureMap {
        let weights = &self.artifact.dense.weights[target];
        let positions = (self.pooled_rows * self.pooled_cols) as f32;
        match layer {
            LAYER_CONV => {
                let p = self.artifact.pool;
                let (rows, cols) = (self.artifact.input.rows, self.artifact.input.cols);
                let scale = positions * (p * p) as f32;
                let mut grad = FeatureMap::zeros(rows, cols, self.channels());
                // Cells past the last whole pooling window never reach the logits.
                for r in 0..self.pooled_rows * p {
                    for c in 0..self.pooled_cols * p {
                        for (ch, w) in weights.iter().enumerate() {
                            grad.set(r, c, ch, w / scale);
                        }
                    }
                }
                grad
            }
            LAYER_POOL => {
                let mut grad = FeatureMap::zeros(self.pooled_rows, self.pooled_cols, self.channels());
                for r in 0..self.pooled_rows {
                    for c in 0..self.pooled_cols {
                        for (ch, w) in weights.iter().enumerate() {
                            grad.set(r, c, ch, w / positions);
                        }
                    }
                }
                grad
            }
            LAYER_GLOBAL_POOL => {
                let mut grad = FeatureMap::zeros(1, 1, self.channels());
                for (ch, w) in weights.iter().enumerate() {
                    grad.set(0, 0, ch, *w);
                }
                grad
            }
            _ => {
                let mut grad = FeatureMap::zeros(1, 1, self.classes());
                grad.set(0, 0, target, 1.0);
                grad
            }
        }
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

impl Classifier for ConvClassifier {
    fn labels(&self) -> &[String] {
        &self.artifact.labels
    }

    fn layers(&self) -> Vec<LayerDescriptor> {
        (LAYER_CONV..=LAYER_LOGITS).filter_map(|i| self.descriptor(i)).collect()
    }

    async fn forward(&self, grid: &Grid, layer: usize) -> Result<ForwardOutput> {
        if self.descriptor(layer).is_none() {
            return Err(AnalysisError::ModelIncompatible(format!("model has no layer {layer}")));
        }
        let input = self.resample(grid);
        let conv = self.convolve(&input);
        let pooled = self.average_pool(&conv);
        let global = self.global_pool(&pooled);
        let logits = self.dense(&global);
        let scores = softmax(logits.data());

        let activations = match layer {
            LAYER_CONV => conv,
            LAYER_POOL => pooled,
            LAYER_GLOBAL_POOL => global,
            _ => logits,
        };
        Ok(ForwardOutput {
            layer,
            activations,
            scores,
        })
    }

    async fn gradient(&self, forward: &ForwardOutput, target_class: usize) -> Result<FeatureMap> {
        if target_class >= self.classes() {
            return Err(AnalysisError::ModelIncompatible(format!(
                "target class {target_class} is outside {} classes",
                self.classes()
            )));
        }
        let descriptor = self.descriptor(forward.layer).ok_or_else(|| {
            AnalysisError::ModelIncompatible(format!("model has no layer {}", forward.layer))
        })?;
        let expected = (descriptor.height, descriptor.width, descriptor.channels);
        if forward.activations.shape() != expected {
            return Err(AnalysisError::ModelIncompatible(format!(
                "activations {:?} do not belong to layer {} {:?}",
                forward.activations.shape(),
                descriptor.name,
                expected
            )));
        }
        Ok(self.logit_gradient(forward.layer, target_class))
    }
}

/// Loads a `ConvClassifier` from a JSON artifact on disk.
#[derive(Debug, Clone)]
pub struct ArtifactLoader {
    path: PathBuf,
}

impl ArtifactLoader {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ModelLoader for ArtifactLoader {
    type Model = ConvClassifier;

    async fn load(&self) -> Result<ConvClassifier> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|err| {
            AnalysisError::ModelLoad(format!("cannot read {}: {err}", self.path.display()))
        })?;
        let model = ConvClassifier::from_json(&text)?;
        log::info!(
            "loaded classifier from {} ({} classes)",
            self.path.display(),
            model.classes()
        );
        Ok(model)
    }
}

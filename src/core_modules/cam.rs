// THEORY:
// The `CamComputer` turns a classifier's internals into a raw, class-discriminative
// spatial map (Grad-CAM). It runs in two steps so that a caller can observe the
// boundary between inference and attribution:
//
// 1.  `infer`: pick the feature layer, forward-pass the grid and keep the layer's
//     activations `A` together with the output scores.
// 2.  `attribute`: ask the classifier for `G = d score[target] / d A`, pool `G`
//     spatially per channel into weights, and combine
//     `raw[h, w] = max(0, sum_c weight[c] * A[h, w, c])`.
//
// Ownership: `A` lives inside `Inference` and `G` is created inside `attribute`.
// Both are registered with the request's `RuntimeContext` and `attribute` consumes
// the `Inference`, so both buffers are released before it returns, whatever the
// outcome. Zero gradients are not an error; they yield an all-zero raw map.

use crate::core_modules::classifier::{Classifier, ForwardOutput, LayerDescriptor};
use crate::core_modules::feature_map::{FeatureMap, RawMap};
use crate::core_modules::grid_encoder::Grid;
use crate::core_modules::runtime::{MemoryTicket, RuntimeContext};
use crate::error::{AnalysisError, Result, TensorError};
use crate::log_debug;

const ENABLE_LOGS: bool = true;

/// Activations and scores of one forward pass, owned until attribution.
#[derive(Debug)]
pub struct Inference {
    layer: LayerDescriptor,
    activations: FeatureMap,
    scores: Vec<f32>,
    _ticket: MemoryTicket,
}

impl Inference {
    pub fn layer(&self) -> &LayerDescriptor {
        &self.layer
    }

    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    /// Index of the highest score, first one on ties.
    pub fn predicted_class(&self) -> Option<usize> {
        argmax(&self.scores)
    }
}

/// The raw map plus the scores it was computed from.
#[derive(Debug, Clone)]
pub struct CamOutput {
    pub raw: RawMap,
    pub scores: Vec<f32>,
    pub layer: LayerDescriptor,
    pub target_class: usize,
}

pub struct CamComputer<'r> {
    runtime: &'r RuntimeContext,
    pinned_layer: Option<usize>,
}

impl<'r> CamComputer<'r> {
    pub fn new(runtime: &'r RuntimeContext) -> Self {
        Self {
            runtime,
            pinned_layer: None,
        }
    }

    /// Use a specific layer instead of the last spatial one.
    pub fn with_layer(mut self, layer: Option<usize>) -> Self {
        self.pinned_layer = layer;
        self
    }

    /// The pinned layer if set, otherwise the deepest layer with spatial extent.
    pub fn select_layer<C: Classifier>(&self, classifier: &C) -> Result<LayerDescriptor> {
        let layers = classifier.layers();
        match self.pinned_layer {
            Some(index) => {
                let layer = layers.into_iter().find(|l| l.index == index).ok_or_else(|| {
                    AnalysisError::ModelIncompatible(format!("configured feature layer {index} does not exist"))
                })?;
                if !layer.has_spatial_extent() {
                    return Err(AnalysisError::ModelIncompatible(format!(
                        "configured feature layer {} ({}) is {}x{}",
                        layer.index, layer.name, layer.height, layer.width
                    )));
                }
                Ok(layer)
            }
            None => layers
                .into_iter()
                .filter(LayerDescriptor::has_spatial_extent)
                .max_by_key(|l| l.index)
                .ok_or_else(|| {
                    AnalysisError::ModelIncompatible("no feature layer with spatial extent greater than 1x1".into())
                }),
        }
    }

    pub async fn infer<C: Classifier>(&self, classifier: &C, grid: &Grid) -> Result<Inference> {
        let layer = self.select_layer(classifier)?;
        let forward = classifier.forward(grid, layer.index).await?;
        let ticket = self.runtime.track(&forward.activations);

        let (h, w, _) = forward.activations.shape();
        if h * w <= 1 {
            return Err(AnalysisError::ModelIncompatible(format!(
                "layer {} produced a {h}x{w} activation map",
                layer.name
            )));
        }
        if forward.scores.is_empty() {
            return Err(AnalysisError::ModelIncompatible("classifier produced no scores".into()));
        }
        log_debug!(
            "[{}] forward through layer {} -> activations {:?}, {} scores",
            self.runtime.label(),
            layer.name,
            forward.activations.shape(),
            forward.scores.len()
        );

        Ok(Inference {
            layer,
            activations: forward.activations,
            scores: forward.scores,
            _ticket: ticket,
        })
    }

    pub async fn attribute<C: Classifier>(
        &self,
        classifier: &C,
        inference: Inference,
        target_class: usize,
    ) -> Result<CamOutput> {
        if target_class >= inference.scores.len() {
            return Err(AnalysisError::ModelIncompatible(format!(
                "target class {target_class} is outside {} scores",
                inference.scores.len()
            )));
        }

        let Inference {
            layer,
            activations,
            scores,
            _ticket: activation_ticket,
        } = inference;
        let forward = ForwardOutput {
            layer: layer.index,
            activations,
            scores,
        };

        let gradients = classifier.gradient(&forward, target_class).await?;
        let gradient_ticket = self.runtime.track(&gradients);
        let raw = grad_cam(&forward.activations, &gradients)?;

        drop(gradients);
        drop(gradient_ticket);
        let scores = forward.scores;
        drop(forward.activations);
        drop(activation_ticket);

        log_debug!(
            "[{}] grad-cam for class {} on {}x{} map, {} bytes still live",
            self.runtime.label(),
            target_class,
            raw.rows(),
            raw.cols(),
            self.runtime.ledger().live_bytes()
        );

        Ok(CamOutput {
            raw,
            scores,
            layer,
            target_class,
        })
    }

    /// `infer` then `attribute`, targeting `target_class` or the predicted class.
    pub async fn compute<C: Classifier>(
        &self,
        classifier: &C,
        grid: &Grid,
        target_class: Option<usize>,
    ) -> Result<CamOutput> {
        let inference = self.infer(classifier, grid).await?;
        let target = match target_class {
            Some(target) => target,
            None => inference
                .predicted_class()
                .ok_or_else(|| AnalysisError::ModelIncompatible("classifier produced no scores".into()))?,
        };
        self.attribute(classifier, inference, target).await
    }
}

/// Gradient-weighted combination of activation channels, rectified at zero.
pub fn grad_cam(activations: &FeatureMap, gradients: &FeatureMap) -> std::result::Result<RawMap, TensorError> {
    activations.ensure_same_shape(gradients)?;
    let (height, width, channels) = activations.shape();
    let spatial = height * width;

    let mut weights = vec![0.0f32; channels];
    if spatial > 0 {
        for row in 0..height {
            for col in 0..width {
                for (channel, weight) in weights.iter_mut().enumerate() {
                    *weight += gradients.get(row, col, channel);
                }
            }
        }
        for weight in weights.iter_mut() {
            *weight /= spatial as f32;
        }
    }

    let mut raw = vec![0.0f32; spatial];
    for row in 0..height {
        for col in 0..width {
            let value: f32 = weights
                .iter()
                .enumerate()
                .map(|(channel, weight)| weight * activations.get(row, col, channel))
                .sum();
            raw[row * width + col] = value.max(0.0);
        }
    }
    RawMap::new(height, width, raw)
}

pub(crate) fn argmax(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &score) in scores.iter().enumerate() {
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((index, score)),
        }
    }
    best.map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::conv_classifier::tests::test_artifact;
    use crate::core_modules::conv_classifier::{ConvClassifier, LAYER_CONV, LAYER_GLOBAL_POOL};

    #[test]
    fn grad_cam_weights_channels_by_mean_gradient() {
        // 1x2 map with two channels, HWC order.
        let activations = FeatureMap::new(1, 2, 2, vec![1.0, 0.5, 1.0, 2.0]).unwrap();
        let gradients = FeatureMap::new(1, 2, 2, vec![1.0, 0.0, 1.0, 0.4]).unwrap();
        // weights = [1.0, 0.2]
        let raw = grad_cam(&activations, &gradients).unwrap();
        assert!((raw.get(0, 0) - 1.1).abs() < 1e-6);
        assert!((raw.get(0, 1) - 1.4).abs() < 1e-6);
    }

    #[test]
    fn grad_cam_rectifies_negative_evidence() {
        let activations = FeatureMap::new(1, 2, 1, vec![1.0, 3.0]).unwrap();
        let gradients = FeatureMap::new(1, 2, 1, vec![-1.0, -1.0]).unwrap();
        let raw = grad_cam(&activations, &gradients).unwrap();
        assert_eq!(raw.data(), &[0.0, 0.0]);
    }

    #[test]
    fn zero_gradients_give_zero_map() {
        let activations = FeatureMap::new(2, 2, 1, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let gradients = FeatureMap::zeros(2, 2, 1);
        let raw = grad_cam(&activations, &gradients).unwrap();
        assert!(raw.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn grad_cam_rejects_mismatched_shapes() {
        let activations = FeatureMap::zeros(2, 2, 1);
        let gradients = FeatureMap::zeros(2, 2, 2);
        assert!(grad_cam(&activations, &gradients).is_err());
    }

    #[test]
    fn argmax_prefers_first_of_ties() {
        assert_eq!(argmax(&[0.2, 0.4, 0.4]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn picks_deepest_spatial_layer_unless_pinned() {
        let runtime = RuntimeContext::default();
        let model = ConvClassifier::from_artifact(test_artifact(8, 8, 2)).unwrap();
        let cam = CamComputer::new(&runtime);
        assert_eq!(cam.select_layer(&model).unwrap().name, "pool");

        let pinned = CamComputer::new(&runtime).with_layer(Some(LAYER_CONV));
        assert_eq!(pinned.select_layer(&model).unwrap().name, "conv");

        let flat = CamComputer::new(&runtime).with_layer(Some(LAYER_GLOBAL_POOL));
        assert!(matches!(flat.select_layer(&model), Err(AnalysisError::ModelIncompatible(_))));
    }

    #[tokio::test]
    async fn pinned_single_cell_layer_is_incompatible() {
        // A 2x2 input pooled by 2 leaves a single spatial position.
        let runtime = RuntimeContext::default();
        let model = ConvClassifier::from_artifact(test_artifact(2, 2, 2)).unwrap();
        assert_eq!(CamComputer::new(&runtime).select_layer(&model).unwrap().name, "conv");

        let pinned = CamComputer::new(&runtime).with_layer(Some(1));
        let err = pinned.compute(&model, &Grid::zeros(2, 2), None).await.unwrap_err();
        assert!(matches!(err, AnalysisError::ModelIncompatible(_)));
        assert_eq!(runtime.ledger().live_bytes(), 0);
    }

    #[tokio::test]
    async fn buffers_are_released_after_attribution() {
        let runtime = RuntimeContext::default();
        let model = ConvClassifier::from_artifact(test_artifact(8, 8, 2)).unwrap();
        let cam = CamComputer::new(&runtime);

        let inference = cam.infer(&model, &Grid::zeros(8, 8)).await.unwrap();
        assert!(runtime.ledger().live_bytes() > 0);
        let target = inference.predicted_class().unwrap();
        let output = cam.attribute(&model, inference, target).await.unwrap();

        assert_eq!(runtime.ledger().live_bytes(), 0);
        assert_eq!(runtime.ledger().allocations(), 2);
        assert_eq!((output.raw.rows(), output.raw.cols()), (4, 4));
        assert_eq!(output.target_class, 1);
    }

    #[tokio::test]
    async fn empty_region_drives_defect_map() {
        let runtime = RuntimeContext::default();
        let model = ConvClassifier::from_artifact(test_artifact(4, 4, 2)).unwrap();
        // Left half seen, right half empty.
        let mut cells = vec![0.0; 16];
        for row in 0..4 {
            cells[row * 4] = 1.0;
            cells[row * 4 + 1] = 1.0;
        }
        let grid = Grid::from_cells(4, 4, cells).unwrap();
        let output = CamComputer::new(&runtime).compute(&model, &grid, Some(1)).await.unwrap();
        assert!(output.raw.get(0, 1) > output.raw.get(0, 0));
        assert!(output.raw.data().iter().all(|&v| v >= 0.0));
    }

    struct FlatModel;

    impl Classifier for FlatModel {
        fn labels(&self) -> &[String] {
            &[]
        }

        fn layers(&self) -> Vec<LayerDescriptor> {
            vec![LayerDescriptor {
                index: 0,
                name: "dense".into(),
                height: 1,
                width: 1,
                channels: 4,
            }]
        }

        async fn forward(&self, _grid: &Grid, layer: usize) -> Result<ForwardOutput> {
            Ok(ForwardOutput {
                layer,
                activations: FeatureMap::zeros(1, 1, 4),
                scores: vec![1.0],
            })
        }

        async fn gradient(&self, _forward: &ForwardOutput, _target_class: usize) -> Result<FeatureMap> {
            Ok(FeatureMap::zeros(1, 1, 4))
        }
    }

    #[tokio::test]
    async fn classifier_without_spatial_layers_is_incompatible() {
        let runtime = RuntimeContext::default();
        let err = CamComputer::new(&runtime)
            .compute(&FlatModel, &Grid::zeros(3, 3), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::ModelIncompatible(_)));
        assert_eq!(runtime.ledger().live_bytes(), 0);
    }
}

// THEORY:
// The classifier is an external collaborator. The engine only needs four things
// from it, and this module names exactly those:
//
// 1.  `layers()`: an enumerated list of `LayerDescriptor`s. Whether a layer is
//     usable for activation mapping is a property of the descriptor
//     (`has_spatial_extent`), not something inferred from type names.
// 2.  `labels()`: the human-readable class names, indexed like the score vector.
// 3.  `forward()`: one inference pass that returns the requested layer's
//     activations together with the output scores.
// 4.  `gradient()`: the gradient of one class score with respect to the activations
//     of a specific forward pass. The pass is handed back explicitly, so there is no
//     hidden "last call" state and a shared classifier stays read-only.
//
// Loading is separated out behind `ModelLoader`, and `ClassifierCache` ensures a
// model is loaded at most once per process and shared read-only after that.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::core_modules::feature_map::FeatureMap;
use crate::core_modules::grid_encoder::Grid;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    pub index: usize,
    pub name: String,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl LayerDescriptor {
    /// True when the layer keeps more than a single spatial position.
    pub fn has_spatial_extent(&self) -> bool {
        self.height * self.width > 1
    }
}

/// Activations of one layer plus the output scores for one input grid.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    pub layer: usize,
    pub activations: FeatureMap,
    pub scores: Vec<f32>,
}

pub trait Classifier: Send + Sync {
    fn labels(&self) -> &[String];

    fn layers(&self) -> Vec<LayerDescriptor>;

    fn forward(&self, grid: &Grid, layer: usize) -> impl Future<Output = Result<ForwardOutput>> + Send;

    /// Gradient of `target_class`'s score with respect to `forward.activations`.
    fn gradient(
        &self,
        forward: &ForwardOutput,
        target_class: usize,
    ) -> impl Future<Output = Result<FeatureMap>> + Send;
}

pub trait ModelLoader: Send + Sync {
    type Model: Classifier;

    fn load(&self) -> impl Future<Output = Result<Self::Model>> + Send;
}

/// Process-wide, load-once holder for a classifier.
///
/// A load that fails or whose future is dropped leaves the cache empty, so nothing
/// half-initialized is ever handed out and a later call may retry.
pub struct ClassifierCache<L: ModelLoader> {
    loader: L,
    cell: OnceCell<Arc<L::Model>>,
}

impl<L: ModelLoader> ClassifierCache<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            cell: OnceCell::new(),
        }
    }

    /// Wraps an already-loaded model.
    pub fn preloaded(loader: L, model: L::Model) -> Self {
        Self {
            loader,
            cell: OnceCell::new_with(Some(Arc::new(model))),
        }
    }

    pub async fn get(&self) -> Result<Arc<L::Model>> {
        let model = self
            .cell
            .get_or_try_init(|| async {
                log::info!("loading classifier");
                self.loader.load().await.map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(model))
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AnalysisError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Dummy {
        labels: Vec<String>,
    }

    impl Classifier for Dummy {
        fn labels(&self) -> &[String] {
            &self.labels
        }

        fn layers(&self) -> Vec<LayerDescriptor> {
            Vec::new()
        }

        async fn forward(&self, _grid: &Grid, layer: usize) -> Result<ForwardOutput> {
            Ok(ForwardOutput {
                layer,
                activations: FeatureMap::zeros(1, 1, 1),
                scores: vec![1.0],
            })
        }

        async fn gradient(&self, forward: &ForwardOutput, _target_class: usize) -> Result<FeatureMap> {
            let (h, w, c) = forward.activations.shape();
            Ok(FeatureMap::zeros(h, w, c))
        }
    }

    struct CountingLoader {
        calls: AtomicUsize,
        fail_first: bool,
    }

    impl ModelLoader for CountingLoader {
        type Model = Dummy;

        async fn load(&self) -> Result<Dummy> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Err(AnalysisError::ModelLoad("artifact unreachable".into()));
            }
            Ok(Dummy {
                labels: vec!["normal".into()],
            })
        }
    }

    #[test]
    fn spatial_extent_requires_more_than_one_cell() {
        let mut layer = LayerDescriptor {
            index: 0,
            name: "pool".into(),
            height: 1,
            width: 1,
            channels: 8,
        };
        assert!(!layer.has_spatial_extent());
        layer.width = 2;
        assert!(layer.has_spatial_extent());
    }

    #[tokio::test]
    async fn cache_loads_once_and_shares() {
        let cache = ClassifierCache::new(CountingLoader {
            calls: AtomicUsize::new(0),
            fail_first: false,
        });
        let a = cache.get().await.unwrap();
        let b = cache.get().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_load_leaves_cache_empty() {
        let cache = ClassifierCache::new(CountingLoader {
            calls: AtomicUsize::new(0),
            fail_first: true,
        });
        let err = cache.get().await.unwrap_err();
        assert!(matches!(err, AnalysisError::ModelLoad(_)));
        assert!(!cache.is_loaded());
        assert!(cache.get().await.is_ok());
        assert!(cache.is_loaded());
    }
}

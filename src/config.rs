use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::core_modules::metrics_extractor::DEFAULT_THRESHOLD;

/// Configuration for the analysis pipeline, allowing for tunable behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Cells strictly above this heatmap value count as affected.
    pub threshold: f32,
    /// Forces Grad-CAM onto a specific classifier layer. `None` picks the deepest
    /// layer with spatial extent.
    pub feature_layer: Option<usize>,
    /// Output pixels per heatmap cell along each axis when rendering.
    pub render_scale: u32,
    /// Upper bound on requests analysed at the same time by a batch run.
    pub max_concurrent_requests: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            feature_layer: None,
            render_scale: 8,
            max_concurrent_requests: num_cpus::get(),
        }
    }
}

impl PipelineConfig {
    /// Reads a JSON config file; fields it leaves out keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline config from {}", path.display()))?;
        let config: PipelineConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse pipeline config in {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when given, otherwise the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.threshold.is_finite() && (0.0..=1.0).contains(&self.threshold),
            "threshold must lie in [0, 1], got {}",
            self.threshold
        );
        anyhow::ensure!(self.render_scale > 0, "render_scale must be positive");
        anyhow::ensure!(
            self.max_concurrent_requests > 0,
            "max_concurrent_requests must be positive"
        );
        Ok(())
    }
}

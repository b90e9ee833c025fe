// THEORY:
// Wire shapes at the edges of the engine. `ScanRecord` is what the upstream capture
// layer persisted for one scan (camelCase JSON), and `OutputRecord` is the flat
// snake_case document handed to storage once an analysis completes. Neither type
// carries behavior beyond validation helpers; the engine converts them into its own
// strongly typed values (`Grid`, `AnalysisResult`) at the boundary.

use serde::{Deserialize, Serialize};

/// A single pointer sample in screen pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailPoint {
    pub x: f64,
    pub y: f64,
}

impl TrailPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// An ordered sequence of pointer samples recorded while the stimulus moved.
pub type Trail = Vec<TrailPoint>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenDimensions {
    pub width: f64,
    pub height: f64,
}

/// Per-scan capture settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSettings {
    /// Edge length of one grid cell in screen pixels.
    pub cell_size: Option<f64>,
    /// Box-blur radius (in cells) applied to the occupancy grid. Zero keeps it binary.
    #[serde(default)]
    pub smoothing_radius: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    #[serde(default)]
    pub trails: Vec<Trail>,
    #[serde(default)]
    pub screen_dimensions: Option<ScreenDimensions>,
    #[serde(default)]
    pub settings: ScanSettings,
}

impl ScanRecord {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CentroidRecord {
    pub x: f64,
    pub y: f64,
}

/// The persisted, flat form of an `AnalysisResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub predicted_label: String,
    pub confidence: f64,
    pub percent_affected: f64,
    pub centroid: CentroidRecord,
    pub lcc_size: usize,
    pub sym_lr: f64,
    pub sym_tb: f64,
    pub grad_cam_map_url: String,
}

// THEORY:
// Storage is a collaborator the engine produces into; it never reads back. Two
// operations are needed: put a rendered heatmap somewhere and get a reference to
// it, then record the finished result under its scan id. A later run for the same
// scan supersedes the earlier result.
//
// `FsStorage` writes PNG files and pretty JSON output records under a root folder.
// `MemoryStorage` keeps everything in process and is what tests and embedders
// without a disk use.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use image::RgbaImage;
use tokio::sync::Mutex;

use crate::core_modules::result_assembler::AnalysisResult;
use crate::core_modules::utils::image_helper::image_helper;
use crate::error::{AnalysisError, Result};

pub trait Storage: Send + Sync {
    /// Persists the image and returns a URL that refers to it.
    fn save_heatmap_image(&self, image: &RgbaImage) -> impl Future<Output = Result<String>> + Send;

    fn save_analysis_result(&self, scan_id: &str, result: &AnalysisResult) -> impl Future<Output = Result<()>> + Send;
}

/// Writes `heatmaps/*.png` and `results/<scan_id>.json` below a root directory.
#[derive(Debug)]
pub struct FsStorage {
    root: PathBuf,
    counter: AtomicU64,
}

impl FsStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn heatmap_dir(&self) -> PathBuf {
        self.root.join("heatmaps")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    pub fn result_path(&self, scan_id: &str) -> PathBuf {
        self.results_dir().join(format!("{}.json", sanitize(scan_id)))
    }
}

/// Keeps file names to `[A-Za-z0-9_-]`.
fn sanitize(scan_id: &str) -> String {
    scan_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn storage_error(action: &str, path: &Path, err: impl std::fmt::Display) -> AnalysisError {
    AnalysisError::Storage(format!("{action} {}: {err}", path.display()))
}

impl Storage for FsStorage {
    async fn save_heatmap_image(&self, image: &RgbaImage) -> Result<String> {
        let dir = self.heatmap_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| storage_error("cannot create", &dir, err))?;

        let bytes = image_helper::encode_png(image)
            .map_err(|err| AnalysisError::Storage(format!("cannot encode heatmap: {err}")))?;
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("heatmap-{}-{n}.png", chrono::Utc::now().timestamp_millis()));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|err| storage_error("cannot write", &path, err))?;

        let absolute = tokio::fs::canonicalize(&path).await.unwrap_or(path);
        log::debug!("saved heatmap to {}", absolute.display());
        Ok(format!("file://{}", absolute.display()))
    }

    async fn save_analysis_result(&self, scan_id: &str, result: &AnalysisResult) -> Result<()> {
        let dir = self.results_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| storage_error("cannot create", &dir, err))?;

        let path = self.result_path(scan_id);
        let serialized = serde_json::to_string_pretty(&result.to_output_record())
            .map_err(|err| AnalysisError::Storage(format!("cannot serialize result: {err}")))?;
        tokio::fs::write(&path, serialized)
            .await
            .map_err(|err| storage_error("cannot write", &path, err))?;
        log::debug!("saved result for scan {scan_id} to {}", path.display());
        Ok(())
    }
}

/// In-process storage. Images get `memory://heatmaps/<n>` references.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    images: Mutex<Vec<RgbaImage>>,
    results: Mutex<HashMap<String, AnalysisResult>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn image_count(&self) -> usize {
        self.images.lock().await.len()
    }

    pub async fn image(&self, index: usize) -> Option<RgbaImage> {
        self.images.lock().await.get(index).cloned()
    }

    pub async fn result(&self, scan_id: &str) -> Option<AnalysisResult> {
        self.results.lock().await.get(scan_id).cloned()
    }

    pub async fn result_count(&self) -> usize {
        self.results.lock().await.len()
    }
}

impl Storage for MemoryStorage {
    async fn save_heatmap_image(&self, image: &RgbaImage) -> Result<String> {
        let mut images = self.images.lock().await;
        images.push(image.clone());
        Ok(format!("memory://heatmaps/{}", images.len() - 1))
    }

    async fn save_analysis_result(&self, scan_id: &str, result: &AnalysisResult) -> Result<()> {
        self.results
            .lock()
            .await
            .insert(scan_id.to_string(), result.clone());
        Ok(())
    }
}

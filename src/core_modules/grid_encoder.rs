// THEORY:
// The `GridEncoder` is the first stage of the engine. It slices the recorded screen
// into square cells and marks every cell that at least one pointer sample landed in,
// producing the fixed-resolution occupancy `Grid` the classifier consumes.
//
// Key principles:
// 1.  **Deterministic shape**: `rows = floor(height / cell_size)` and
//     `cols = floor(width / cell_size)`. The shape depends only on the recorded
//     screen and the configured cell size, never on the trails.
// 2.  **Ignore, don't clamp**: samples outside `[0, width) x [0, height)` are
//     dropped. So are samples inside the screen that fall in the partial strip past
//     the last whole cell.
// 3.  **Optional smoothing**: a box blur over the occupancy grid turns the binary
//     mask into a soft float field in `[0, 1]`.
// 4.  **Stateless**: encoding has no side effects and the resulting grid is never
//     mutated afterwards.

use crate::error::{AnalysisError, Result};
use crate::record::{ScanRecord, ScanSettings, ScreenDimensions, Trail};

/// Largest grid a scan may encode to (4096 x 4096 cells).
pub const MAX_GRID_CELLS: usize = 1 << 24;

/// Fixed-resolution occupancy grid, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    rows: usize,
    cols: usize,
    cells: Vec<f32>,
}

impl Grid {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            cells: vec![0.0; rows * cols],
        }
    }

    /// Builds a grid from row-major cell values.
    pub fn from_cells(rows: usize, cols: usize, cells: Vec<f32>) -> Result<Self> {
        if rows.checked_mul(cols) != Some(cells.len()) {
            return Err(AnalysisError::Encoding(format!(
                "grid of {rows}x{cols} does not hold {} cells",
                cells.len()
            )));
        }
        Ok(Self { rows, cols, cells })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.cells[row * self.cols + col]
    }

    pub fn cells(&self) -> &[f32] {
        &self.cells
    }

    /// Number of cells with any occupancy.
    pub fn occupied_count(&self) -> usize {
        self.cells.iter().filter(|&&v| v > 0.0).count()
    }
}

/// Maps pointer trails recorded on one screen onto a cell grid.
#[derive(Debug, Clone)]
pub struct GridEncoder {
    /// Screen width in pixels.
    screen_width: f64,
    /// Screen height in pixels.
    screen_height: f64,
    /// Edge length of a single cell in pixels.
    cell_size: f64,
    /// Number of cell rows (screen_height / cell_size).
    rows: usize,
    /// Number of cell columns (screen_width / cell_size).
    cols: usize,
    smoothing_radius: usize,
}

impl GridEncoder {
    pub fn new(screen: ScreenDimensions, cell_size: f64) -> Result<Self> {
        if !(cell_size.is_finite() && cell_size > 0.0) {
            return Err(AnalysisError::Encoding(format!(
                "cell size must be a positive number, got {cell_size}"
            )));
        }
        let valid = |v: f64| v.is_finite() && v > 0.0;
        if !valid(screen.width) || !valid(screen.height) {
            return Err(AnalysisError::Encoding(format!(
                "screen dimensions must be positive, got {}x{}",
                screen.width, screen.height
            )));
        }

        let rows_f = (screen.height / cell_size).floor();
        let cols_f = (screen.width / cell_size).floor();
        if rows_f < 1.0 || cols_f < 1.0 {
            return Err(AnalysisError::Encoding(format!(
                "cell size {cell_size} leaves no whole cell on a {}x{} screen",
                screen.width, screen.height
            )));
        }
        // Bound in f64 before casting; `as usize` saturates on huge values.
        let too_large = || {
            AnalysisError::Encoding(format!(
                "cell size {cell_size} on a {}x{} screen exceeds {MAX_GRID_CELLS} cells",
                screen.width, screen.height
            ))
        };
        if !(rows_f * cols_f).is_finite() || rows_f * cols_f > MAX_GRID_CELLS as f64 {
            return Err(too_large());
        }
        let (rows, cols) = (rows_f as usize, cols_f as usize);
        match rows.checked_mul(cols) {
            Some(cells) if cells <= MAX_GRID_CELLS => {}
            _ => return Err(too_large()),
        }

        Ok(Self {
            screen_width: screen.width,
            screen_height: screen.height,
            cell_size,
            rows,
            cols,
            smoothing_radius: 0,
        })
    }

    /// Builds an encoder from the screen and settings stored with a scan.
    pub fn for_record(record: &ScanRecord) -> Result<Self> {
        let screen = record
            .screen_dimensions
            .ok_or_else(|| AnalysisError::Encoding("scan record has no screen dimensions".into()))?;
        Self::from_settings(screen, &record.settings)
    }

    pub fn from_settings(screen: ScreenDimensions, settings: &ScanSettings) -> Result<Self> {
        let cell_size = settings
            .cell_size
            .ok_or_else(|| AnalysisError::Encoding("scan settings have no cell size".into()))?;
        Ok(Self::new(screen, cell_size)?.with_smoothing(settings.smoothing_radius))
    }

    pub fn with_smoothing(mut self, radius: usize) -> Self {
        self.smoothing_radius = radius;
        self
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Encodes every trail onto a fresh grid.
    pub fn encode(&self, trails: &[Trail]) -> Grid {
        let mut grid = Grid::zeros(self.rows, self.cols);

        for point in trails.iter().flatten() {
            if !(point.x.is_finite() && point.y.is_finite()) {
                continue;
            }
            if point.x < 0.0 || point.x >= self.screen_width || point.y < 0.0 || point.y >= self.screen_height {
                continue;
            }
            let col = (point.x / self.cell_size).floor() as usize;
            let row = (point.y / self.cell_size).floor() as usize;
            if row >= self.rows || col >= self.cols {
                continue;
            }
            grid.cells[row * self.cols + col] = 1.0;
        }

        if self.smoothing_radius > 0 {
            box_blur(&grid, self.smoothing_radius)
        } else {
            grid
        }
    }
}

/// Averages each cell over a `(2r+1)^2` window clipped to the grid.
fn box_blur(grid: &Grid, radius: usize) -> Grid {
    let (rows, cols) = grid.shape();
    let mut out = Grid::zeros(rows, cols);
    for r in 0..rows {
        for c in 0..cols {
            let r_min = r.saturating_sub(radius);
            let r_max = (r + radius).min(rows - 1);
            let c_min = c.saturating_sub(radius);
            let c_max = (c + radius).min(cols - 1);
            let mut accum = 0.0f32;
            let mut count = 0usize;
            for rr in r_min..=r_max {
                for cc in c_min..=c_max {
                    accum += grid.get(rr, cc);
                    count += 1;
                }
            }
            out.cells[r * cols + c] = accum / count.max(1) as f32;
        }
    }
    out
}

// THEORY:
// The `MetricsExtractor` reduces a normalized `Heatmap` to the handful of shape
// numbers a reviewer reads next to the picture. Each metric is an independent,
// read-only pass over the same heatmap; none of them depend on another's output.
//
// 1.  **Percent affected**: share of cells strictly hotter than the threshold.
// 2.  **Centroid**: the heat-weighted center of mass in cell-index space. An empty
//     (all-zero) heatmap has no mass, so the geometric center is reported instead.
// 3.  **Largest connected component**: region growing over the thresholded mask
//     using 4-neighbours (no diagonals). Growth uses an explicit stack, so memory
//     is bounded by the grid rather than by call depth.
// 4.  **Symmetry**: each cell is compared with its mirror across the vertical
//     (left/right) or horizontal (top/bottom) axis:
//     `max(0, 1 - sum|a - b| / sum max(a, b))`, and `1` when there is no heat.
//     The middle column/row of an odd-sized map has no partner and is skipped.

use serde::{Deserialize, Serialize};

use crate::core_modules::feature_map::Heatmap;
use crate::record::CentroidRecord;

/// Cells strictly above this value count as affected.
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// A position in cell-index space: `x` is the column, `y` the row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub x: f64,
    pub y: f64,
}

impl From<Centroid> for CentroidRecord {
    fn from(c: Centroid) -> Self {
        CentroidRecord { x: c.x, y: c.y }
    }
}

/// Shape summary of one heatmap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Percentage (0-100) of cells above the threshold.
    pub percent_affected: f64,
    pub centroid: Centroid,
    /// Cell count of the largest 4-connected region above the threshold.
    pub lcc_size: usize,
    /// Left/right mirror similarity in `[0, 1]`.
    pub sym_lr: f64,
    /// Top/bottom mirror similarity in `[0, 1]`.
    pub sym_tb: f64,
}

pub mod metrics_extractor {
    use super::*;

    pub fn extract(heatmap: &Heatmap, threshold: f32) -> Metrics {
        Metrics {
            percent_affected: percent_affected(heatmap, threshold),
            centroid: centroid(heatmap),
            lcc_size: largest_connected_component(heatmap, threshold),
            sym_lr: symmetry_left_right(heatmap),
            sym_tb: symmetry_top_bottom(heatmap),
        }
    }

    pub fn percent_affected(heatmap: &Heatmap, threshold: f32) -> f64 {
        if heatmap.is_empty() {
            return 0.0;
        }
        let affected = heatmap.data().iter().filter(|&&v| v > threshold).count();
        100.0 * affected as f64 / heatmap.len() as f64
    }

    pub fn centroid(heatmap: &Heatmap) -> Centroid {
        let (rows, cols) = (heatmap.rows(), heatmap.cols());
        let mut total_heat = 0.0f64;
        let mut center_x = 0.0f64;
        let mut center_y = 0.0f64;

        for y in 0..rows {
            for x in 0..cols {
                let heat = heatmap.get(y, x) as f64;
                total_heat += heat;
                center_x += x as f64 * heat;
                center_y += y as f64 * heat;
            }
        }

        if total_heat == 0.0 {
            return Centroid {
                x: cols as f64 / 2.0,
                y: rows as f64 / 2.0,
            };
        }
        Centroid {
            x: center_x / total_heat,
            y: center_y / total_heat,
        }
    }

    /// Size of the largest 4-connected region of cells above `threshold`.
    pub fn largest_connected_component(heatmap: &Heatmap, threshold: f32) -> usize {
        let (rows, cols) = (heatmap.rows(), heatmap.cols());
        let mask: Vec<bool> = heatmap.data().iter().map(|&v| v > threshold).collect();
        // `visited` ensures no cell is counted twice.
        let mut visited = vec![false; rows * cols];
        let mut stack: Vec<(usize, usize)> = Vec::new();
        let mut largest = 0;

        for start in 0..rows * cols {
            if !mask[start] || visited[start] {
                continue;
            }
            visited[start] = true;
            stack.push((start / cols, start % cols));
            let mut size = 0;

            while let Some((y, x)) = stack.pop() {
                size += 1;

                // Check all 4 direct neighbors (not diagonals).
                for (dx, dy) in [(0i64, 1i64), (0, -1), (1, 0), (-1, 0)] {
                    let nx = x as i64 + dx;
                    let ny = y as i64 + dy;
                    if nx < 0 || ny < 0 || nx >= cols as i64 || ny >= rows as i64 {
                        continue;
                    }
                    let idx = ny as usize * cols + nx as usize;
                    if mask[idx] && !visited[idx] {
                        visited[idx] = true;
                        stack.push((ny as usize, nx as usize));
                    }
                }
            }

            largest = largest.max(size);
        }

        largest
    }

    pub fn symmetry_left_right(heatmap: &Heatmap) -> f64 {
        let (rows, cols) = (heatmap.rows(), heatmap.cols());
        let mut diff = 0.0f64;
        let mut peak = 0.0f64;
        for y in 0..rows {
            for x in 0..cols / 2 {
                let left = heatmap.get(y, x) as f64;
                let right = heatmap.get(y, cols - 1 - x) as f64;
                diff += (left - right).abs();
                peak += left.max(right);
            }
        }
        symmetry_score(diff, peak)
    }

    pub fn symmetry_top_bottom(heatmap: &Heatmap) -> f64 {
        let (rows, cols) = (heatmap.rows(), heatmap.cols());
        let mut diff = 0.0f64;
        let mut peak = 0.0f64;
        for y in 0..rows / 2 {
            for x in 0..cols {
                let top = heatmap.get(y, x) as f64;
                let bottom = heatmap.get(rows - 1 - y, x) as f64;
                diff += (top - bottom).abs();
                peak += top.max(bottom);
            }
        }
        symmetry_score(diff, peak)
    }

    fn symmetry_score(diff: f64, peak: f64) -> f64 {
        if peak == 0.0 {
            return 1.0;
        }
        (1.0 - diff / peak).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::metrics_extractor::*;
    use super::*;

    fn heatmap(rows: usize, cols: usize, data: &[f32]) -> Heatmap {
        Heatmap::new(rows, cols, data.to_vec()).unwrap()
    }

    fn block_heatmap() -> Heatmap {
        let mut data = vec![0.0; 16];
        for (r, c) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            data[r * 4 + c] = 1.0;
        }
        heatmap(4, 4, &data)
    }

    #[test]
    fn top_left_block_scenario() {
        let metrics = extract(&block_heatmap(), DEFAULT_THRESHOLD);
        assert_eq!(metrics.percent_affected, 25.0);
        assert!((metrics.centroid.x - 0.5).abs() < 1e-9);
        assert!((metrics.centroid.y - 0.5).abs() < 1e-9);
        assert_eq!(metrics.lcc_size, 4);
        assert!(metrics.sym_lr < 1.0);
        assert!(metrics.sym_tb < 1.0);
    }

    #[test]
    fn raw_block_normalizes_then_extracts() {
        use crate::core_modules::feature_map::RawMap;
        use crate::core_modules::normalizer::normalize;

        let mut data = vec![0.0; 16];
        for (r, c) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            data[r * 4 + c] = 0.5;
        }
        let raw = RawMap::new(4, 4, data).unwrap();
        let heatmap = normalize(&raw);
        assert_eq!(heatmap, block_heatmap());

        let metrics = extract(&heatmap, DEFAULT_THRESHOLD);
        assert_eq!(metrics.percent_affected, 25.0);
        assert!((metrics.centroid.x - 0.5).abs() < 1e-9);
        assert!((metrics.centroid.y - 0.5).abs() < 1e-9);
        assert_eq!(metrics.lcc_size, 4);
        assert!(metrics.sym_lr < 1.0);
        assert!(metrics.sym_tb < 1.0);
        // Every hot cell faces a cold mirror cell.
        assert_eq!(metrics.sym_lr, 0.0);
        assert_eq!(metrics.sym_tb, 0.0);
    }

    #[test]
    fn percent_affected_is_monotone_in_threshold() {
        let map = heatmap(2, 3, &[0.0, 0.1, 0.5, 0.51, 0.9, 1.0]);
        let mut previous = f64::INFINITY;
        for step in 0..=20 {
            let t = step as f32 / 20.0;
            let value = percent_affected(&map, t);
            assert!(value <= previous);
            assert!((0.0..=100.0).contains(&value));
            previous = value;
        }
        // 0.5 itself is not strictly above 0.5.
        assert!((percent_affected(&map, 0.5) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn centroid_falls_back_to_geometric_center() {
        let c = centroid(&Heatmap::zeros(3, 5));
        assert_eq!(c, Centroid { x: 2.5, y: 1.5 });
    }

    #[test]
    fn centroid_stays_within_grid() {
        let maps = [
            heatmap(1, 1, &[1.0]),
            heatmap(2, 3, &[0.0, 0.0, 1.0, 0.0, 0.0, 0.3]),
            heatmap(3, 2, &[0.2, 0.2, 0.2, 0.2, 0.2, 0.2]),
            Heatmap::zeros(2, 2),
        ];
        for map in &maps {
            let c = centroid(map);
            assert!(c.x >= 0.0 && c.x < map.cols() as f64, "{c:?}");
            assert!(c.y >= 0.0 && c.y < map.rows() as f64, "{c:?}");
        }
    }

    #[test]
    fn lcc_counts_only_four_connected_cells() {
        // Diagonal neighbours do not join components.
        let map = heatmap(3, 3, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
        assert_eq!(largest_connected_component(&map, 0.5), 1);

        let map = heatmap(3, 3, &[1.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
        assert_eq!(largest_connected_component(&map, 0.5), 3);
    }

    #[test]
    fn lcc_bounded_by_affected_count_and_zero_when_cold() {
        let map = heatmap(2, 4, &[0.9, 0.9, 0.1, 0.8, 0.2, 0.7, 0.7, 0.8]);
        for t in [0.0, 0.15, 0.5, 0.75, 0.85, 0.95] {
            let above = map.data().iter().filter(|&&v| v > t).count();
            assert!(largest_connected_component(&map, t) <= above);
        }
        assert_eq!(largest_connected_component(&map, 0.95), 0);
    }

    #[test]
    fn lcc_handles_large_single_region_without_recursion() {
        let rows = 600;
        let cols = 600;
        let map = heatmap(rows, cols, &vec![1.0; rows * cols]);
        assert_eq!(largest_connected_component(&map, 0.5), rows * cols);
    }

    #[test]
    fn mirror_symmetric_map_scores_near_one() {
        let map = heatmap(2, 5, &[0.1, 0.7, 1.0, 0.7, 0.1, 0.4, 0.0, 0.3, 0.0, 0.4]);
        assert!(symmetry_left_right(&map) >= 0.999);
    }

    #[test]
    fn row_mirrored_map_scores_near_one_top_bottom() {
        // Rows mirror exactly; columns do not.
        let map = heatmap(
            4,
            3,
            &[1.0, 0.2, 0.0, 0.5, 0.9, 0.3, 0.5, 0.9, 0.3, 1.0, 0.2, 0.0],
        );
        assert!(symmetry_top_bottom(&map) >= 0.999);
        assert!(symmetry_left_right(&map) < 0.5);
    }

    #[test]
    fn one_sided_map_scores_low() {
        let map = heatmap(2, 4, &[1.0, 0.8, 0.0, 0.0, 0.6, 1.0, 0.0, 0.0]);
        assert!(symmetry_left_right(&map) < 0.5);
        let map = heatmap(4, 2, &[1.0, 0.8, 0.6, 1.0, 0.0, 0.0, 0.0, 0.0]);
        assert!(symmetry_top_bottom(&map) < 0.5);
    }

    #[test]
    fn cold_map_is_trivially_symmetric() {
        let map = Heatmap::zeros(3, 3);
        assert_eq!(symmetry_left_right(&map), 1.0);
        assert_eq!(symmetry_top_bottom(&map), 1.0);
    }

    #[test]
    fn empty_heatmap_has_defined_metrics() {
        let metrics = extract(&Heatmap::zeros(0, 0), DEFAULT_THRESHOLD);
        assert_eq!(metrics.percent_affected, 0.0);
        assert_eq!(metrics.centroid, Centroid { x: 0.0, y: 0.0 });
        assert_eq!(metrics.lcc_size, 0);
        assert_eq!((metrics.sym_lr, metrics.sym_tb), (1.0, 1.0));
    }
}

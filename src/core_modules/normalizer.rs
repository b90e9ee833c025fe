// THEORY:
// Min-max rescaling of a raw activation map into a `Heatmap` in `[0, 1]`.
//
// A flat map (`max == min`, which includes the all-zero map produced by saturated
// gradients) normalizes to all zeros. That is the documented policy for degenerate
// input: there is no spatial evidence to show, so nothing is highlighted.

use crate::core_modules::feature_map::{Heatmap, RawMap};

pub fn normalize(raw: &RawMap) -> Heatmap {
    let values: Vec<f32> = raw
        .data()
        .iter()
        .map(|&v| if v.is_finite() { v } else { 0.0 })
        .collect();

    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &value in &values {
        min = min.min(value);
        max = max.max(value);
    }

    if values.is_empty() || max == min {
        return Heatmap::zeros(raw.rows(), raw.cols());
    }

    // f64 so that extreme f32 spans cannot overflow to infinity.
    let (min, range) = (min as f64, max as f64 - min as f64);
    let data = values
        .into_iter()
        .map(|v| ((v as f64 - min) / range).clamp(0.0, 1.0) as f32)
        .collect();
    Heatmap::from_clamped(raw.rows(), raw.cols(), data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(rows: usize, cols: usize, data: &[f32]) -> RawMap {
        RawMap::new(rows, cols, data.to_vec()).unwrap()
    }

    #[test]
    fn rescales_into_unit_interval() {
        let heatmap = normalize(&raw(1, 4, &[0.0, 2.0, 4.0, 6.0]));
        let expected = [0.0, 1.0 / 3.0, 2.0 / 3.0, 1.0];
        for (value, expected) in heatmap.data().iter().zip(expected.iter()) {
            assert!((value - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn constant_maps_become_zero() {
        for constant in [0.0, 0.7, 42.0] {
            let heatmap = normalize(&raw(3, 3, &[constant; 9]));
            assert!(heatmap.data().iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn output_is_always_within_bounds() {
        let inputs: [&[f32]; 5] = [
            &[1e-30, 2e-30, 3e-30, 4e-30],
            &[1e30, 0.0, 5.0, 3e29],
            &[-3e38, 3e38, 0.0, 1.0],
            &[0.1, 0.2, 0.30000001, 0.1],
            &[f32::NAN, 1.0, f32::INFINITY, 2.0],
        ];
        for data in inputs {
            let heatmap = normalize(&raw(2, 2, data));
            assert!(heatmap.data().iter().all(|v| (0.0..=1.0).contains(v)), "{data:?}");
        }
    }

    #[test]
    fn block_scenario_normalizes_to_ones() {
        let mut data = vec![0.0; 16];
        for (r, c) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            data[r * 4 + c] = 0.5;
        }
        let heatmap = normalize(&raw(4, 4, &data));
        assert_eq!(heatmap.get(0, 0), 1.0);
        assert_eq!(heatmap.get(1, 1), 1.0);
        assert_eq!(heatmap.get(2, 2), 0.0);
        assert_eq!(heatmap.data().iter().filter(|&&v| v == 1.0).count(), 4);
    }

    #[test]
    fn empty_map_stays_empty() {
        assert!(normalize(&raw(0, 0, &[])).is_empty());
    }
}

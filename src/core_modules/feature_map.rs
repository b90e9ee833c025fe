// THEORY:
// The `feature_map` module holds the "dumb" numeric containers the engine passes
// between stages. None of them know how they were produced or what they mean.
//
// 1.  `FeatureMap` is a dense `[height, width, channels]` tensor in row-major HWC
//     order. Activations and gradients of a classifier layer both use it.
// 2.  `RawMap` is the un-normalized, non-negative `[height, width]` output of the
//     activation-mapping step. It is transient and consumed by the normalizer.
// 3.  `Heatmap` is the only numeric artifact that survives past the pipeline. Every
//     value lies in `[0, 1]`; the constructor enforces it and nothing mutates it.

use crate::error::TensorError;

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMap {
    height: usize,
    width: usize,
    channels: usize,
    data: Vec<f32>,
}

impl FeatureMap {
    pub fn new(height: usize, width: usize, channels: usize, data: Vec<f32>) -> Result<Self, TensorError> {
        let expected = height * width * channels;
        if data.len() != expected {
            return Err(TensorError::DataLength {
                shape: (height, width, channels),
                expected,
                found: data.len(),
            });
        }
        Ok(Self {
            height,
            width,
            channels,
            data,
        })
    }

    pub fn zeros(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
            data: vec![0.0; height * width * channels],
        }
    }

    /// `(height, width, channels)`
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.height, self.width, self.channels)
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn index(&self, row: usize, col: usize, channel: usize) -> usize {
        (row * self.width + col) * self.channels + channel
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize, channel: usize) -> f32 {
        self.data[self.index(row, col, channel)]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, channel: usize, value: f32) {
        let idx = self.index(row, col, channel);
        self.data[idx] = value;
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Number of bytes held by the backing buffer.
    pub fn byte_len(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    pub fn ensure_same_shape(&self, other: &FeatureMap) -> Result<(), TensorError> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        Ok(())
    }
}

/// Un-normalized activation map, `[height, width]`, every value `>= 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMap {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl RawMap {
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self, TensorError> {
        if data.len() != rows * cols {
            return Err(TensorError::DataLength {
                shape: (rows, cols, 1),
                expected: rows * cols,
                found: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }
}

/// Normalized activation map, `[height, width]`, every value in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Heatmap {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Heatmap {
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self, TensorError> {
        if data.len() != rows * cols {
            return Err(TensorError::DataLength {
                shape: (rows, cols, 1),
                expected: rows * cols,
                found: data.len(),
            });
        }
        if let Some((index, &value)) = data
            .iter()
            .enumerate()
            .find(|(_, v)| !(0.0..=1.0).contains(*v))
        {
            return Err(TensorError::OutOfUnitRange { index, value });
        }
        Ok(Self { rows, cols, data })
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Caller guarantees `data.len() == rows * cols` and every value is finite and in `[0, 1]`.
    pub(crate) fn from_clamped(rows: usize, cols: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), rows * cols);
        Self { rows, cols, data }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_map_uses_hwc_layout() {
        let map = FeatureMap::new(2, 2, 2, (0..8).map(|v| v as f32).collect()).unwrap();
        assert_eq!(map.get(0, 0, 1), 1.0);
        assert_eq!(map.get(0, 1, 0), 2.0);
        assert_eq!(map.get(1, 0, 0), 4.0);
        assert_eq!(map.byte_len(), 32);
    }

    #[test]
    fn feature_map_rejects_wrong_length() {
        let err = FeatureMap::new(2, 2, 2, vec![0.0; 7]).unwrap_err();
        assert!(matches!(err, TensorError::DataLength { expected: 8, found: 7, .. }));
    }

    #[test]
    fn heatmap_rejects_values_outside_unit_interval() {
        assert!(Heatmap::new(1, 2, vec![0.0, 1.0]).is_ok());
        let err = Heatmap::new(1, 2, vec![0.5, 1.5]).unwrap_err();
        assert_eq!(err, TensorError::OutOfUnitRange { index: 1, value: 1.5 });
        assert!(Heatmap::new(1, 1, vec![f32::NAN]).is_err());
    }
}

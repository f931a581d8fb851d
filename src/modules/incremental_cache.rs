//! Per-block activation history for cached causal synthesis.
//!
//! Each residual block reads a window of `receptive_field` rows. The cache keeps
//! exactly those rows in a [`CircularBuffer`], so producing one new row costs a
//! single slot write instead of recomputing the whole causal prefix.

use crate::modules::ring_buffer::CircularBuffer;
use anyhow::Result;
use burn::tensor::{backend::Backend, Tensor};

/// Rolling window of `[batch, channels, 1, cols]` activation rows.
#[derive(Debug, Clone)]
pub struct IncrementalCache<B: Backend> {
    rows: CircularBuffer<Tensor<B, 4>>,
    shape: [usize; 3],
}

impl<B: Backend> IncrementalCache<B> {
    /// Allocate a zeroed cache holding `receptive_field` rows.
    pub fn new(
        batch: usize,
        channels: usize,
        receptive_field: usize,
        cols: usize,
        device: &B::Device,
    ) -> Self {
        let zero = Tensor::<B, 4>::zeros([batch, channels, 1, cols], device);
        Self {
            rows: CircularBuffer::new(receptive_field, zero),
            shape: [batch, channels, cols],
        }
    }

    /// Rows held by the cache.
    pub fn receptive_field(&self) -> usize {
        self.rows.capacity()
    }

    /// `[batch, channels, cols]` of a single cached row.
    pub fn row_shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Zero the history for a new sequence, keeping the slot storage.
    pub fn reset(&mut self) {
        self.rows.reset();
    }

    /// Record the newest activation row.
    pub fn push(&mut self, row: Tensor<B, 4>) -> Result<()> {
        let [batch, channels, rows, cols] = row.dims();
        anyhow::ensure!(
            rows == 1 && [batch, channels, cols] == self.shape,
            "cache row shape mismatch: expected [{}, {}, 1, {}], got {:?}",
            self.shape[0],
            self.shape[1],
            self.shape[2],
            row.dims()
        );
        self.rows.push(row);
        Ok(())
    }

    /// Cached rows oldest to newest as `[batch, channels, receptive_field, cols]`.
    pub fn window(&self) -> Tensor<B, 4> {
        Tensor::cat(self.rows.window(), 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn row(value: f32, device: &NdArrayDevice) -> Tensor<TestBackend, 4> {
        Tensor::from_data(TensorData::new(vec![value, -value], [1, 1, 1, 2]), device)
    }

    fn window_values(cache: &IncrementalCache<TestBackend>) -> Vec<f32> {
        cache.window().to_data().to_vec::<f32>().expect("window data")
    }

    #[test]
    fn window_returns_last_rows_in_temporal_order() {
        let device = NdArrayDevice::default();
        let mut cache = IncrementalCache::<TestBackend>::new(1, 1, 4, 2, &device);
        for value in [1.0, 2.0, 3.0, 4.0, 5.0] {
            cache.push(row(value, &device)).expect("push");
        }
        assert_eq!(cache.window().dims(), [1, 1, 4, 2]);
        assert_eq!(
            window_values(&cache),
            vec![2.0, -2.0, 3.0, -3.0, 4.0, -4.0, 5.0, -5.0]
        );
    }

    #[test]
    fn fresh_window_is_zero_padded() {
        let device = NdArrayDevice::default();
        let mut cache = IncrementalCache::<TestBackend>::new(1, 1, 3, 2, &device);
        cache.push(row(1.0, &device)).expect("push");
        assert_eq!(window_values(&cache), vec![0.0, 0.0, 0.0, 0.0, 1.0, -1.0]);
    }

    #[test]
    fn reset_clears_history() {
        let device = NdArrayDevice::default();
        let mut cache = IncrementalCache::<TestBackend>::new(1, 1, 2, 2, &device);
        cache.push(row(1.0, &device)).expect("push");
        cache.push(row(2.0, &device)).expect("push");
        cache.reset();
        assert_eq!(window_values(&cache), vec![0.0; 4]);
        assert_eq!(cache.receptive_field(), 2);
    }

    #[test]
    fn push_rejects_wrong_shape() {
        let device = NdArrayDevice::default();
        let mut cache = IncrementalCache::<TestBackend>::new(2, 1, 2, 2, &device);
        let err = cache.push(row(1.0, &device)).unwrap_err();
        assert!(err.to_string().contains("cache row shape mismatch"));
    }
}

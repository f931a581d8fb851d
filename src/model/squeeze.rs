//! Conversions between flat signals and the 2-D row/column grid.
//!
//! With squeeze factor `h`, sample `n` lands at row `n / h`, column `n % h`.
//! Rows are the autoregressive time axis of every flow.

use anyhow::{ensure, Result};
use burn::tensor::{backend::Backend, Tensor};

/// `[batch, len]` to `[batch, 1, len / h, h]`.
pub fn squeeze_signal<B: Backend>(signal: Tensor<B, 2>, h: usize) -> Result<Tensor<B, 4>> {
    let [batch, len] = signal.dims();
    check_length(len, h)?;
    Ok(signal.reshape([batch, 1, len / h, h]))
}

/// `[batch, channels, len]` to `[batch, channels, len / h, h]`.
pub fn squeeze_conditioning<B: Backend>(cond: Tensor<B, 3>, h: usize) -> Result<Tensor<B, 4>> {
    let [batch, channels, len] = cond.dims();
    check_length(len, h)?;
    Ok(cond.reshape([batch, channels, len / h, h]))
}

/// `[batch, 1, rows, h]` back to `[batch, rows * h]`.
pub fn unsqueeze_signal<B: Backend>(grid: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
    let [batch, channels, rows, cols] = grid.dims();
    ensure!(
        channels == 1,
        "expected a single-channel grid, got {channels} channels"
    );
    Ok(grid.reshape([batch, rows * cols]))
}

fn check_length(len: usize, h: usize) -> Result<()> {
    ensure!(len > 0, "signal is empty");
    ensure!(
        len % h == 0,
        "signal length {len} is not a multiple of the squeeze factor {h}"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn squeeze_is_row_major() {
        let device = NdArrayDevice::default();
        let values: Vec<f32> = (0..8).map(|v| v as f32).collect();
        let signal = Tensor::<TestBackend, 2>::from_data(TensorData::new(values.clone(), [1, 8]), &device);
        let grid = squeeze_signal(signal, 4).expect("squeeze");
        assert_eq!(grid.dims(), [1, 1, 2, 4]);
        let row1 = grid.clone().narrow(2, 1, 1).to_data().to_vec::<f32>().expect("row");
        assert_eq!(row1, vec![4.0, 5.0, 6.0, 7.0]);
        let flat = unsqueeze_signal(grid).expect("unsqueeze");
        assert_eq!(flat.to_data().to_vec::<f32>().expect("flat"), values);
    }

    #[test]
    fn squeeze_rejects_ragged_length() {
        let device = NdArrayDevice::default();
        let cond = Tensor::<TestBackend, 3>::zeros([1, 3, 10], &device);
        let err = squeeze_conditioning(cond, 4).unwrap_err();
        assert!(err.to_string().contains("not a multiple"));
    }
}

//! Row-causal 2D convolution primitives.
//!
//! Rows are the time axis. A [`CausalConv2dOp`] evaluates either the whole
//! signal at once ([`EvalMode::Parallel`], causal padding on top, trailing rows
//! trimmed) or a single output row from a caller-supplied causal window
//! ([`EvalMode::Streaming`], no row padding). Both strategies are selected per
//! call; the op itself never changes.

use crate::modules::weight_norm::ConvWeight;
use burn::tensor::{backend::Backend, module::conv2d, ops::ConvOptions, Tensor};

/// How a convolution consumes the time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// Whole signal, output has as many rows as the input.
    Parallel,
    /// Input is exactly one receptive field, output is a single row.
    Streaming,
}

/// Static shape of a causal convolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CausalConvConfig {
    /// Kernel extent along rows.
    pub kernel_rows: usize,
    /// Kernel extent along columns.
    pub kernel_cols: usize,
    /// Dilation along rows.
    pub dilation_rows: usize,
    /// Dilation along columns.
    pub dilation_cols: usize,
    /// Rows of zero history prepended in parallel mode.
    pub causal_padding: usize,
    /// Symmetric padding on the column axis.
    pub col_padding: usize,
}

impl CausalConvConfig {
    /// 1x1 projection.
    pub fn pointwise() -> Self {
        Self {
            kernel_rows: 1,
            kernel_cols: 1,
            dilation_rows: 1,
            dilation_cols: 1,
            causal_padding: 0,
            col_padding: 0,
        }
    }

    /// Column-wise kernel of `rows` taps reading only the `rows` previous rows,
    /// never the current one.
    pub fn lookback(rows: usize) -> Self {
        Self {
            kernel_rows: rows,
            kernel_cols: 1,
            dilation_rows: 1,
            dilation_cols: 1,
            causal_padding: rows,
            col_padding: 0,
        }
    }

    /// Square kernel dilated on both axes, causal on rows and "same" on columns.
    pub fn dilated(kernel_size: usize, dilation: usize) -> Self {
        let total = (kernel_size - 1) * dilation + 1;
        Self {
            kernel_rows: kernel_size,
            kernel_cols: kernel_size,
            dilation_rows: dilation,
            dilation_cols: dilation,
            causal_padding: total - 1,
            col_padding: total / 2,
        }
    }

    /// Rows an output row depends on, current row included.
    pub fn receptive_field(&self) -> usize {
        (self.kernel_rows - 1) * self.dilation_rows + 1
    }
}

/// 2D convolution over `[batch, channels, rows, cols]` without bias.
#[derive(Debug, Clone)]
pub struct CausalConv2dOp<B: Backend> {
    /// Convolution geometry.
    pub config: CausalConvConfig,
    /// Kernel `[out, in, kernel_rows, kernel_cols]`.
    pub weight: ConvWeight<B>,
}

impl<B: Backend> CausalConv2dOp<B> {
    /// Create a new causal conv op.
    pub fn new(config: CausalConvConfig, weight: ConvWeight<B>) -> Self {
        Self { config, weight }
    }

    /// Apply the convolution.
    ///
    /// Parallel mode pads `causal_padding` rows on both sides and keeps the
    /// first `rows` outputs, so output row `t` only sees input rows `<= t`.
    /// Streaming mode runs unpadded on the rows it is given.
    pub fn forward(&self, input: Tensor<B, 4>, mode: EvalMode) -> Tensor<B, 4> {
        let rows = input.dims()[2];
        let row_padding = match mode {
            EvalMode::Parallel => self.config.causal_padding,
            EvalMode::Streaming => 0,
        };
        let output = conv2d(
            input,
            self.weight.resolve(),
            None,
            ConvOptions::new(
                [1, 1],
                [row_padding, self.config.col_padding],
                [self.config.dilation_rows, self.config.dilation_cols],
                1,
            ),
        );
        match mode {
            EvalMode::Parallel if row_padding > 0 => output.narrow(2, 0, rows),
            _ => output,
        }
    }

    /// Output channels.
    pub fn out_channels(&self) -> usize {
        self.weight.dims()[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn column(values: Vec<f32>, device: &NdArrayDevice) -> Tensor<TestBackend, 4> {
        let rows = values.len();
        Tensor::from_data(TensorData::new(values, [1, 1, rows, 1]), device)
    }

    fn kernel(values: Vec<f32>, shape: [usize; 4], device: &NdArrayDevice) -> ConvWeight<TestBackend> {
        ConvWeight::Plain(Tensor::from_data(TensorData::new(values, shape), device))
    }

    #[test]
    fn parallel_conv_is_causal() {
        let device = NdArrayDevice::default();
        let config = CausalConvConfig {
            kernel_rows: 2,
            kernel_cols: 1,
            dilation_rows: 1,
            dilation_cols: 1,
            causal_padding: 1,
            col_padding: 0,
        };
        let op = CausalConv2dOp::new(config, kernel(vec![1.0, 10.0], [1, 1, 2, 1], &device));
        let output = op.forward(column(vec![1.0, 2.0, 3.0], &device), EvalMode::Parallel);
        let values = output.to_data().to_vec::<f32>().expect("output");
        assert_eq!(values, vec![10.0, 21.0, 32.0]);
    }

    #[test]
    fn streaming_window_matches_parallel_row() {
        let device = NdArrayDevice::default();
        let config = CausalConvConfig::dilated(3, 2);
        assert_eq!(config.receptive_field(), 5);
        let weights: Vec<f32> = (0..9).map(|v| v as f32 * 0.1).collect();
        let op = CausalConv2dOp::new(config, kernel(weights, [1, 1, 3, 3], &device));
        let signal: Vec<f32> = (0..7).map(|v| (v as f32).sin()).collect();
        let parallel = op
            .forward(column(signal.clone(), &device), EvalMode::Parallel)
            .to_data()
            .to_vec::<f32>()
            .expect("parallel");

        // Row 6 depends on rows 2..=6.
        let window = column(signal[2..7].to_vec(), &device);
        let streamed = op
            .forward(window, EvalMode::Streaming)
            .to_data()
            .to_vec::<f32>()
            .expect("streaming");
        assert_eq!(streamed.len(), 1);
        assert!((streamed[0] - parallel[6]).abs() < 1e-5);
    }
}

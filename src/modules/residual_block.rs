//! Gated residual block with a row-causal dilated convolution.

use crate::config::ModelConfig;
use crate::modules::streaming_conv::{CausalConv2dOp, CausalConvConfig, EvalMode};
use crate::modules::weight_norm::{ConvWeight, InitReport};
use anyhow::Result;
use burn::tensor::{
    activation::{sigmoid, tanh},
    backend::Backend,
    Tensor,
};

/// One residual unit: dilated conv, conditioning injection, `tanh * sigmoid`
/// gate, then separate residual and skip projections.
#[derive(Debug, Clone)]
pub struct GatedResidualBlock<B: Backend> {
    /// Dilation along rows and columns.
    pub dilation: usize,
    /// Gate width (each half of the dilated conv output).
    pub hidden_channels: usize,
    /// Dilated conv `res -> 2 * hidden`.
    pub initial_conv: CausalConv2dOp<B>,
    /// Conditioning projection `cdt -> 2 * hidden`.
    pub cdt_conv: CausalConv2dOp<B>,
    /// Residual projection `hidden -> res`.
    pub res_conv: CausalConv2dOp<B>,
    /// Skip projection `hidden -> skip`.
    pub skip_conv: CausalConv2dOp<B>,
}

impl<B: Backend> GatedResidualBlock<B> {
    /// Build a randomly initialized block with weight-normalized convolutions.
    pub fn new(config: &ModelConfig, dilation: usize, device: &B::Device) -> (Self, InitReport) {
        let gate = 2 * config.hidden_channels;
        let k = config.kernel_size;
        let (initial, r0) =
            ConvWeight::normalized([gate, config.res_channels, k, k], device);
        let (cdt, r1) = ConvWeight::normalized([gate, config.cdt_channels, 1, 1], device);
        let (res, r2) =
            ConvWeight::normalized([config.res_channels, config.hidden_channels, 1, 1], device);
        let (skip, r3) =
            ConvWeight::normalized([config.skip_channels, config.hidden_channels, 1, 1], device);
        let block = Self::from_weights(config, dilation, initial, cdt, res, skip);
        (block, r0.merge(r1).merge(r2).merge(r3))
    }

    /// Assemble a block from existing weights.
    pub fn from_weights(
        config: &ModelConfig,
        dilation: usize,
        initial: ConvWeight<B>,
        cdt: ConvWeight<B>,
        res: ConvWeight<B>,
        skip: ConvWeight<B>,
    ) -> Self {
        Self {
            dilation,
            hidden_channels: config.hidden_channels,
            initial_conv: CausalConv2dOp::new(
                CausalConvConfig::dilated(config.kernel_size, dilation),
                initial,
            ),
            cdt_conv: CausalConv2dOp::new(CausalConvConfig::pointwise(), cdt),
            res_conv: CausalConv2dOp::new(CausalConvConfig::pointwise(), res),
            skip_conv: CausalConv2dOp::new(CausalConvConfig::pointwise(), skip),
        }
    }

    /// Rows of history this block reads per output row.
    pub fn receptive_field(&self) -> usize {
        self.initial_conv.config.receptive_field()
    }

    /// Returns `(residual, skip)`.
    ///
    /// In parallel mode `input` and `cond` cover the same rows. In streaming mode
    /// `input` is the block's causal window and `cond` is the single current row;
    /// the identity path then only carries the window's last row.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
        cond: Tensor<B, 4>,
        mode: EvalMode,
    ) -> Result<(Tensor<B, 4>, Tensor<B, 4>)> {
        let rows = input.dims()[2];
        let x = self.initial_conv.forward(input.clone(), mode);
        let c = self.cdt_conv.forward(cond, mode);
        anyhow::ensure!(
            x.dims()[2] == c.dims()[2] && x.dims()[3] == c.dims()[3],
            "conditioning covers {:?} rows/cols but the block produced {:?} (dilation {})",
            &c.dims()[2..],
            &x.dims()[2..],
            self.dilation
        );

        let h = self.hidden_channels;
        let gated = tanh(x.clone().narrow(1, 0, h) + c.clone().narrow(1, 0, h))
            * sigmoid(x.narrow(1, h, h) + c.narrow(1, h, h));

        let identity = match mode {
            EvalMode::Parallel => input,
            EvalMode::Streaming => input.narrow(2, rows - 1, 1),
        };
        let residual = self.res_conv.forward(gated.clone(), mode) + identity;
        let skip = self.skip_conv.forward(gated, mode);
        Ok((residual, skip))
    }

    /// Collapse weight normalization; returns the number of collapsed kernels.
    pub fn collapse_weight_norm(&mut self) -> usize {
        [
            &mut self.initial_conv,
            &mut self.cdt_conv,
            &mut self.res_conv,
            &mut self.skip_conv,
        ]
        .into_iter()
        .map(|conv| conv.weight.collapse())
        .filter(|collapsed| *collapsed)
        .count()
    }

    /// Number of scalar parameters.
    pub fn num_params(&self) -> usize {
        [
            &self.initial_conv,
            &self.cdt_conv,
            &self.res_conv,
            &self.skip_conv,
        ]
        .iter()
        .map(|conv| conv.weight.num_params())
        .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn small_config() -> ModelConfig {
        ModelConfig {
            res_channels: 4,
            hidden_channels: 3,
            skip_channels: 5,
            cdt_channels: 2,
            kernel_size: 3,
            cycle_size: 2,
            n_layer: 2,
            n_flow: 1,
            squeeze: 4,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn parallel_block_preserves_shape() {
        let device = NdArrayDevice::default();
        let config = small_config();
        let (block, report) = GatedResidualBlock::<TestBackend>::new(&config, 2, &device);
        assert_eq!(report, InitReport { initialized: 4, skipped: 4 });
        let x = Tensor::random([2, 4, 6, 4], Distribution::Normal(0.0, 1.0), &device);
        let c = Tensor::random([2, 2, 6, 4], Distribution::Normal(0.0, 1.0), &device);
        let (res, skip) = block.forward(x, c, EvalMode::Parallel).expect("forward");
        assert_eq!(res.dims(), [2, 4, 6, 4]);
        assert_eq!(skip.dims(), [2, 5, 6, 4]);
    }

    #[test]
    fn streaming_block_matches_parallel_last_row() {
        let device = NdArrayDevice::default();
        let config = small_config();
        let (block, _) = GatedResidualBlock::<TestBackend>::new(&config, 2, &device);
        let rows = 7;
        let x = Tensor::<TestBackend, 4>::random([1, 4, rows, 4], Distribution::Normal(0.0, 1.0), &device);
        let c = Tensor::<TestBackend, 4>::random([1, 2, rows, 4], Distribution::Normal(0.0, 1.0), &device);
        let (res_par, skip_par) = block
            .forward(x.clone(), c.clone(), EvalMode::Parallel)
            .expect("parallel");

        let rf = block.receptive_field();
        let window = x.narrow(2, rows - rf, rf);
        let cond = c.narrow(2, rows - 1, 1);
        let (res_step, skip_step) = block
            .forward(window, cond, EvalMode::Streaming)
            .expect("streaming");

        let pairs = [
            (res_par.narrow(2, rows - 1, 1), res_step),
            (skip_par.narrow(2, rows - 1, 1), skip_step),
        ];
        for (expected, actual) in pairs {
            let expected = expected.to_data().to_vec::<f32>().expect("expected");
            let actual = actual.to_data().to_vec::<f32>().expect("actual");
            for (a, b) in actual.iter().zip(expected.iter()) {
                assert!((a - b).abs() < 1e-4, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn mismatched_conditioning_rows_error() {
        let device = NdArrayDevice::default();
        let config = small_config();
        let (block, _) = GatedResidualBlock::<TestBackend>::new(&config, 1, &device);
        let x = Tensor::zeros([1, 4, 6, 4], &device);
        let c = Tensor::zeros([1, 2, 5, 4], &device);
        assert!(block.forward(x, c, EvalMode::Parallel).is_err());
    }

    #[test]
    fn collapse_counts_kernels() {
        let device = NdArrayDevice::default();
        let config = small_config();
        let (mut block, _) = GatedResidualBlock::<TestBackend>::new(&config, 1, &device);
        let before = block.num_params();
        assert_eq!(block.collapse_weight_norm(), 4);
        assert_eq!(block.collapse_weight_norm(), 0);
        // Magnitudes: 6 + 6 + 4 + 5 output channels.
        assert_eq!(before - block.num_params(), 21);
    }
}

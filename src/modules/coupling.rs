//! Coupling network of one flow: a causal gated conv stack producing the
//! affine parameters `(mean, logvar)` of the flow's transform.
//!
//! The network is evaluated three ways:
//! - [`CouplingStack::affine_params`] runs the whole signal in parallel,
//! - [`CouplingStack::invert_naive`] inverts the flow row by row, recomputing the
//!   causal prefix each time (reference path),
//! - [`CouplingStack::invert_cached`] inverts the flow row by row with one
//!   [`IncrementalCache`] per block.

use crate::config::ModelConfig;
use crate::modules::incremental_cache::IncrementalCache;
use crate::modules::residual_block::GatedResidualBlock;
use crate::modules::streaming_conv::{CausalConv2dOp, CausalConvConfig, EvalMode};
use crate::modules::weight_norm::{ConvWeight, InitReport};
use crate::perf::{self, Metric};
use crate::state::StreamingModule;
use anyhow::{ensure, Result};
use burn::tensor::{
    activation::{relu, tanh},
    backend::Backend,
    Tensor,
};

/// Rows read by the first convolution (strictly before the current row).
pub const FIRST_CONV_ROWS: usize = 2;

/// Affine parameters of a flow, each `[batch, in_channels, rows, cols]`.
#[derive(Debug, Clone)]
pub struct AffineParams<B: Backend> {
    /// Shift.
    pub mean: Tensor<B, 4>,
    /// Log-scale, already clamped.
    pub logvar: Tensor<B, 4>,
}

/// Streaming history of one coupling stack.
#[derive(Debug, Clone)]
pub struct CouplingCache<B: Backend> {
    /// Already-inverted signal rows feeding the first convolution.
    pub input: IncrementalCache<B>,
    /// One history per residual block.
    pub blocks: Vec<IncrementalCache<B>>,
    batch: usize,
    cols: usize,
}

impl<B: Backend> CouplingCache<B> {
    /// Whether this cache was allocated for `[batch, _, _, cols]` signals.
    pub fn matches(&self, batch: usize, cols: usize) -> bool {
        self.batch == batch && self.cols == cols
    }

    /// `(batch, cols)` the cache was allocated for.
    pub fn shape(&self) -> (usize, usize) {
        (self.batch, self.cols)
    }
}

/// First conv, residual blocks with cyclic dilation, and the output head.
#[derive(Debug, Clone)]
pub struct CouplingStack<B: Backend> {
    /// `in -> res` lookback convolution.
    pub first_conv: CausalConv2dOp<B>,
    /// Residual blocks in evaluation order.
    pub blocks: Vec<GatedResidualBlock<B>>,
    /// `skip -> skip` projection after the first ReLU.
    pub head_conv: CausalConv2dOp<B>,
    /// `skip -> out` projection after the second ReLU.
    pub out_conv: CausalConv2dOp<B>,
    /// Channels of the transformed signal.
    pub in_channels: usize,
    /// Residual stream width.
    pub res_channels: usize,
    /// Upper bound on logvar.
    pub logvar_clamp: f32,
}

impl<B: Backend> CouplingStack<B> {
    /// Build a randomly initialized stack.
    pub fn new(config: &ModelConfig, device: &B::Device) -> (Self, InitReport) {
        let (first, mut report) = ConvWeight::plain(
            [config.res_channels, config.in_channels, FIRST_CONV_ROWS, 1],
            device,
        );
        let mut blocks = Vec::with_capacity(config.n_layer);
        for layer in 0..config.n_layer {
            let (block, block_report) =
                GatedResidualBlock::new(config, config.dilation(layer), device);
            report = report.merge(block_report);
            blocks.push(block);
        }
        let (head, head_report) = ConvWeight::normalized(
            [config.skip_channels, config.skip_channels, 1, 1],
            device,
        );
        let (out, out_report) = ConvWeight::normalized(
            [config.out_channels, config.skip_channels, 1, 1],
            device,
        );
        let stack = Self::from_parts(config, first, blocks, head, out);
        (stack, report.merge(head_report).merge(out_report))
    }

    /// Assemble a stack from existing weights.
    pub fn from_parts(
        config: &ModelConfig,
        first: ConvWeight<B>,
        blocks: Vec<GatedResidualBlock<B>>,
        head: ConvWeight<B>,
        out: ConvWeight<B>,
    ) -> Self {
        Self {
            first_conv: CausalConv2dOp::new(CausalConvConfig::lookback(FIRST_CONV_ROWS), first),
            blocks,
            head_conv: CausalConv2dOp::new(CausalConvConfig::pointwise(), head),
            out_conv: CausalConv2dOp::new(CausalConvConfig::pointwise(), out),
            in_channels: config.in_channels,
            res_channels: config.res_channels,
            logvar_clamp: config.logvar_clamp,
        }
    }

    /// Rows of history the stack reads per output row.
    pub fn receptive_field(&self) -> usize {
        self.blocks
            .iter()
            .map(|block| block.receptive_field() - 1)
            .sum::<usize>()
            + 1
    }

    /// Parallel evaluation over every row of `x` `[batch, in, rows, cols]` with
    /// conditioning `c` `[batch, cdt, rows, cols]`.
    pub fn affine_params(&self, x: Tensor<B, 4>, c: Tensor<B, 4>) -> Result<AffineParams<B>> {
        ensure!(
            x.dims()[2] == c.dims()[2] && x.dims()[3] == c.dims()[3],
            "signal grid {:?} and conditioning grid {:?} disagree",
            x.dims(),
            c.dims()
        );
        let mut res = tanh(self.first_conv.forward(x, EvalMode::Parallel));
        let mut skip_sum: Option<Tensor<B, 4>> = None;
        for block in &self.blocks {
            let (next, skip) = block.forward(res, c.clone(), EvalMode::Parallel)?;
            res = next;
            skip_sum = Some(match skip_sum {
                Some(sum) => sum + skip,
                None => skip,
            });
        }
        self.head(skip_sum, EvalMode::Parallel)
    }

    /// Compute one row of affine parameters from the two previous signal rows
    /// held in `cache.input` and the current conditioning row.
    pub fn step(
        &self,
        cond_row: Tensor<B, 4>,
        cache: &mut CouplingCache<B>,
    ) -> Result<AffineParams<B>> {
        let window = cache.input.window();
        let mut res = tanh(self.first_conv.forward(window, EvalMode::Streaming));
        let mut skip_sum: Option<Tensor<B, 4>> = None;
        for (block, history) in self.blocks.iter().zip(cache.blocks.iter_mut()) {
            history.push(res)?;
            let (next, skip) =
                block.forward(history.window(), cond_row.clone(), EvalMode::Streaming)?;
            res = next;
            skip_sum = Some(match skip_sum {
                Some(sum) => sum + skip,
                None => skip,
            });
        }
        self.head(skip_sum, EvalMode::Streaming)
    }

    /// Invert the flow by recomputing the causal prefix for every row.
    ///
    /// `z` is the flow output `[batch, in, rows, cols]`; returns the flow input.
    pub fn invert_naive(&self, z: Tensor<B, 4>, c: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let rows = z.dims()[2];
        let mut done: Vec<Tensor<B, 4>> = Vec::with_capacity(rows);
        for t in 0..rows {
            let z_t = z.clone().narrow(2, t, 1);
            let mut prefix = done.clone();
            prefix.push(z_t.clone());
            let params =
                self.affine_params(Tensor::cat(prefix, 2), c.clone().narrow(2, 0, t + 1))?;
            let mean = params.mean.narrow(2, t, 1);
            let logvar = params.logvar.narrow(2, t, 1);
            done.push((z_t - mean) * logvar.neg().exp());
            perf::add_count(Metric::CouplingSteps, 1);
        }
        Ok(Tensor::cat(done, 2))
    }

    /// Invert the flow row by row, reading history from `cache`.
    ///
    /// The cache is zeroed first, so it may hold a previous sequence.
    pub fn invert_cached(
        &self,
        z: Tensor<B, 4>,
        c: Tensor<B, 4>,
        cache: &mut CouplingCache<B>,
    ) -> Result<Tensor<B, 4>> {
        let [batch, _, rows, cols] = z.dims();
        ensure!(
            cache.matches(batch, cols),
            "streaming cache allocated for batch {} x {} cols, got batch {batch} x {cols} cols",
            cache.batch,
            cache.cols
        );
        ensure!(
            c.dims()[2] == rows && c.dims()[3] == cols,
            "signal grid {:?} and conditioning grid {:?} disagree",
            z.dims(),
            c.dims()
        );
        self.reset_state(cache);

        let mut outputs = Vec::with_capacity(rows);
        for t in 0..rows {
            let params = self.step(c.clone().narrow(2, t, 1), cache)?;
            let x_t = (z.clone().narrow(2, t, 1) - params.mean) * params.logvar.neg().exp();
            cache.input.push(x_t.clone())?;
            outputs.push(x_t);
            perf::add_count(Metric::CouplingSteps, 1);
        }
        Ok(Tensor::cat(outputs, 2))
    }

    /// Collapse weight normalization; returns the number of collapsed kernels.
    pub fn collapse_weight_norm(&mut self) -> usize {
        let mut collapsed = self
            .blocks
            .iter_mut()
            .map(|block| block.collapse_weight_norm())
            .sum::<usize>();
        for conv in [
            &mut self.first_conv,
            &mut self.head_conv,
            &mut self.out_conv,
        ] {
            if conv.weight.collapse() {
                collapsed += 1;
            }
        }
        collapsed
    }

    /// Number of scalar parameters.
    pub fn num_params(&self) -> usize {
        self.first_conv.weight.num_params()
            + self.blocks.iter().map(|b| b.num_params()).sum::<usize>()
            + self.head_conv.weight.num_params()
            + self.out_conv.weight.num_params()
    }

    fn head(&self, skip_sum: Option<Tensor<B, 4>>, mode: EvalMode) -> Result<AffineParams<B>> {
        let skip = skip_sum.ok_or_else(|| anyhow::anyhow!("coupling stack has no blocks"))?;
        let hidden = self.head_conv.forward(relu(skip), mode);
        let out = self.out_conv.forward(relu(hidden), mode);
        let n = self.in_channels;
        let mean = out.clone().narrow(1, 0, n);
        let logvar = out.narrow(1, n, n).clamp_max(self.logvar_clamp);
        Ok(AffineParams { mean, logvar })
    }
}

impl<B: Backend> StreamingModule<B> for CouplingStack<B> {
    type State = CouplingCache<B>;

    fn init_state(&self, batch_size: usize, cols: usize, device: &B::Device) -> Self::State {
        let input = IncrementalCache::new(batch_size, self.in_channels, FIRST_CONV_ROWS, cols, device);
        let blocks = self
            .blocks
            .iter()
            .map(|block| {
                IncrementalCache::new(
                    batch_size,
                    self.res_channels,
                    block.receptive_field(),
                    cols,
                    device,
                )
            })
            .collect();
        CouplingCache {
            input,
            blocks,
            batch: batch_size,
            cols,
        }
    }

    fn reset_state(&self, state: &mut Self::State) {
        state.input.reset();
        for history in state.blocks.iter_mut() {
            history.reset();
        }
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
            hidden_channels: 4,
            skip_channels: 4,
            cdt_channels: 3,
            kernel_size: 3,
            cycle_size: 2,
            n_layer: 3,
            n_flow: 1,
            squeeze: 4,
            ..ModelConfig::default()
        }
    }

    fn max_abs_diff(a: Tensor<TestBackend, 4>, b: Tensor<TestBackend, 4>) -> f32 {
        let a = a.to_data().to_vec::<f32>().expect("a");
        let b = b.to_data().to_vec::<f32>().expect("b");
        assert_eq!(a.len(), b.len());
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f32::max)
    }

    #[test]
    fn stack_receptive_field_matches_config() {
        let device = NdArrayDevice::default();
        let config = small_config();
        let (stack, report) = CouplingStack::<TestBackend>::new(&config, &device);
        assert_eq!(stack.receptive_field(), config.receptive_field());
        // First conv plain, 4 normalized kernels per block, 2 in the head.
        assert_eq!(report.skipped, 3 * 4 + 2);
        assert_eq!(report.initialized, 1 + 3 * 4 + 2);
    }

    #[test]
    fn affine_params_are_causal() {
        let device = NdArrayDevice::default();
        let config = small_config();
        let (stack, _) = CouplingStack::<TestBackend>::new(&config, &device);
        let x = Tensor::<TestBackend, 4>::random([1, 1, 8, 4], Distribution::Normal(0.0, 1.0), &device);
        let c = Tensor::<TestBackend, 4>::random([1, 3, 8, 4], Distribution::Normal(0.0, 1.0), &device);
        let full = stack.affine_params(x.clone(), c.clone()).expect("full");

        // Changing row 5 must leave rows 0..=5 untouched (row t only sees rows < t).
        let bumped = Tensor::cat(
            vec![
                x.clone().narrow(2, 0, 5),
                x.clone().narrow(2, 5, 1).add_scalar(3.0),
                x.narrow(2, 6, 2),
            ],
            2,
        );
        let perturbed = stack.affine_params(bumped, c).expect("perturbed");
        let diff = max_abs_diff(full.mean.narrow(2, 0, 6), perturbed.mean.narrow(2, 0, 6));
        assert!(diff < 1e-6, "future row leaked into the past: {diff}");
    }

    #[test]
    fn cached_inverse_matches_naive_inverse() {
        let device = NdArrayDevice::default();
        let config = small_config();
        let (stack, _) = CouplingStack::<TestBackend>::new(&config, &device);
        let z = Tensor::<TestBackend, 4>::random([2, 1, 10, 4], Distribution::Normal(0.0, 1.0), &device);
        let c = Tensor::<TestBackend, 4>::random([2, 3, 10, 4], Distribution::Normal(0.0, 1.0), &device);

        let naive = stack.invert_naive(z.clone(), c.clone()).expect("naive");
        let mut cache = stack.init_state(2, 4, &device);
        let cached = stack.invert_cached(z, c, &mut cache).expect("cached");
        let diff = max_abs_diff(naive, cached);
        assert!(diff < 1e-3, "naive vs cached diff {diff}");
    }

    #[test]
    fn inverse_undoes_forward_affine() {
        let device = NdArrayDevice::default();
        let config = small_config();
        let (stack, _) = CouplingStack::<TestBackend>::new(&config, &device);
        let x = Tensor::<TestBackend, 4>::random([1, 1, 6, 4], Distribution::Normal(0.0, 1.0), &device);
        let c = Tensor::<TestBackend, 4>::random([1, 3, 6, 4], Distribution::Normal(0.0, 1.0), &device);
        let params = stack.affine_params(x.clone(), c.clone()).expect("params");
        let z = params.logvar.exp() * x.clone() + params.mean;
        let mut cache = stack.init_state(1, 4, &device);
        let recovered = stack.invert_cached(z, c, &mut cache).expect("invert");
        assert!(max_abs_diff(recovered, x) < 1e-3);
    }

    #[test]
    fn cached_inverse_rejects_foreign_cache() {
        let device = NdArrayDevice::default();
        let config = small_config();
        let (stack, _) = CouplingStack::<TestBackend>::new(&config, &device);
        let mut cache = stack.init_state(1, 4, &device);
        let z = Tensor::<TestBackend, 4>::zeros([2, 1, 4, 4], &device);
        let c = Tensor::<TestBackend, 4>::zeros([2, 3, 4, 4], &device);
        let err = stack.invert_cached(z, c, &mut cache).unwrap_err();
        assert!(err.to_string().contains("streaming cache allocated"));
    }
}

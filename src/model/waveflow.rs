//! Conditional flow over squeezed waveforms.
//!
//! A [`WaveFlow`] chains `n_flow` affine coupling stacks with a row
//! permutation after each one. The forward direction maps audio to Gaussian
//! noise in a single parallel pass; synthesis inverts the chain row by row,
//! either by recomputing the causal prefix ([`WaveFlow::synthesize`]) or with
//! per-block incremental caches ([`WaveFlow::synthesize_fast`]).

use crate::config::ModelConfig;
use crate::model::squeeze::{squeeze_conditioning, squeeze_signal, unsqueeze_signal};
use crate::modules::coupling::{CouplingCache, CouplingStack};
use crate::modules::permute::{FlowPermutation, FULL_FLIP_FLOWS};
use crate::modules::weight_norm::InitReport;
use crate::perf::{self, Metric};
use crate::state::{ExecutionMode, StreamingModule};
use crate::weights::{load_state_dict, save_state_dict, stacks_from_state, stacks_to_state};
use anyhow::{ensure, Context, Result};
use burn::tensor::{backend::Backend, Distribution, Tensor};
use std::path::Path;

/// Input of the forward (density) direction.
#[derive(Debug, Clone)]
pub enum FlowInput<B: Backend> {
    /// Flat audio `[batch, len]` with conditioning `[batch, cdt, len]`.
    Waveform {
        signal: Tensor<B, 2>,
        conditioning: Tensor<B, 3>,
    },
    /// Already squeezed grids `[batch, 1, rows, h]` and `[batch, cdt, rows, h]`.
    Squeezed {
        signal: Tensor<B, 4>,
        conditioning: Tensor<B, 4>,
    },
}

/// Result of the forward direction, all `[batch, 1, rows, h]`.
#[derive(Debug, Clone)]
pub struct FlowOutput<B: Backend> {
    /// Latent after every flow and permutation.
    pub z: Tensor<B, 4>,
    /// Composed shift of all flows.
    pub mean: Tensor<B, 4>,
    /// Composed log-scale of all flows.
    pub logvar: Tensor<B, 4>,
}

/// WaveFlow model.
///
/// Cloning copies parameters and any allocated streaming caches.
#[derive(Debug, Clone)]
pub struct WaveFlow<B: Backend> {
    flows: Vec<CouplingStack<B>>,
    config: ModelConfig,
    mode: ExecutionMode,
    caches: Option<Vec<CouplingCache<B>>>,
    init_report: InitReport,
}

impl<B: Backend> WaveFlow<B> {
    /// Build a randomly initialized model.
    pub fn new(config: &ModelConfig, device: &B::Device) -> Result<Self> {
        let _span = perf::span(Metric::ModelInit);
        config.validate()?;
        let mut report = InitReport::default();
        let mut flows = Vec::with_capacity(config.n_flow);
        for _ in 0..config.n_flow {
            let (flow, flow_report) = CouplingStack::new(config, device);
            report = report.merge(flow_report);
            flows.push(flow);
        }
        if report.skipped > 0 {
            tracing::info!(
                skipped = report.skipped,
                "skipped xavier init for parameters of rank < 2"
            );
        }
        let model = Self::from_flows(config, flows, report);
        tracing::info!(
            squeeze = config.squeeze,
            receptive_field = model.receptive_field(),
            "built waveflow"
        );
        Ok(model)
    }

    /// Build a model from a SafeTensors checkpoint.
    pub fn load(config: &ModelConfig, path: impl AsRef<Path>, device: &B::Device) -> Result<Self> {
        let path = path.as_ref();
        let _span = perf::span(Metric::WeightsLoad);
        config.validate()?;
        let state = load_state_dict(path)?;
        let flows = stacks_from_state(config, &state, device)
            .with_context(|| format!("incompatible checkpoint {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            tensors = state.len(),
            receptive_field = config.receptive_field(),
            "loaded waveflow checkpoint"
        );
        Ok(Self::from_flows(config, flows, InitReport::default()))
    }

    fn from_flows(config: &ModelConfig, flows: Vec<CouplingStack<B>>, init_report: InitReport) -> Self {
        Self {
            flows,
            config: config.clone(),
            mode: ExecutionMode::Parallel,
            caches: None,
            init_report,
        }
    }

    /// Write the parameters as a SafeTensors checkpoint.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let _span = perf::span(Metric::WeightsSave);
        let state = stacks_to_state(&self.flows)?;
        save_state_dict(path, &state)
    }

    /// Model dimensions.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Coupling stacks in forward order.
    pub fn flows(&self) -> &[CouplingStack<B>] {
        &self.flows
    }

    /// Current execution mode.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Parameter initialization counts (zero for loaded checkpoints).
    pub fn init_report(&self) -> InitReport {
        self.init_report
    }

    /// Rows of history each flow reads per output row.
    pub fn receptive_field(&self) -> usize {
        self.flows
            .first()
            .map(|flow| flow.receptive_field())
            .unwrap_or_else(|| self.config.receptive_field())
    }

    /// Number of scalar parameters.
    pub fn num_params(&self) -> usize {
        self.flows.iter().map(|flow| flow.num_params()).sum()
    }

    /// Whether streaming caches are currently allocated.
    pub fn has_streaming_caches(&self) -> bool {
        self.caches.is_some()
    }

    /// Leave streaming mode and drop the incremental caches.
    pub fn enter_parallel_mode(&mut self) {
        if self.caches.take().is_some() {
            tracing::debug!("dropped streaming caches");
        }
        self.mode = ExecutionMode::Parallel;
    }

    /// Collapse every weight-normalized kernel into a plain kernel.
    ///
    /// Returns the number of collapsed kernels; a second call returns 0.
    pub fn finalize_for_inference(&mut self) -> usize {
        let collapsed = self
            .flows
            .iter_mut()
            .map(|flow| flow.collapse_weight_norm())
            .sum();
        tracing::info!(collapsed, "removed weight normalization");
        collapsed
    }

    /// Map audio to latent noise.
    pub fn forward(&self, input: FlowInput<B>) -> Result<FlowOutput<B>> {
        let _span = perf::span(Metric::FlowForward);
        let (mut x, mut c) = match input {
            FlowInput::Waveform {
                signal,
                conditioning,
            } => (
                squeeze_signal(signal, self.config.squeeze)?,
                squeeze_conditioning(conditioning, self.config.squeeze)?,
            ),
            FlowInput::Squeezed {
                signal,
                conditioning,
            } => (signal, conditioning),
        };
        self.check_grids(&x, &c)?;

        let mut global: Option<(Tensor<B, 4>, Tensor<B, 4>)> = None;
        for (index, flow) in self.flows.iter().enumerate() {
            let params = flow.affine_params(x.clone(), c.clone())?;
            let scale = params.logvar.clone().exp();
            x = scale.clone() * x + params.mean.clone();
            global = Some(match global {
                Some((mean, logvar)) => (mean * scale + params.mean, logvar + params.logvar),
                None => (params.mean, params.logvar),
            });

            let permutation = FlowPermutation::for_flow(index);
            x = permutation.apply(x);
            c = permutation.apply(c);
        }

        let (mean, logvar) = global.context("model has no flows")?;
        Ok(FlowOutput { z: x, mean, logvar })
    }

    /// Forward pass plus the negative log-likelihood objective
    /// `mean(z^2 - logvar)`.
    ///
    /// Fails in streaming mode; call [`WaveFlow::enter_parallel_mode`] first.
    pub fn loss(
        &self,
        signal: Tensor<B, 2>,
        conditioning: Tensor<B, 3>,
    ) -> Result<(FlowOutput<B>, Tensor<B, 1>)> {
        ensure!(
            self.mode == ExecutionMode::Parallel,
            "model is in streaming mode; call enter_parallel_mode() before computing the loss"
        );
        let _span = perf::span(Metric::FlowLoss);
        let samples = signal.dims().iter().product::<usize>();
        let output = self.forward(FlowInput::Waveform {
            signal,
            conditioning,
        })?;
        let loss = (output.z.clone().square() - output.logvar.clone()).mean();
        perf::add_count(Metric::ScoredSamples, samples as u64);
        Ok((output, loss))
    }

    /// Sample audio by inverting every flow with full prefix recomputation.
    ///
    /// `conditioning` is `[batch, cdt, len]`; returns `[batch, len]`.
    pub fn synthesize(&self, conditioning: Tensor<B, 3>, temperature: f32) -> Result<Tensor<B, 2>> {
        let noise = self.sample_noise(&conditioning, temperature);
        self.synthesize_from_noise(conditioning, noise)
    }

    /// [`WaveFlow::synthesize`] with caller-provided noise `[batch, len]`.
    pub fn synthesize_from_noise(
        &self,
        conditioning: Tensor<B, 3>,
        noise: Tensor<B, 2>,
    ) -> Result<Tensor<B, 2>> {
        let _span = perf::span(Metric::SynthNaive);
        let (z, c) = self.prepare_inverse(conditioning, noise)?;
        let x = invert_flows(&self.flows, z, c, |_, flow, z, c| flow.invert_naive(z, c))?;
        self.finish_synthesis(x)
    }

    /// Sample audio with cached row-by-row inversion.
    ///
    /// Switches the model to streaming mode. Caches are allocated on the first
    /// call and reused (zeroed) afterwards; a different batch size or squeeze
    /// width is rejected until [`WaveFlow::enter_parallel_mode`] drops them.
    pub fn synthesize_fast(
        &mut self,
        conditioning: Tensor<B, 3>,
        temperature: f32,
    ) -> Result<Tensor<B, 2>> {
        let noise = self.sample_noise(&conditioning, temperature);
        self.synthesize_fast_from_noise(conditioning, noise)
    }

    /// [`WaveFlow::synthesize_fast`] with caller-provided noise `[batch, len]`.
    pub fn synthesize_fast_from_noise(
        &mut self,
        conditioning: Tensor<B, 3>,
        noise: Tensor<B, 2>,
    ) -> Result<Tensor<B, 2>> {
        let _span = perf::span(Metric::SynthFast);
        let (z, c) = self.prepare_inverse(conditioning, noise)?;
        let [batch, _, _, cols] = z.dims();
        self.ensure_caches(batch, cols, &z.device())?;
        self.mode = ExecutionMode::Streaming;

        let caches = self
            .caches
            .as_mut()
            .context("streaming caches were not allocated")?;
        let x = invert_flows(&self.flows, z, c, |index, flow, z, c| {
            flow.invert_cached(z, c, &mut caches[index])
        })?;
        self.finish_synthesis(x)
    }

    fn sample_noise(&self, conditioning: &Tensor<B, 3>, temperature: f32) -> Tensor<B, 2> {
        let [batch, _, len] = conditioning.dims();
        Tensor::<B, 2>::random(
            [batch, len],
            Distribution::Normal(0.0, 1.0),
            &conditioning.device(),
        )
        .mul_scalar(temperature)
    }

    /// Squeeze noise and conditioning, then advance the conditioning through
    /// every forward permutation so the inverse can peel them off in reverse.
    fn prepare_inverse(
        &self,
        conditioning: Tensor<B, 3>,
        noise: Tensor<B, 2>,
    ) -> Result<(Tensor<B, 4>, Tensor<B, 4>)> {
        let h = self.config.squeeze;
        let z = squeeze_signal(noise, h)?;
        let c = squeeze_conditioning(conditioning, h)?;
        self.check_grids(&z, &c)?;
        let c = (0..self.flows.len()).fold(c, |c, index| FlowPermutation::for_flow(index).apply(c));
        Ok((z, c))
    }

    fn finish_synthesis(&self, x: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        let signal = unsqueeze_signal(x)?;
        perf::add_count(Metric::SynthSamples, signal.dims().iter().product::<usize>() as u64);
        Ok(signal)
    }

    fn ensure_caches(&mut self, batch: usize, cols: usize, device: &B::Device) -> Result<()> {
        if let Some(caches) = &self.caches {
            if let Some(cache) = caches.first() {
                let (cached_batch, cached_cols) = cache.shape();
                ensure!(
                    cache.matches(batch, cols),
                    "streaming caches hold batch {cached_batch} x {cached_cols} cols but the \
                     input is batch {batch} x {cols} cols; call enter_parallel_mode() to drop them"
                );
            }
            tracing::debug!(batch, cols, "reusing streaming caches");
            return Ok(());
        }
        let caches = self
            .flows
            .iter()
            .map(|flow| flow.init_state(batch, cols, device))
            .collect();
        tracing::debug!(batch, cols, flows = self.flows.len(), "allocated streaming caches");
        self.caches = Some(caches);
        Ok(())
    }

    fn check_grids(&self, x: &Tensor<B, 4>, c: &Tensor<B, 4>) -> Result<()> {
        let [batch, channels, rows, cols] = x.dims();
        let [c_batch, c_channels, c_rows, c_cols] = c.dims();
        ensure!(
            channels == self.config.in_channels,
            "signal has {channels} channels, model expects {}",
            self.config.in_channels
        );
        ensure!(
            c_channels == self.config.cdt_channels,
            "conditioning has {c_channels} channels, model expects {}",
            self.config.cdt_channels
        );
        ensure!(
            cols == self.config.squeeze,
            "grid has {cols} columns, squeeze factor is {}",
            self.config.squeeze
        );
        ensure!(
            batch == c_batch && rows == c_rows && cols == c_cols,
            "signal grid [{batch}, {rows}, {cols}] and conditioning grid [{c_batch}, {c_rows}, {c_cols}] disagree"
        );
        ensure!(rows > 0, "signal is empty");
        ensure!(
            self.flows.len() <= FULL_FLIP_FLOWS || rows % 2 == 0,
            "half-flip flows need an even row count, got {rows} rows"
        );
        Ok(())
    }
}

/// Undo the flows in reverse order. Each flow's permutation is its own
/// inverse, so it is re-applied to both grids before the flow is inverted.
fn invert_flows<B, F>(
    flows: &[CouplingStack<B>],
    mut z: Tensor<B, 4>,
    mut c: Tensor<B, 4>,
    mut invert: F,
) -> Result<Tensor<B, 4>>
where
    B: Backend,
    F: FnMut(usize, &CouplingStack<B>, Tensor<B, 4>, Tensor<B, 4>) -> Result<Tensor<B, 4>>,
{
    for (index, flow) in flows.iter().enumerate().rev() {
        let permutation = FlowPermutation::for_flow(index);
        z = permutation.apply(z);
        c = permutation.apply(c);
        z = invert(index, flow, z, c.clone())?;
        tracing::debug!(flow = index, "inverted flow");
    }
    Ok(z)
}

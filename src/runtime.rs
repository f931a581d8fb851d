//! High-level runtime wrapper for model bootstrapping and file-based synthesis.
//!
//! This module provides a convenience-focused API for constructing a model from
//! a YAML config, loading conditioning features, synthesizing audio to WAV, and
//! scoring recordings. It keeps that boilerplate out of the CLI.

use crate::audio::io::WavIo;
use crate::config::{load_config, resolve_relative_path, WaveFlowConfig};
use crate::download::download_if_necessary;
use crate::model::waveflow::WaveFlow;
use crate::modules::permute::FULL_FLIP_FLOWS;
use crate::perf::{self, Metric};
use crate::weights::TensorData as WeightTensor;
use anyhow::{bail, ensure, Context, Result};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use safetensors::SafeTensors;
use std::path::Path;

/// Tensor name looked up in conditioning files.
pub const CONDITIONING_TENSOR: &str = "conditioning";

/// Synthesis parameters used when building a runtime.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeParams {
    /// Standard deviation multiplier of the sampled noise.
    pub temperature: f32,
    /// Use cached inversion instead of prefix recomputation.
    pub fast: bool,
}

impl RuntimeParams {
    /// Build a parameter bundle for runtime creation.
    pub fn new(temperature: f32, fast: bool) -> Self {
        Self { temperature, fast }
    }
}

impl Default for RuntimeParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            fast: true,
        }
    }
}

/// Runtime that owns the model and configuration.
#[derive(Debug)]
pub struct SynthesisRuntime<B: Backend> {
    config: WaveFlowConfig,
    model: WaveFlow<B>,
    params: RuntimeParams,
    device: B::Device,
}

impl<B: Backend> SynthesisRuntime<B> {
    /// Create a runtime from a config path. A relative `weights_path` is
    /// resolved against the config file's directory.
    pub fn from_config_path(
        path: impl AsRef<Path>,
        params: RuntimeParams,
        device: &B::Device,
    ) -> Result<Self> {
        let _span = perf::span(Metric::RuntimeFromConfigPath);
        let path = path.as_ref();
        let mut config = load_config(path)?;
        if let Some(weights) = config.weights_path.as_ref() {
            let resolved = resolve_relative_path(path, weights);
            config.weights_path = Some(resolved.to_string_lossy().into_owned());
        }
        Self::from_config(&config, params, device)
    }

    /// Create a runtime from an already-loaded config.
    ///
    /// Without `weights_path` the model is randomly initialized. Weight
    /// normalization is collapsed before the runtime is returned.
    pub fn from_config(config: &WaveFlowConfig, params: RuntimeParams, device: &B::Device) -> Result<Self> {
        let _span = perf::span(Metric::RuntimeFromConfig);
        let mut model = match config.weights_path.as_ref() {
            Some(weights) => {
                let local = download_if_necessary(weights)?;
                WaveFlow::load(&config.model, local, device)?
            }
            None => {
                tracing::warn!("no weights_path configured; using random initialization");
                WaveFlow::new(&config.model, device)?
            }
        };
        model.finalize_for_inference();
        Ok(Self {
            config: config.clone(),
            model,
            params,
            device: device.clone(),
        })
    }

    /// Access the loaded configuration.
    pub fn config(&self) -> &WaveFlowConfig {
        &self.config
    }

    /// Access the underlying model (advanced usage).
    pub fn model(&self) -> &WaveFlow<B> {
        &self.model
    }

    /// Mutable access to the underlying model.
    pub fn model_mut(&mut self) -> &mut WaveFlow<B> {
        &mut self.model
    }

    /// Load `[batch, cdt, len]` (or `[cdt, len]`) conditioning from SafeTensors.
    pub fn load_conditioning(&self, path: impl AsRef<Path>) -> Result<Tensor<B, 3>> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read conditioning {}", path.display()))?;
        let tensors = SafeTensors::deserialize(&bytes)?;
        let view = tensors.tensor(CONDITIONING_TENSOR).map_err(|err| {
            anyhow::anyhow!(
                "{} has no `{CONDITIONING_TENSOR}` tensor: {err}",
                path.display()
            )
        })?;
        let raw = WeightTensor::from_safetensor(view);
        let (batch, channels, len) = match raw.shape.as_slice() {
            [channels, len] => (1, *channels, *len),
            [batch, channels, len] => (*batch, *channels, *len),
            other => bail!("conditioning must be 2D or 3D, got shape {other:?}"),
        };
        let expected = self.config.model.cdt_channels;
        ensure!(
            channels == expected,
            "conditioning has {channels} channels, model expects {expected}"
        );
        let values = raw.to_f32()?;
        Ok(Tensor::from_data(
            TensorData::new(values, [batch, channels, len]),
            &self.device,
        ))
    }

    /// Generate audio `[batch, len]` from conditioning.
    pub fn synthesize(&mut self, conditioning: Tensor<B, 3>) -> Result<Tensor<B, 2>> {
        let len = conditioning.dims()[2];
        let usable = self.usable_length(len)?;
        if usable != len {
            tracing::warn!(len, usable, "trimming conditioning to a whole number of grid rows");
        }
        let conditioning = conditioning.narrow(2, 0, usable);
        if self.params.fast {
            self.model
                .synthesize_fast(conditioning, self.params.temperature)
        } else {
            self.model.synthesize(conditioning, self.params.temperature)
        }
    }

    /// Read conditioning, synthesize, and write the first batch item as WAV.
    ///
    /// Returns the number of samples written.
    pub fn synthesize_to_wav(
        &mut self,
        conditioning_path: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> Result<usize> {
        let conditioning = self.load_conditioning(conditioning_path)?;
        let audio = self.synthesize(conditioning)?;
        let [_, len] = audio.dims();
        let samples = audio
            .narrow(0, 0, 1)
            .to_data()
            .to_vec::<f32>()
            .map_err(|err| anyhow::anyhow!("audio is not f32: {err:?}"))?;
        WavIo::write_mono(output, &samples, self.config.audio.sample_rate)?;
        Ok(len)
    }

    /// Mean negative log-likelihood objective of a recording under its
    /// conditioning. Both are trimmed to their common usable length.
    pub fn score(
        &mut self,
        wav_path: impl AsRef<Path>,
        conditioning_path: impl AsRef<Path>,
    ) -> Result<f32> {
        let (samples, sample_rate) = WavIo::read_mono(wav_path)?;
        if sample_rate != self.config.audio.sample_rate {
            tracing::warn!(
                file = sample_rate,
                model = self.config.audio.sample_rate,
                "sample rate mismatch; scoring without resampling"
            );
        }
        let conditioning = self.load_conditioning(conditioning_path)?;
        let [batch, _, cond_len] = conditioning.dims();
        ensure!(batch == 1, "score expects a single conditioning sequence, got batch {batch}");
        let usable = self.usable_length(samples.len().min(cond_len))?;

        let signal = Tensor::<B, 2>::from_data(
            TensorData::new(samples[..usable].to_vec(), [1, usable]),
            &self.device,
        );
        self.model.enter_parallel_mode();
        let (_, loss) = self
            .model
            .loss(signal, conditioning.narrow(2, 0, usable))?;
        let value = loss
            .to_data()
            .to_vec::<f32>()
            .map_err(|err| anyhow::anyhow!("loss is not f32: {err:?}"))?;
        value.first().copied().context("empty loss tensor")
    }

    /// Longest prefix of `len` samples the model accepts.
    pub fn usable_length(&self, len: usize) -> Result<usize> {
        let model = &self.config.model;
        let row_multiple = if model.n_flow > FULL_FLIP_FLOWS { 2 } else { 1 };
        let unit = model.squeeze * row_multiple;
        let usable = len - len % unit;
        ensure!(
            usable > 0,
            "{len} samples is shorter than one synthesis unit of {unit} samples"
        );
        Ok(usable)
    }
}

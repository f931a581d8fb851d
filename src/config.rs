//! Configuration types for the flow model architecture and audio settings.
//!
//! Configurations are typically loaded from YAML files using [`load_config`].

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// Fixed model dimensions shared by every flow.
pub struct ModelConfig {
    /// Channels of the transformed signal (1 for mono audio).
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    /// Channels produced by the coupling network (mean and logvar halves).
    #[serde(default = "default_out_channels")]
    pub out_channels: usize,
    /// Residual stream width inside a coupling stack.
    pub res_channels: usize,
    /// Width of each gate half inside a residual block.
    pub hidden_channels: usize,
    /// Width of the skip stream.
    pub skip_channels: usize,
    /// Channels of the conditioning signal (e.g. mel bins).
    pub cdt_channels: usize,
    /// Square kernel size of the dilated block convolution (odd).
    pub kernel_size: usize,
    /// Dilation doubles every layer and wraps after this many layers.
    pub cycle_size: usize,
    /// Residual blocks per flow.
    pub n_layer: usize,
    /// Number of flows.
    pub n_flow: usize,
    /// Squeeze factor: columns of the 2-D grid.
    pub squeeze: usize,
    /// Upper bound applied to every logvar before exponentiation.
    #[serde(default = "default_logvar_clamp")]
    pub logvar_clamp: f32,
}

fn default_in_channels() -> usize {
    1
}

fn default_out_channels() -> usize {
    2
}

fn default_logvar_clamp() -> f32 {
    10.0
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            out_channels: 2,
            res_channels: 64,
            hidden_channels: 64,
            skip_channels: 64,
            cdt_channels: 80,
            kernel_size: 3,
            cycle_size: 10,
            n_layer: 8,
            n_flow: 8,
            squeeze: 16,
            logvar_clamp: 10.0,
        }
    }
}

impl ModelConfig {
    /// Check invariants the model construction relies on.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.in_channels > 0, "in_channels must be > 0");
        ensure!(
            self.out_channels == 2 * self.in_channels,
            "out_channels ({}) must be twice in_channels ({}) to split into mean and logvar",
            self.out_channels,
            self.in_channels
        );
        ensure!(
            self.res_channels > 0
                && self.hidden_channels > 0
                && self.skip_channels > 0
                && self.cdt_channels > 0,
            "channel widths must be > 0"
        );
        ensure!(
            self.kernel_size % 2 == 1,
            "kernel_size must be odd, got {}",
            self.kernel_size
        );
        ensure!(self.cycle_size > 0, "cycle_size must be > 0");
        ensure!(self.n_layer > 0, "n_layer must be > 0");
        ensure!(self.n_flow > 0, "n_flow must be > 0");
        ensure!(self.squeeze > 0, "squeeze must be > 0");
        ensure!(
            self.cycle_size < usize::BITS as usize,
            "cycle_size {} overflows the dilation schedule",
            self.cycle_size
        );
        Ok(())
    }

    /// Dilation of layer `layer` inside a coupling stack.
    pub fn dilation(&self, layer: usize) -> usize {
        1 << (layer % self.cycle_size)
    }

    /// Rows a single block looks back over, including the current row.
    pub fn layer_receptive_field(&self, layer: usize) -> usize {
        (self.kernel_size - 1) * self.dilation(layer) + 1
    }

    /// Receptive field of a whole coupling stack in rows.
    pub fn receptive_field(&self) -> usize {
        let dilations: usize = (0..self.n_layer).map(|layer| self.dilation(layer)).sum();
        (self.kernel_size - 1) * dilations + 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// Audio settings used when reading and writing waveforms.
pub struct AudioConfig {
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self { sample_rate: 22050 }
    }
}

/// Top-level configuration.
///
/// # Example YAML
///
/// ```yaml
/// weights_path: "checkpoints/waveflow.safetensors"
/// model:
///   res_channels: 64
///   hidden_channels: 64
///   skip_channels: 64
///   cdt_channels: 80
///   kernel_size: 3
///   cycle_size: 10
///   n_layer: 8
///   n_flow: 8
///   squeeze: 16
/// audio:
///   sample_rate: 22050
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaveFlowConfig {
    /// Architecture dimensions.
    pub model: ModelConfig,
    /// Audio settings.
    #[serde(default)]
    pub audio: AudioConfig,
    /// Checkpoint path (supports `hf://` URLs).
    #[serde(default)]
    pub weights_path: Option<String>,
}

/// Load a configuration from a YAML file.
///
/// # Errors
///
/// Returns an error if the file doesn't exist, contains invalid YAML, or
/// describes an inconsistent architecture.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<WaveFlowConfig> {
    let path = path.as_ref();
    if !path.exists() {
        anyhow::bail!("Config file not found: {}", path.display());
    }

    let data = fs::read_to_string(path)?;
    let config: WaveFlowConfig = serde_yaml::from_str(&data)
        .with_context(|| format!("invalid config {}", path.display()))?;
    config.model.validate()?;
    Ok(config)
}

/// Resolve a possibly relative path against a config file location.
pub fn resolve_relative_path(config_path: &Path, maybe_relative: &str) -> PathBuf {
    let candidate = Path::new(maybe_relative);
    if candidate.is_absolute() || maybe_relative.starts_with("hf://") {
        return candidate.to_path_buf();
    }
    config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(candidate)
}

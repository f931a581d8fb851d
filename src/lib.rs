//! # waveflow - Conditional flow-based waveform synthesis
//!
//! A Rust implementation of WaveFlow: an invertible model mapping Gaussian
//! noise to audio, conditioned on acoustic features such as mel spectrograms.
//!
//! ## Architecture Overview
//!
//! A waveform of length `L` is folded into a grid of `L / h` rows by `h`
//! columns (`h` is the squeeze factor). Rows are the time axis.
//!
//! 1. **Coupling stacks** ([`modules::coupling`]): a causal first convolution
//!    followed by gated residual blocks with cyclic dilation. Each stack
//!    predicts a shift and log-scale for every row from the rows before it.
//!
//! 2. **Flow chain** ([`WaveFlow`]): `n_flow` affine coupling transforms with a
//!    row reversal after each one (whole grid for the first four flows, each
//!    half independently after that).
//!
//! 3. **Incremental caches** ([`modules::incremental_cache`]): ring buffers
//!    holding each block's receptive field so inversion runs one row at a time
//!    without recomputing the prefix.
//!
//! ## Quick Start
//!
//! ```no_run
//! use burn_ndarray::{NdArray, NdArrayDevice};
//! use burn::tensor::{Distribution, Tensor};
//! use waveflow::{load_config, WaveFlow};
//!
//! let config = load_config("config.yaml").unwrap();
//! let device = NdArrayDevice::default();
//! let mut model = WaveFlow::<NdArray<f32>>::new(&config.model, &device).unwrap();
//! model.finalize_for_inference();
//!
//! // Conditioning at the audio rate: [batch, cdt_channels, samples].
//! let mel = Tensor::<NdArray<f32>, 3>::random(
//!     [1, config.model.cdt_channels, 4096],
//!     Distribution::Normal(0.0, 1.0),
//!     &device,
//! );
//! let audio = model.synthesize_fast(mel, 0.6).unwrap();
//! assert_eq!(audio.dims(), [1, 4096]);
//! ```
//!
//! ## Configuration
//!
//! Models are configured via YAML files holding the architecture dimensions
//! and an optional checkpoint path. Checkpoints can be local SafeTensors files
//! or `hf://` URLs fetched from HuggingFace Hub.
//!
//! See [`WaveFlowConfig`] for the full configuration structure.

// Public modules - these are part of the stable API
pub mod audio;
pub mod config;
pub mod download;
pub mod perf;
pub mod runtime;

// Internal modules - exposed for integration tests but not part of stable API.
// These may change without notice between versions.
#[doc(hidden)]
pub mod model;
#[doc(hidden)]
pub mod modules;
#[doc(hidden)]
pub mod state;
#[doc(hidden)]
pub mod weights;

// Re-exports forming the public API
pub use config::{load_config, ModelConfig, WaveFlowConfig};
pub use download::download_if_necessary;
pub use model::waveflow::{FlowInput, FlowOutput, WaveFlow};
pub use state::ExecutionMode;

//! Command-line interface for WaveFlow.
//!
//! The CLI wraps the runtime to inspect model configs, write freshly
//! initialized checkpoints, synthesize audio from conditioning features, and
//! score recordings.

#![recursion_limit = "256"]

use anyhow::Result;
use burn::tensor::backend::Backend;
use burn_ndarray::{NdArray, NdArrayDevice};
use clap::ValueEnum;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use waveflow::config::load_config;
use waveflow::model::waveflow::WaveFlow;
use waveflow::perf;
use waveflow::runtime::{RuntimeParams, SynthesisRuntime};

#[cfg(feature = "backend-wgpu")]
use burn_wgpu::graphics::AutoGraphicsApi;
#[cfg(feature = "backend-wgpu")]
use burn_wgpu::{init_setup, Wgpu, WgpuDevice};

/// Supported compute backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
enum BackendChoice {
    /// Use the WGPU backend (GPU acceleration when available).
    Wgpu,
    /// Use the ndarray backend (CPU).
    Ndarray,
}

#[cfg(feature = "backend-wgpu")]
const DEFAULT_BACKEND: BackendChoice = BackendChoice::Wgpu;
#[cfg(not(feature = "backend-wgpu"))]
const DEFAULT_BACKEND: BackendChoice = BackendChoice::Ndarray;

/// Top-level CLI options.
#[derive(Parser)]
#[command(name = "waveflow")]
#[command(about = "Flow-based conditional waveform synthesis", long_about = None)]
struct Cli {
    /// Print performance summary at the end of the run.
    #[arg(long, short, global = true)]
    verbose: bool,
    /// Compute backend to use.
    #[arg(long, value_enum, default_value_t = DEFAULT_BACKEND, global = true)]
    backend: BackendChoice,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Print receptive field and parameter count for a config.
    Info {
        /// Model configuration YAML.
        #[arg(long)]
        config: PathBuf,
    },
    /// Write a randomly initialized checkpoint.
    Init {
        /// Model configuration YAML.
        #[arg(long)]
        config: PathBuf,
        /// Output SafeTensors path.
        #[arg(long)]
        output: PathBuf,
    },
    /// Generate audio from conditioning features.
    Synthesize {
        /// Model configuration YAML.
        #[arg(long)]
        config: PathBuf,
        /// SafeTensors file holding a `conditioning` tensor.
        #[arg(long)]
        conditioning: PathBuf,
        /// Output WAV file path.
        #[arg(long)]
        output: PathBuf,
        /// Noise temperature.
        #[arg(long, default_value_t = 1.0)]
        temp: f32,
        /// Use cached row-by-row inversion.
        #[arg(long)]
        fast: bool,
    },
    /// Compute the likelihood objective of a recording.
    Score {
        /// Model configuration YAML.
        #[arg(long)]
        config: PathBuf,
        /// Input WAV file.
        #[arg(long)]
        input: PathBuf,
        /// SafeTensors file holding a `conditioning` tensor.
        #[arg(long)]
        conditioning: PathBuf,
    },
}

/// Entry point for the CLI.
fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let verbose = cli.verbose;
    match cli.backend {
        BackendChoice::Wgpu => {
            #[cfg(feature = "backend-wgpu")]
            {
                let device = WgpuDevice::default();
                init_setup::<AutoGraphicsApi>(&device, Default::default());
                run::<Wgpu>(cli.command, &device)?;
            }
            #[cfg(not(feature = "backend-wgpu"))]
            {
                anyhow::bail!("WGPU backend not enabled; build with --features backend-wgpu");
            }
        }
        BackendChoice::Ndarray => {
            let device = NdArrayDevice::default();
            run::<NdArray<f32>>(cli.command, &device)?;
        }
    }

    if verbose {
        eprintln!("{}", perf::report());
    }

    Ok(())
}

fn run<B: Backend>(command: Commands, device: &B::Device) -> Result<()> {
    match command {
        Commands::Info { config } => {
            let config = load_config(resolve_config_path(config))?;
            let model = WaveFlow::<B>::new(&config.model, device)?;
            let audio = &config.audio;
            println!("flows: {}", config.model.n_flow);
            println!("layers per flow: {}", config.model.n_layer);
            println!("squeeze: {}", config.model.squeeze);
            println!("receptive field (rows): {}", model.receptive_field());
            println!(
                "receptive field (samples): {}",
                model.receptive_field() * config.model.squeeze
            );
            println!("parameters: {}", model.num_params());
            println!("sample rate: {}", audio.sample_rate);
        }
        Commands::Init { config, output } => {
            let config = load_config(resolve_config_path(config))?;
            let model = WaveFlow::<B>::new(&config.model, device)?;
            model.save(&output)?;
            println!("wrote {}", output.display());
        }
        Commands::Synthesize {
            config,
            conditioning,
            output,
            temp,
            fast,
        } => {
            let params = RuntimeParams::new(temp, fast);
            let mut runtime =
                SynthesisRuntime::<B>::from_config_path(resolve_config_path(config), params, device)?;
            let samples = runtime.synthesize_to_wav(&conditioning, &output)?;
            println!("wrote {samples} samples to {}", output.display());
        }
        Commands::Score {
            config,
            input,
            conditioning,
        } => {
            let mut runtime = SynthesisRuntime::<B>::from_config_path(
                resolve_config_path(config),
                RuntimeParams::default(),
                device,
            )?;
            let loss = runtime.score(&input, &conditioning)?;
            println!("{loss:.6}");
        }
    }
    Ok(())
}

/// Resolve a config path, falling back to parent directory if needed.
fn resolve_config_path(path: PathBuf) -> PathBuf {
    if path.exists() {
        return path;
    }
    let candidate = PathBuf::from("..").join(&path);
    if candidate.exists() {
        return candidate;
    }
    path
}

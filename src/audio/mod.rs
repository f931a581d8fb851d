//! Waveform file I/O for the CLI and tests.
//!
//! The model itself only sees tensors; these helpers convert between WAV
//! files and mono `f32` sample buffers.

pub mod io;

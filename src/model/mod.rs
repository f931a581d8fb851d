//! High-level model components.
//!
//! `squeeze` converts between flat waveforms and the row/column grid, and
//! `waveflow` chains the coupling flows into the full invertible model.

pub mod squeeze;
pub mod waveflow;

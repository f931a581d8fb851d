//! Low-level building blocks of the flow.
//!
//! These modules implement the row-causal convolutions, the gated residual
//! block, the coupling network, and the incremental caches that let the
//! coupling network run one row at a time.

pub mod coupling;
pub mod incremental_cache;
pub mod permute;
pub mod residual_block;
pub mod ring_buffer;
pub mod streaming_conv;
pub mod weight_norm;

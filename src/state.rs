//! Streaming state helpers shared across the flow stack.
//!
//! This module defines the small lifecycle contract that streaming layers follow
//! (allocate once, reset per sequence) and the model-level execution mode flag.

use burn::tensor::backend::Backend;

/// Trait implemented by modules that keep per-sequence history while evaluating
/// one row at a time.
pub trait StreamingModule<B: Backend> {
    /// Concrete state type for this module.
    type State;

    /// Allocate a zeroed state for a `[batch, _, _, cols]` signal.
    fn init_state(&self, batch_size: usize, cols: usize, device: &B::Device) -> Self::State;
    /// Zero an existing state in place for a new sequence.
    fn reset_state(&self, state: &mut Self::State);
}

/// Which evaluation path last configured a model.
///
/// Cached synthesis leaves per-flow histories behind; training-style use of the
/// parallel path must explicitly leave streaming mode first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Whole-signal evaluation (training and density estimation).
    #[default]
    Parallel,
    /// Row-by-row evaluation backed by incremental caches.
    Streaming,
}

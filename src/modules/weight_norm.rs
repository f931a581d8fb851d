//! Convolution weights with optional weight normalization.
//!
//! A weight-normalized kernel stores a per-output-channel magnitude `g` and a
//! direction `v`; the effective kernel is `g * v / ||v||`. Inference collapses
//! the pair into a plain kernel once via [`ConvWeight::collapse`].

use burn::tensor::{backend::Backend, Distribution, Tensor};

/// Counts produced by parameter initialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitReport {
    /// Parameters drawn from the Xavier normal distribution.
    pub initialized: usize,
    /// Parameters whose shape does not admit Xavier init (left at default).
    pub skipped: usize,
}

impl InitReport {
    /// Combine two reports.
    pub fn merge(self, other: InitReport) -> InitReport {
        InitReport {
            initialized: self.initialized + other.initialized,
            skipped: self.skipped + other.skipped,
        }
    }
}

/// Kernel storage `[out, in, kh, kw]`.
#[derive(Debug, Clone)]
pub enum ConvWeight<B: Backend> {
    /// Plain kernel.
    Plain(Tensor<B, 4>),
    /// Weight-normalized kernel: magnitude `[out]` and direction `[out, in, kh, kw]`.
    Normalized { g: Tensor<B, 1>, v: Tensor<B, 4> },
}

impl<B: Backend> ConvWeight<B> {
    /// Xavier-initialized plain kernel.
    pub fn plain(shape: [usize; 4], device: &B::Device) -> (Self, InitReport) {
        let weight = xavier_normal(shape, device);
        let report = InitReport {
            initialized: 1,
            skipped: 0,
        };
        (Self::Plain(weight), report)
    }

    /// Xavier-initialized direction with the magnitude left at `||v||`.
    ///
    /// The magnitude is rank 1, which Xavier init cannot handle, so it counts
    /// as skipped.
    pub fn normalized(shape: [usize; 4], device: &B::Device) -> (Self, InitReport) {
        let v = xavier_normal(shape, device);
        let g = channel_norm(v.clone());
        let report = InitReport {
            initialized: 1,
            skipped: 1,
        };
        (Self::Normalized { g, v }, report)
    }

    /// Effective kernel used by the convolution.
    pub fn resolve(&self) -> Tensor<B, 4> {
        match self {
            Self::Plain(weight) => weight.clone(),
            Self::Normalized { g, v } => {
                let [out, in_ch, kh, kw] = v.dims();
                let scale = g.clone().reshape([out, 1]) / channel_norm(v.clone()).reshape([out, 1]);
                let flat = v.clone().reshape([out, in_ch * kh * kw]);
                (flat * scale).reshape([out, in_ch, kh, kw])
            }
        }
    }

    /// Replace a normalized pair by its effective kernel. Returns true when a
    /// collapse happened.
    pub fn collapse(&mut self) -> bool {
        match self {
            Self::Plain(_) => false,
            Self::Normalized { .. } => {
                *self = Self::Plain(self.resolve());
                true
            }
        }
    }

    /// Kernel shape `[out, in, kh, kw]`.
    pub fn dims(&self) -> [usize; 4] {
        match self {
            Self::Plain(weight) => weight.dims(),
            Self::Normalized { v, .. } => v.dims(),
        }
    }

    /// Number of scalar parameters stored.
    pub fn num_params(&self) -> usize {
        let [out, in_ch, kh, kw] = self.dims();
        let kernel = out * in_ch * kh * kw;
        match self {
            Self::Plain(_) => kernel,
            Self::Normalized { .. } => kernel + out,
        }
    }

    /// Whether the kernel is still weight-normalized.
    pub fn is_normalized(&self) -> bool {
        matches!(self, Self::Normalized { .. })
    }
}

/// L2 norm of each output channel of a `[out, in, kh, kw]` kernel.
pub fn channel_norm<B: Backend>(v: Tensor<B, 4>) -> Tensor<B, 1> {
    let [out, in_ch, kh, kw] = v.dims();
    v.reshape([out, in_ch * kh * kw])
        .square()
        .sum_dim(1)
        .sqrt()
        .reshape([out])
}

/// Xavier (Glorot) normal draw for a conv kernel.
pub fn xavier_normal<B: Backend>(shape: [usize; 4], device: &B::Device) -> Tensor<B, 4> {
    let [out, in_ch, kh, kw] = shape;
    let receptive = kh * kw;
    let fan_in = in_ch * receptive;
    let fan_out = out * receptive;
    let std = (2.0 / (fan_in + fan_out) as f64).sqrt();
    Tensor::random(shape, Distribution::Normal(0.0, std), device)
}

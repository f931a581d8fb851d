//! Shared test utilities for model construction and tensor comparison.

#![allow(dead_code)]

use burn::tensor::{Distribution, Tensor, TensorData};
use burn_ndarray::{NdArray, NdArrayDevice};
use waveflow::config::ModelConfig;

pub type TestBackend = NdArray<f32>;

/// Small model with two dilation cycles and flows past the full-flip range.
pub fn test_config() -> ModelConfig {
    ModelConfig {
        res_channels: 8,
        hidden_channels: 8,
        skip_channels: 8,
        cdt_channels: 4,
        kernel_size: 3,
        cycle_size: 3,
        n_layer: 4,
        n_flow: 6,
        squeeze: 8,
        ..ModelConfig::default()
    }
}

/// Values of a float tensor.
pub fn values<const D: usize>(tensor: Tensor<TestBackend, D>) -> Vec<f32> {
    tensor.to_data().to_vec::<f32>().expect("f32 tensor")
}

/// Assert two tensor data slices are element-wise close within
/// `abs + rel * |expected|`.
pub fn assert_close(actual: &TensorData, expected: &TensorData, abs: f32, rel: f32) {
    let a_slice = actual.as_slice::<f32>().expect("actual slice");
    let b_slice = expected.as_slice::<f32>().expect("expected slice");
    assert_eq!(
        a_slice.len(),
        b_slice.len(),
        "tensor length mismatch: {} vs {}",
        a_slice.len(),
        b_slice.len()
    );
    for (idx, (x, y)) in a_slice.iter().zip(b_slice.iter()).enumerate() {
        let tol = abs + rel * y.abs();
        if (x - y).abs() > tol || x.is_nan() {
            panic!(
                "mismatch at {idx}: {x} vs {y} (diff: {}, tol: {tol})",
                (x - y).abs()
            );
        }
    }
}

/// Standard normal tensor.
pub fn normal<const D: usize>(shape: [usize; D], std: f64, device: &NdArrayDevice) -> Tensor<TestBackend, D> {
    Tensor::random(shape, Distribution::Normal(0.0, std), device)
}

/// Write a SafeTensors file holding a single F32 `conditioning` tensor.
pub fn write_conditioning(path: &std::path::Path, values: &[f32], shape: Vec<usize>) {
    use safetensors::tensor::TensorView;
    use safetensors::Dtype;
    use std::collections::HashMap;

    let bytes: Vec<u8> = values.iter().copied().flat_map(f32::to_le_bytes).collect();
    let view = TensorView::new(Dtype::F32, shape, &bytes).expect("tensor view");
    let mut tensors = HashMap::new();
    tensors.insert("conditioning".to_string(), view);
    let serialized = safetensors::serialize(&tensors, &None).expect("serialize");
    std::fs::write(path, serialized).expect("write conditioning");
}

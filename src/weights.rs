//! SafeTensors checkpoint loading, saving, and name mapping.
//!
//! Checkpoints use the PyTorch module naming of the reference training code:
//!
//! ```text
//! flows.{i}.first_conv.weight
//! flows.{i}.stack.{j}.{initial_conv|cdtconv|resconv|skipconv}.weight_g / weight_v
//! flows.{i}.last_convs.{1|3}.weight_g / weight_v
//! ```
//!
//! Every kernel may instead be stored collapsed as a single `.weight`.

use crate::config::ModelConfig;
use crate::modules::coupling::CouplingStack;
use crate::modules::residual_block::GatedResidualBlock;
use crate::modules::weight_norm::ConvWeight;
use anyhow::{bail, ensure, Context, Result};
use burn::tensor::{backend::Backend, Tensor, TensorData as BurnTensorData};
use safetensors::tensor::TensorView;
use safetensors::{serialize, Dtype, SafeTensors};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Raw tensor payload extracted from a SafeTensors file.
#[derive(Debug, Clone)]
pub struct TensorData {
    /// Scalar dtype in the file.
    pub dtype: Dtype,
    /// Shape as a list of dimensions.
    pub shape: Vec<usize>,
    /// Raw byte buffer in row-major order.
    pub data: Vec<u8>,
}

impl TensorData {
    /// Create TensorData from a safetensors TensorView.
    pub fn from_safetensor(tensor: safetensors::tensor::TensorView<'_>) -> Self {
        Self {
            dtype: tensor.dtype(),
            shape: tensor.shape().to_vec(),
            data: tensor.data().to_vec(),
        }
    }

    /// Encode a burn tensor as little-endian F32.
    pub fn from_tensor<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let values = tensor
            .to_data()
            .to_vec::<f32>()
            .map_err(|err| anyhow::anyhow!("tensor is not f32: {err:?}"))?;
        Ok(Self {
            dtype: Dtype::F32,
            shape,
            data: values.into_iter().flat_map(f32::to_le_bytes).collect(),
        })
    }

    /// Decode F32 or BF16 values.
    pub fn to_f32(&self) -> Result<Vec<f32>> {
        match self.dtype {
            Dtype::F32 => Ok(self
                .data
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect()),
            Dtype::BF16 => Ok(self
                .data
                .chunks_exact(2)
                .map(|chunk| {
                    let bits = u16::from_le_bytes([chunk[0], chunk[1]]) as u32;
                    f32::from_bits(bits << 16)
                })
                .collect()),
            other => bail!("Unsupported dtype {other:?}"),
        }
    }

    /// Convert into a burn tensor of rank `D`.
    pub fn to_tensor<B: Backend, const D: usize>(&self, device: &B::Device) -> Result<Tensor<B, D>> {
        let shape: [usize; D] = self
            .shape
            .clone()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Expected {D}D tensor, got shape {:?}", self.shape))?;
        let values = self.to_f32()?;
        ensure!(
            values.len() == shape.iter().product::<usize>(),
            "payload holds {} values for shape {:?}",
            values.len(),
            shape
        );
        Ok(Tensor::from_data(BurnTensorData::new(values, shape), device))
    }
}

/// Load a checkpoint and map names into module paths.
pub fn load_state_dict(path: impl AsRef<Path>) -> Result<HashMap<String, TensorData>> {
    let path = path.as_ref();
    let bytes =
        fs::read(path).with_context(|| format!("failed to read checkpoint {}", path.display()))?;
    let tensors = SafeTensors::deserialize(&bytes)?;
    let mut state = HashMap::new();

    for name in tensors.names() {
        if let Some(mapped) = map_checkpoint_name(name) {
            let tensor = tensors.tensor(name)?;
            state.insert(mapped, TensorData::from_safetensor(tensor));
        }
    }

    Ok(state)
}

/// Write a state dictionary as SafeTensors.
pub fn save_state_dict(path: impl AsRef<Path>, state: &HashMap<String, TensorData>) -> Result<()> {
    let path = path.as_ref();
    let mut views = HashMap::with_capacity(state.len());
    for (name, tensor) in state {
        let view = TensorView::new(tensor.dtype, tensor.shape.clone(), &tensor.data)?;
        views.insert(name.clone(), view);
    }
    let bytes = serialize(&views, &None)?;
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Map checkpoint tensor names into module paths.
fn map_checkpoint_name(name: &str) -> Option<String> {
    // Wrappers added by DataParallel / training harnesses.
    const STRIP_PREFIXES: &[&str] = &["module.", "model."];
    const SKIP_SUFFIXES: &[&str] = &["num_batches_tracked"];

    let mut name = name;
    for prefix in STRIP_PREFIXES {
        name = name.strip_prefix(prefix).unwrap_or(name);
    }

    if !name.starts_with("flows.") || SKIP_SUFFIXES.iter().any(|skip| name.ends_with(skip)) {
        return None;
    }
    Some(name.to_string())
}

/// Checkpoint prefix of a residual block convolution.
fn block_prefix(flow: usize, layer: usize, conv: &str) -> String {
    format!("flows.{flow}.stack.{layer}.{conv}")
}

/// Checkpoint prefix of a head convolution (`1` or `3`).
fn head_prefix(flow: usize, index: usize) -> String {
    format!("flows.{flow}.last_convs.{index}")
}

/// Read a kernel stored either as `weight_g`/`weight_v` or as `weight`.
pub fn conv_weight_from_state<B: Backend>(
    state: &HashMap<String, TensorData>,
    prefix: &str,
    expected: [usize; 4],
    device: &B::Device,
) -> Result<ConvWeight<B>> {
    let g = state.get(&format!("{prefix}.weight_g"));
    let v = state.get(&format!("{prefix}.weight_v"));
    let weight = match (g, v) {
        (Some(g), Some(v)) => {
            let v: Tensor<B, 4> = v.to_tensor(device)?;
            // PyTorch stores the magnitude as [out, 1, 1, 1].
            let out = g.shape.first().copied().unwrap_or(0);
            let g_len: usize = g.shape.iter().product();
            ensure!(
                g_len == out && out == expected[0],
                "{prefix}.weight_g has shape {:?}, expected {} magnitudes",
                g.shape,
                expected[0]
            );
            let g = TensorData {
                shape: vec![out],
                ..g.clone()
            };
            ConvWeight::Normalized {
                g: g.to_tensor(device)?,
                v,
            }
        }
        (None, None) => {
            let weight = state
                .get(&format!("{prefix}.weight"))
                .with_context(|| format!("missing tensor {prefix}.weight"))?;
            ConvWeight::Plain(weight.to_tensor(device)?)
        }
        _ => bail!("{prefix} has only one of weight_g / weight_v"),
    };
    ensure!(
        weight.dims() == expected,
        "{prefix} has shape {:?}, expected {:?}",
        weight.dims(),
        expected
    );
    Ok(weight)
}

/// Write a kernel under `prefix`, keeping weight normalization if present.
pub fn insert_conv_weight<B: Backend>(
    state: &mut HashMap<String, TensorData>,
    prefix: &str,
    weight: &ConvWeight<B>,
) -> Result<()> {
    match weight {
        ConvWeight::Plain(weight) => {
            state.insert(
                format!("{prefix}.weight"),
                TensorData::from_tensor(weight.clone())?,
            );
        }
        ConvWeight::Normalized { g, v } => {
            let out = g.dims()[0];
            state.insert(
                format!("{prefix}.weight_g"),
                TensorData::from_tensor(g.clone().reshape([out, 1, 1, 1]))?,
            );
            state.insert(
                format!("{prefix}.weight_v"),
                TensorData::from_tensor(v.clone())?,
            );
        }
    }
    Ok(())
}

/// Build every coupling stack from a state dictionary.
pub fn stacks_from_state<B: Backend>(
    config: &ModelConfig,
    state: &HashMap<String, TensorData>,
    device: &B::Device,
) -> Result<Vec<CouplingStack<B>>> {
    let gate = 2 * config.hidden_channels;
    let k = config.kernel_size;
    let mut stacks = Vec::with_capacity(config.n_flow);
    for flow in 0..config.n_flow {
        let first = conv_weight_from_state(
            state,
            &format!("flows.{flow}.first_conv"),
            [config.res_channels, config.in_channels, 2, 1],
            device,
        )?;
        let mut blocks = Vec::with_capacity(config.n_layer);
        for layer in 0..config.n_layer {
            let load = |conv: &str, shape: [usize; 4]| {
                conv_weight_from_state(state, &block_prefix(flow, layer, conv), shape, device)
            };
            blocks.push(GatedResidualBlock::from_weights(
                config,
                config.dilation(layer),
                load("initial_conv", [gate, config.res_channels, k, k])?,
                load("cdtconv", [gate, config.cdt_channels, 1, 1])?,
                load("resconv", [config.res_channels, config.hidden_channels, 1, 1])?,
                load("skipconv", [config.skip_channels, config.hidden_channels, 1, 1])?,
            ));
        }
        let head = conv_weight_from_state(
            state,
            &head_prefix(flow, 1),
            [config.skip_channels, config.skip_channels, 1, 1],
            device,
        )?;
        let out = conv_weight_from_state(
            state,
            &head_prefix(flow, 3),
            [config.out_channels, config.skip_channels, 1, 1],
            device,
        )?;
        stacks.push(CouplingStack::from_parts(config, first, blocks, head, out));
    }
    Ok(stacks)
}

/// Serialize every coupling stack into a state dictionary.
pub fn stacks_to_state<B: Backend>(stacks: &[CouplingStack<B>]) -> Result<HashMap<String, TensorData>> {
    let mut state = HashMap::new();
    for (flow, stack) in stacks.iter().enumerate() {
        insert_conv_weight(
            &mut state,
            &format!("flows.{flow}.first_conv"),
            &stack.first_conv.weight,
        )?;
        for (layer, block) in stack.blocks.iter().enumerate() {
            let convs = [
                ("initial_conv", &block.initial_conv),
                ("cdtconv", &block.cdt_conv),
                ("resconv", &block.res_conv),
                ("skipconv", &block.skip_conv),
            ];
            for (name, conv) in convs {
                insert_conv_weight(&mut state, &block_prefix(flow, layer, name), &conv.weight)?;
            }
        }
        insert_conv_weight(&mut state, &head_prefix(flow, 1), &stack.head_conv.weight)?;
        insert_conv_weight(&mut state, &head_prefix(flow, 3), &stack.out_conv.weight)?;
    }
    Ok(state)
}

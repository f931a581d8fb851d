//! Row permutations applied between flows.
//!
//! Both permutations reverse rows and are their own inverse, so the same
//! function undoes them.

use burn::tensor::{backend::Backend, Tensor};

/// Flows with an index below this reverse all rows; later flows reverse each
/// half separately.
pub const FULL_FLIP_FLOWS: usize = 4;

/// Row permutation following a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowPermutation {
    /// Reverse all rows.
    Full,
    /// Reverse the first and second halves of the rows independently.
    Half,
}

impl FlowPermutation {
    /// Permutation used after flow `flow_index`.
    pub fn for_flow(flow_index: usize) -> Self {
        if flow_index < FULL_FLIP_FLOWS {
            Self::Full
        } else {
            Self::Half
        }
    }

    /// Apply the permutation along the row axis (dim 2).
    pub fn apply<B: Backend>(self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Full => full_flip(x),
            Self::Half => half_flip(x),
        }
    }
}

/// Reverse the row axis.
pub fn full_flip<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    x.flip([2])
}

/// Reverse each half of the row axis. The row count must be even.
pub fn half_flip<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let half = x.dims()[2] / 2;
    let top = x.clone().narrow(2, 0, half).flip([2]);
    let bottom = x.narrow(2, half, half).flip([2]);
    Tensor::cat(vec![top, bottom], 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn rows(values: Vec<f32>) -> Tensor<TestBackend, 4> {
        let n = values.len();
        Tensor::from_data(TensorData::new(values, [1, 1, n, 1]), &NdArrayDevice::default())
    }

    fn values(x: Tensor<TestBackend, 4>) -> Vec<f32> {
        x.to_data().to_vec::<f32>().expect("values")
    }

    #[test]
    fn full_flip_reverses_rows() {
        let x = rows(vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(values(full_flip(x)), vec![3.0, 2.0, 1.0, 0.0]);
    }

    #[test]
    fn half_flip_reverses_each_half() {
        let x = rows(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(values(half_flip(x)), vec![2.0, 1.0, 0.0, 5.0, 4.0, 3.0]);
    }

    #[test]
    fn permutations_are_involutions() {
        let original = vec![0.5, -1.0, 2.0, 7.0, 3.5, -2.5, 1.0, 4.0];
        for perm in [FlowPermutation::Full, FlowPermutation::Half] {
            let twice = perm.apply(perm.apply(rows(original.clone())));
            assert_eq!(values(twice), original);
        }
    }

    #[test]
    fn early_flows_use_full_flip() {
        assert_eq!(FlowPermutation::for_flow(0), FlowPermutation::Full);
        assert_eq!(FlowPermutation::for_flow(3), FlowPermutation::Full);
        assert_eq!(FlowPermutation::for_flow(4), FlowPermutation::Half);
        assert_eq!(FlowPermutation::for_flow(7), FlowPermutation::Half);
    }
}

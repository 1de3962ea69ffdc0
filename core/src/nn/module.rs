use crate::error::Result;
use crate::precision::DType;
use crate::tensor::Tensor;
use std::fmt::Debug;

/// A trainable tensor together with its accumulated gradient.
///
/// Values and gradients are held as `f32` already rounded to the owning layer's storage format.
#[derive(Debug, Clone)]
pub struct Parameter<const RANK: usize> {
    pub value: Tensor<f32, RANK>,
    pub grad: Option<Tensor<f32, RANK>>,
    /// Set on parameters that are replicated across a tensor-parallel group but only see that
    /// rank's slice of the sequence. Their gradients have to be summed over the group.
    pub sequence_parallel: bool,
}

impl<const RANK: usize> Parameter<RANK> {
    pub fn new(value: Tensor<f32, RANK>) -> Self {
        Self {
            value,
            grad: None,
            sequence_parallel: false,
        }
    }

    pub fn shape(&self) -> &[usize; RANK] {
        self.value.shape()
    }

    /// Adds `grad` into the stored gradient and rounds the result to `dtype`.
    pub fn accumulate_grad(&mut self, grad: Tensor<f32, RANK>, dtype: DType) -> Result<()> {
        match &mut self.grad {
            Some(existing) => {
                existing.add_assign(&grad)?;
                dtype.round_slice(existing.data_mut());
            }
            None => self.grad = Some(grad.rounded(dtype)),
        }
        Ok(())
    }

    pub fn entry(&mut self) -> ParamEntry<'_> {
        ParamEntry {
            shape: self.value.shape().to_vec(),
            value: self.value.data_mut(),
            grad: self.grad.as_mut().map(|g| g.data_mut()),
            sequence_parallel: self.sequence_parallel,
        }
    }
}

/// Rank-erased mutable view of a [`Parameter`].
#[derive(Debug)]
pub struct ParamEntry<'a> {
    pub shape: Vec<usize>,
    pub value: &'a mut [f32],
    pub grad: Option<&'a mut [f32]>,
    pub sequence_parallel: bool,
}

/// A Module trait for Neural Network layers.
///
/// Every layer exposes its parameters under dotted names (`mixer.Wqkv.weight`, `norm1.bias`, ...),
/// which is how gradients are located for comparison and how sequence-parallel gradients are
/// visited in a deterministic order on every rank.
///
/// `Send + Sync` is required because one model lives on each rank thread and the reference
/// model is shared read-only between them.
pub trait Module: Debug + Send + Sync {
    fn named_parameters_mut(&mut self) -> Vec<(String, ParamEntry<'_>)>;

    fn zero_grad(&mut self) {
        for (_, entry) in self.named_parameters_mut() {
            if let Some(grad) = entry.grad {
                grad.fill(0.0);
            }
        }
    }

    fn num_parameters(&mut self) -> usize {
        self.named_parameters_mut()
            .iter()
            .map(|(_, entry)| entry.value.len())
            .sum()
    }
}

/// Prepends `prefix.` to every parameter name of a child module.
pub(crate) fn with_prefix<'a>(
    prefix: &str,
    entries: Vec<(String, ParamEntry<'a>)>,
) -> impl Iterator<Item = (String, ParamEntry<'a>)> + 'a {
    let prefix = prefix.to_string();
    entries
        .into_iter()
        .map(move |(name, entry)| (format!("{prefix}.{name}"), entry))
}

//! Run configuration for the equivalence check.

use crate::error::{Error, Result};
use crate::precision::DType;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Shape of the block, the input batch and the sharding to verify.
///
/// Every field has a default, so a TOML file only needs the values it changes:
///
/// ```toml
/// dim = 256
/// head_dim = 32
/// world_size = 4
/// dtype = "bf16"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BlockConfig {
    pub dim: usize,
    pub head_dim: usize,
    pub mlp_ratio: usize,
    /// Features of each head that are rotated. `None` means `head_dim / 2`.
    pub rotary_dim: Option<usize>,
    pub rotary_base: f32,
    pub causal: bool,
    pub residual_in_fp32: bool,
    pub layer_norm_eps: f32,
    pub batch_size: usize,
    pub seqlen: usize,
    pub seed: u64,
    /// Tensor-parallel group size.
    pub world_size: usize,
    /// Rank threads to launch. Defaults to `world_size`; a multiple of it runs several
    /// independent groups.
    pub processes: Option<usize>,
    pub dtype: DType,
    /// Bound on every blocking receive between ranks.
    pub comm_timeout_ms: Option<u64>,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            dim: 1024,
            head_dim: 64,
            mlp_ratio: 4,
            rotary_dim: None,
            rotary_base: 10_000.0,
            causal: false,
            residual_in_fp32: true,
            layer_norm_eps: 1e-5,
            batch_size: 8,
            seqlen: 1024,
            seed: 0,
            world_size: 2,
            processes: None,
            dtype: DType::F16,
            comm_timeout_ms: None,
        }
    }
}

impl BlockConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.dim / self.head_dim
    }

    pub fn hidden_features(&self) -> usize {
        self.dim * self.mlp_ratio
    }

    pub fn rotary_dim(&self) -> usize {
        self.rotary_dim.unwrap_or(self.head_dim / 2)
    }

    pub fn tokens(&self) -> usize {
        self.batch_size * self.seqlen
    }

    pub fn processes(&self) -> usize {
        self.processes.unwrap_or(self.world_size)
    }

    pub fn comm_timeout(&self) -> Option<Duration> {
        self.comm_timeout_ms.map(Duration::from_millis)
    }

    /// Checks every divisibility requirement of the sharded run before anything is computed.
    pub fn validate(&self) -> Result<()> {
        let ws = self.world_size;
        crate::ensure!(ws >= 1, "world size must be at least 1");
        crate::ensure!(
            self.dim > 0 && self.head_dim > 0 && self.dim % self.head_dim == 0,
            "dim {} is not a multiple of head_dim {}",
            self.dim,
            self.head_dim
        );
        crate::ensure!(
            self.num_heads() % ws == 0,
            "{} heads cannot be split over {ws} ranks",
            self.num_heads()
        );
        crate::ensure!(
            self.batch_size > 0 && self.seqlen > 0,
            "batch_size and seqlen must be positive"
        );
        crate::ensure!(
            self.tokens() % ws == 0,
            "{} tokens cannot be split over {ws} ranks",
            self.tokens()
        );
        crate::ensure!(
            self.mlp_ratio > 0 && self.hidden_features() % ws == 0,
            "hidden size {} cannot be split over {ws} ranks",
            self.hidden_features()
        );
        let rotary_dim = self.rotary_dim();
        crate::ensure!(
            rotary_dim > 0 && rotary_dim % 2 == 0 && rotary_dim <= self.head_dim,
            "rotary_dim {rotary_dim} must be positive, even and at most head_dim {}",
            self.head_dim
        );
        crate::ensure!(
            self.processes() % ws == 0,
            "{} processes do not form groups of {ws}",
            self.processes()
        );
        Ok(())
    }
}

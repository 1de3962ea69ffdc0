//! Equivalence check between the dense block and its tensor/sequence-parallel shards.
//!
//! The dense reference runs once; every rank thread then builds its shard from the reference
//! weights, runs forward and backward on its slice of the tokens and compares its activations
//! and gradients against the matching slice of the reference.

use crate::config::BlockConfig;
use crate::distributed::ops::scatter_to_sequence_parallel_region;
use crate::distributed::state::{launch, LaunchConfig, ParallelState};
use crate::error::{Error, Result};
use crate::nn::attention::SelfAttention;
use crate::nn::block::{Block, BlockOptions, DenseBlock, ForwardArgs};
use crate::nn::init::{randn, seeded_rng};
use crate::nn::linear::{Linear, Projection};
use crate::nn::mha::MultiHeadAttention;
use crate::nn::mlp::Mlp;
use crate::nn::module::Parameter;
use crate::nn::norm::LayerNorm;
use crate::nn::rotary::RotaryEmbedding;
use crate::parallel::{all_reduce_sequence_parallel_grads, ParallelBlock};
use crate::precision::{DType, Tolerance};
use crate::shard::{shard_cols, shard_qkv_bias, shard_qkv_weight, shard_rows, shard_vector};
use crate::tensor::Tensor;
use rand::Rng;
use std::fmt;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of one named comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct Check {
    pub name: String,
    pub max_abs_diff: f64,
    pub tolerance: Tolerance,
    pub passed: bool,
}

impl Check {
    pub fn compare<const RANK: usize>(
        name: impl Into<String>,
        got: &Tensor<f32, RANK>,
        expected: &Tensor<f32, RANK>,
        tolerance: Tolerance,
    ) -> Result<Self> {
        let name = name.into();
        if got.shape() != expected.shape() {
            return Err(Error::precondition(format!(
                "{name}: shape {:?} does not match reference shape {:?}",
                got.shape(),
                expected.shape()
            )));
        }
        Ok(Self {
            max_abs_diff: got.max_abs_diff(expected)?,
            passed: got.allclose(expected, tolerance.rtol, tolerance.atol)?,
            tolerance,
            name,
        })
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: max_abs_diff={:.3e} ({}) {}",
            self.name,
            self.max_abs_diff,
            self.tolerance,
            if self.passed { "ok" } else { "FAILED" }
        )
    }
}

#[derive(Debug, Clone)]
pub struct RankReport {
    pub global_rank: usize,
    pub group_index: usize,
    /// Rank inside the tensor-parallel group.
    pub rank: usize,
    pub checks: Vec<Check>,
}

impl RankReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn check(&self, name: &str) -> Option<&Check> {
        self.checks.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct EquivalenceReport {
    pub world_size: usize,
    pub dtype: DType,
    pub ranks: Vec<RankReport>,
}

impl EquivalenceReport {
    pub fn passed(&self) -> bool {
        self.ranks.iter().all(RankReport::passed)
    }

    /// Failed checks with the global rank that ran them.
    pub fn failures(&self) -> Vec<(usize, &Check)> {
        self.ranks
            .iter()
            .flat_map(|r| {
                r.checks
                    .iter()
                    .filter(|c| !c.passed)
                    .map(move |c| (r.global_rank, c))
            })
            .collect()
    }

    pub fn num_checks(&self) -> usize {
        self.ranks.iter().map(|r| r.checks.len()).sum()
    }
}

impl fmt::Display for EquivalenceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failures = self.failures();
        write!(
            f,
            "world_size={} dtype={}: {}/{} checks passed",
            self.world_size,
            self.dtype,
            self.num_checks() - failures.len(),
            self.num_checks()
        )?;
        for (rank, check) in failures {
            write!(f, "\n  rank {rank}: {check}")?;
        }
        Ok(())
    }
}

/// Builds the dense block with freshly initialised parameters.
///
/// Linear layers use the uniform `±1/sqrt(fan_in)` init; norm weights and biases are drawn from
/// `N(0, 1)` so that the norm gradients are not trivially structured.
pub fn build_dense_block<R: Rng>(cfg: &BlockConfig, rng: &mut R) -> Result<DenseBlock> {
    let dtype = cfg.dtype;
    let dim = cfg.dim;
    let hidden = cfg.hidden_features();

    let wqkv = Linear::init(dim, 3 * dim, true, dtype, rng);
    let out_proj = Linear::init(dim, dim, true, dtype, rng);
    let rotary = RotaryEmbedding::new(cfg.rotary_dim(), cfg.rotary_base, dtype)?;
    let inner_attn = SelfAttention::new(cfg.num_heads(), cfg.head_dim, cfg.causal, Some(rotary), dtype);
    let mixer = MultiHeadAttention::new(wqkv, inner_attn, out_proj);

    let fc1 = Linear::init(dim, hidden, true, dtype, rng);
    let fc2 = Linear::init(hidden, dim, true, dtype, rng);
    let mlp = Mlp::new(fc1, fc2, dtype);

    let norm1 = LayerNorm::new(randn([dim], rng), randn([dim], rng), cfg.layer_norm_eps, dtype)?;
    let norm2 = LayerNorm::new(randn([dim], rng), randn([dim], rng), cfg.layer_norm_eps, dtype)?;

    Ok(Block::new(
        norm1,
        mixer,
        norm2,
        mlp,
        BlockOptions {
            residual_in_fp32: cfg.residual_in_fp32,
            sequence_parallel: false,
            dtype,
        },
    ))
}

/// Inputs, outputs and gradients of the dense block, shared read-only by every rank.
#[derive(Debug)]
pub struct ReferenceRun {
    pub config: BlockConfig,
    pub x: Tensor<f32, 2>,
    pub residual: Tensor<f32, 2>,
    /// Gradient applied to the block output.
    pub g: Tensor<f32, 2>,
    pub out: Tensor<f32, 2>,
    pub out_residual: Tensor<f32, 2>,
    pub x_grad: Tensor<f32, 2>,
    pub residual_grad: Tensor<f32, 2>,
    /// The dense block after backward; holds the parameter gradients.
    pub block: DenseBlock,
}

impl ReferenceRun {
    /// Draws `x`, `residual`, `g` and then the parameters from one seeded generator, runs the
    /// dense forward and backward with `g` on the block output only.
    pub fn execute(cfg: &BlockConfig) -> Result<Self> {
        cfg.validate()?;
        let start = Instant::now();
        let mut rng = seeded_rng(cfg.seed);
        let shape = [cfg.tokens(), cfg.dim];
        let residual_dtype = if cfg.residual_in_fp32 {
            DType::F32
        } else {
            cfg.dtype
        };

        let x = randn(shape, &mut rng).rounded(cfg.dtype);
        let residual = randn(shape, &mut rng).rounded(residual_dtype);
        let g = randn(shape, &mut rng).scale(1.0 / 32.0).rounded(cfg.dtype);
        let mut block = build_dense_block(cfg, &mut rng)?;

        let args = ForwardArgs { seqlen: cfg.seqlen };
        let (out, out_residual, ctx) = block.forward(&x, Some(&residual), &args)?;
        let (x_grad, residual_grad) = block.backward(ctx, &g, None)?;
        info!(
            tokens = cfg.tokens(),
            dim = cfg.dim,
            dtype = %cfg.dtype,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "reference block done"
        );

        Ok(Self {
            config: cfg.clone(),
            x,
            residual,
            g,
            out,
            out_residual,
            x_grad,
            residual_grad,
            block,
        })
    }
}

fn grad<'a, const RANK: usize>(param: &'a Parameter<RANK>, name: &str) -> Result<&'a Tensor<f32, RANK>> {
    param
        .grad
        .as_ref()
        .ok_or_else(|| Error::precondition(format!("{name} has no gradient")))
}

fn bias<'a>(linear: &'a Linear, name: &str) -> Result<&'a Parameter<1>> {
    linear
        .bias
        .as_ref()
        .ok_or_else(|| Error::precondition(format!("{name} has no bias")))
}

/// Collects named comparisons for one rank.
struct Checker {
    global_rank: usize,
    checks: Vec<Check>,
}

impl Checker {
    fn compare<const RANK: usize>(
        &mut self,
        name: &str,
        got: &Tensor<f32, RANK>,
        expected: &Tensor<f32, RANK>,
        tolerance: Tolerance,
    ) -> Result<()> {
        let check = Check::compare(name, got, expected, tolerance)?;
        if check.passed {
            debug!(rank = self.global_rank, %check, "check");
        } else {
            warn!(rank = self.global_rank, %check, "check failed");
        }
        self.checks.push(check);
        Ok(())
    }
}

/// Runs one rank of the sharded block against `reference` and compares every shard.
pub fn run_rank(reference: &ReferenceRun, state: ParallelState) -> Result<RankReport> {
    let cfg = &reference.config;
    let rank = state.tensor_parallel_rank();
    let ws = state.tensor_parallel_world_size();
    let global_rank = state.global_rank();
    let group_index = state.tensor_parallel_group_index();
    let rows = |t: &Tensor<f32, 2>| scatter_to_sequence_parallel_region(t, rank, ws);

    let mut model = ParallelBlock::from_reference(&reference.block, &state)?;
    let x = rows(&reference.x)?;
    let residual = rows(&reference.residual)?;
    let g = rows(&reference.g)?;

    let args = ForwardArgs { seqlen: cfg.seqlen };
    let (out, out_residual, ctx) = model.forward(&x, Some(&residual), &args)?;
    let (x_grad, residual_grad) = model.backward(ctx, &g, None)?;
    all_reduce_sequence_parallel_grads(&mut model, state.group().as_ref(), cfg.dtype)?;

    let base = cfg.dtype.tolerance();
    let weight_tol = base.scaled(10.0);
    let bias_tol = base.scaled(5.0);
    let mut checker = Checker {
        global_rank,
        checks: Vec::new(),
    };

    checker.compare("out", &out, &rows(&reference.out)?, base)?;
    checker.compare("out_residual", &out_residual, &rows(&reference.out_residual)?, base)?;
    checker.compare("x.grad", &x_grad, &rows(&reference.x_grad)?, base)?;
    checker.compare("residual.grad", &residual_grad, &rows(&reference.residual_grad)?, base)?;

    let dense = &reference.block;
    let (ref_wqkv, par_wqkv) = (&dense.mixer.wqkv, model.mixer.wqkv.linear());
    checker.compare(
        "mixer.Wqkv.weight.grad",
        grad(&par_wqkv.weight, "Wqkv.weight")?,
        &shard_qkv_weight(grad(&ref_wqkv.weight, "Wqkv.weight")?, rank, ws)?,
        weight_tol,
    )?;
    checker.compare(
        "mixer.Wqkv.bias.grad",
        grad(bias(par_wqkv, "Wqkv")?, "Wqkv.bias")?,
        &shard_qkv_bias(grad(bias(ref_wqkv, "Wqkv")?, "Wqkv.bias")?, rank, ws)?,
        bias_tol,
    )?;

    let (ref_out, par_out) = (&dense.mixer.out_proj, model.mixer.out_proj.linear());
    checker.compare(
        "mixer.out_proj.weight.grad",
        grad(&par_out.weight, "out_proj.weight")?,
        &shard_cols(grad(&ref_out.weight, "out_proj.weight")?, rank, ws)?,
        weight_tol,
    )?;

    let (ref_fc1, par_fc1) = (&dense.mlp.fc1, model.mlp.fc1.linear());
    checker.compare(
        "mlp.fc1.weight.grad",
        grad(&par_fc1.weight, "fc1.weight")?,
        &shard_rows(grad(&ref_fc1.weight, "fc1.weight")?, rank, ws)?,
        weight_tol,
    )?;
    checker.compare(
        "mlp.fc1.bias.grad",
        grad(bias(par_fc1, "fc1")?, "fc1.bias")?,
        &shard_vector(grad(bias(ref_fc1, "fc1")?, "fc1.bias")?, rank, ws)?,
        bias_tol,
    )?;

    let (ref_fc2, par_fc2) = (&dense.mlp.fc2, model.mlp.fc2.linear());
    checker.compare(
        "mlp.fc2.weight.grad",
        grad(&par_fc2.weight, "fc2.weight")?,
        &shard_cols(grad(&ref_fc2.weight, "fc2.weight")?, rank, ws)?,
        weight_tol,
    )?;

    // Row-parallel biases live on rank 0 only.
    if rank == 0 {
        checker.compare(
            "mixer.out_proj.bias.grad",
            grad(bias(par_out, "out_proj")?, "out_proj.bias")?,
            grad(bias(ref_out, "out_proj")?, "out_proj.bias")?,
            bias_tol,
        )?;
        checker.compare(
            "mlp.fc2.bias.grad",
            grad(bias(par_fc2, "fc2")?, "fc2.bias")?,
            grad(bias(ref_fc2, "fc2")?, "fc2.bias")?,
            bias_tol,
        )?;
    }

    for (name, got, expected) in [
        ("norm1.weight.grad", &model.norm1.weight, &dense.norm1.weight),
        ("norm1.bias.grad", &model.norm1.bias, &dense.norm1.bias),
        ("norm2.weight.grad", &model.norm2.weight, &dense.norm2.weight),
        ("norm2.bias.grad", &model.norm2.bias, &dense.norm2.bias),
    ] {
        checker.compare(name, grad(got, name)?, grad(expected, name)?, bias_tol)?;
    }

    // The model's layers hold the last group handles besides the state.
    drop(model);
    state.destroy();

    Ok(RankReport {
        global_rank,
        group_index,
        rank,
        checks: checker.checks,
    })
}

/// Runs the dense reference once, then every rank of the sharded block against it.
pub fn verify_block_parallel(cfg: &BlockConfig) -> Result<EquivalenceReport> {
    cfg.validate()?;
    info!(
        dim = cfg.dim,
        heads = cfg.num_heads(),
        batch_size = cfg.batch_size,
        seqlen = cfg.seqlen,
        world_size = cfg.world_size,
        dtype = %cfg.dtype,
        "verifying tensor-parallel block"
    );
    let reference = ReferenceRun::execute(cfg)?;

    let launch_config =
        LaunchConfig::new(cfg.processes(), cfg.world_size).with_timeout(cfg.comm_timeout());
    let ranks = launch(&launch_config, |state| run_rank(&reference, state))?;

    let report = EquivalenceReport {
        world_size: cfg.world_size,
        dtype: cfg.dtype,
        ranks,
    };
    if report.passed() {
        info!(%report, "equivalence holds");
    } else {
        warn!(%report, "equivalence violated");
    }
    Ok(report)
}

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tp_block::config::BlockConfig;
use tp_block::precision::DType;
use tp_block::verify::verify_block_parallel;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Verify that the tensor/sequence-parallel block matches the dense block.
///
/// Runs every combination of world size and dtype, prints one summary line per combination and
/// exits non-zero if any comparison fails. Combinations whose shapes cannot be split are skipped.
#[derive(Parser, Debug)]
#[command(name = "tp-verify", version)]
struct Cli {
    /// TOML file with block settings; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    dim: Option<usize>,

    #[arg(long)]
    head_dim: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    seqlen: Option<usize>,

    /// Tensor-parallel sizes to check
    #[arg(long, value_delimiter = ',', default_value = "1,2,4,8")]
    world_sizes: Vec<usize>,

    /// Precisions to check
    #[arg(long, value_delimiter = ',', default_value = "f16,bf16")]
    dtypes: Vec<DType>,

    #[arg(long)]
    seed: Option<u64>,

    /// Causal attention mask
    #[arg(long)]
    causal: bool,

    /// Fail a rank that waits longer than this for a peer
    #[arg(long)]
    timeout_ms: Option<u64>,
}

impl Cli {
    fn base_config(&self) -> Result<BlockConfig> {
        let mut cfg = match &self.config {
            Some(path) => BlockConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => BlockConfig::default(),
        };
        if let Some(dim) = self.dim {
            cfg.dim = dim;
        }
        if let Some(head_dim) = self.head_dim {
            cfg.head_dim = head_dim;
        }
        if let Some(batch_size) = self.batch_size {
            cfg.batch_size = batch_size;
        }
        if let Some(seqlen) = self.seqlen {
            cfg.seqlen = seqlen;
        }
        if let Some(seed) = self.seed {
            cfg.seed = seed;
        }
        if self.causal {
            cfg.causal = true;
        }
        if self.timeout_ms.is_some() {
            cfg.comm_timeout_ms = self.timeout_ms;
        }
        Ok(cfg)
    }
}

/// Settings for one world size and dtype. A `processes` value from the config file is kept when
/// it forms whole groups of `world_size`, otherwise each combination runs a single group.
fn combination(base: &BlockConfig, world_size: usize, dtype: DType) -> BlockConfig {
    let processes = base
        .processes
        .filter(|&p| world_size > 0 && p % world_size == 0);
    if let (Some(requested), None) = (base.processes, processes) {
        warn!(
            requested,
            world_size, "processes is not a multiple of world_size, running one group"
        );
    }
    BlockConfig {
        world_size,
        processes,
        dtype,
        ..base.clone()
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let base = cli.base_config()?;
    let supported = DType::supported();

    let mut ran = 0usize;
    let mut failed = 0usize;
    for &world_size in &cli.world_sizes {
        for &dtype in &cli.dtypes {
            if !supported.contains(&dtype) {
                warn!(%dtype, "dtype not supported, skipping");
                continue;
            }
            let cfg = combination(&base, world_size, dtype);
            if let Err(e) = cfg.validate() {
                warn!(world_size, %dtype, error = %e, "skipping");
                continue;
            }

            let report = verify_block_parallel(&cfg)
                .with_context(|| format!("world_size={world_size} dtype={dtype}"))?;
            println!("{report}");
            ran += 1;
            if !report.passed() {
                failed += 1;
            }
        }
    }

    info!(ran, failed, "done");
    if ran == 0 {
        bail!("no combination could be run with the given shapes");
    }
    if failed > 0 {
        bail!("{failed} of {ran} combinations failed");
    }
    Ok(())
}

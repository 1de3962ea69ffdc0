//! # Distributed Execution
//!
//! Tensor parallelism splits every weight matrix of a block across the ranks of a group;
//! sequence parallelism additionally splits the activations *between* the matrix multiplies
//! (layer norms, residual adds) along the token dimension.
//!
//! ## Module Contents
//!
//! * [`CollectiveBackend`](backend::CollectiveBackend): the communication interface
//!   (all-reduce, all-gather, reduce-scatter, barrier).
//! * [`CpuBackend`](cpu_backend::CpuBackend): ring collectives between threads over channels.
//! * [`ParallelState`](state::ParallelState) and [`launch`](state::launch): the process grid and
//!   an SPMD launcher that runs one thread per rank.
//! * [`ops`]: scatter/gather/reduce-scatter of row-sharded activations.
//!
//! ## Quick Start
//!
//! ```rust
//! use tp_block::distributed::{launch, LaunchConfig};
//!
//! let sums = launch(&LaunchConfig::new(4, 4), |state| {
//!     let mut buf = vec![state.global_rank() as f32; 3];
//!     state.group().all_reduce_sum(&mut buf)?;
//!     Ok(buf)
//! })
//! .unwrap();
//! assert!(sums.iter().all(|s| s == &vec![6.0; 3]));
//! ```

pub mod backend;
pub mod cpu_backend;
pub mod ops;
pub mod state;

pub use backend::CollectiveBackend;
pub use cpu_backend::CpuBackend;
pub use state::{launch, LaunchConfig, ParallelState};

use super::backend::CollectiveBackend;
use super::cpu_backend::CpuBackend;
use crate::error::{Error, Result};
use std::any::Any;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Per-rank view of the process grid.
///
/// Global ranks are split into tensor-parallel groups of consecutive ranks:
/// `[0, tp)`, `[tp, 2 tp)`, ... Each group has its own ring.
#[derive(Debug, Clone)]
pub struct ParallelState {
    global_rank: usize,
    world_size: usize,
    tensor_parallel_size: usize,
    group: Arc<dyn CollectiveBackend>,
}

impl ParallelState {
    pub fn initialize(
        global_rank: usize,
        world_size: usize,
        tensor_parallel_size: usize,
        group: Arc<dyn CollectiveBackend>,
    ) -> Result<Self> {
        crate::ensure!(
            tensor_parallel_size > 0 && world_size % tensor_parallel_size == 0,
            "world size {world_size} is not a multiple of the tensor-parallel size {tensor_parallel_size}"
        );
        crate::ensure!(
            global_rank < world_size,
            "rank {global_rank} outside world of {world_size}"
        );
        crate::ensure!(
            group.world_size() == tensor_parallel_size
                && group.rank() == global_rank % tensor_parallel_size,
            "group member {}/{} does not match global rank {global_rank} with tensor-parallel size {tensor_parallel_size}",
            group.rank(),
            group.world_size()
        );
        debug!(
            global_rank,
            world_size, tensor_parallel_size, "initialized parallel state"
        );
        Ok(Self {
            global_rank,
            world_size,
            tensor_parallel_size,
            group,
        })
    }

    pub fn global_rank(&self) -> usize {
        self.global_rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn tensor_parallel_rank(&self) -> usize {
        self.group.rank()
    }

    pub fn tensor_parallel_world_size(&self) -> usize {
        self.tensor_parallel_size
    }

    /// Index of this rank's tensor-parallel group.
    pub fn tensor_parallel_group_index(&self) -> usize {
        self.global_rank / self.tensor_parallel_size
    }

    pub fn group(&self) -> Arc<dyn CollectiveBackend> {
        Arc::clone(&self.group)
    }

    /// Drops this rank's handle on the group.
    ///
    /// Every layer built from the state holds a clone of the same `Arc`, so the channels close
    /// only once those layers are dropped as well. Drop the model first, then call `destroy`.
    pub fn destroy(self) {
        debug!(global_rank = self.global_rank, "destroyed parallel state");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Number of rank threads.
    pub world_size: usize,
    pub tensor_parallel_size: usize,
    /// Bound on every blocking receive. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl LaunchConfig {
    pub fn new(world_size: usize, tensor_parallel_size: usize) -> Self {
        Self {
            world_size,
            tensor_parallel_size,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs `f` once per rank on its own thread (SPMD) and returns the results in global rank order.
///
/// A rank that fails or panics drops its channel ends, so its neighbours fail too rather than
/// block. Every thread is joined before returning; the first error in rank order is returned.
pub fn launch<R, F>(config: &LaunchConfig, f: F) -> Result<Vec<R>>
where
    R: Send,
    F: Fn(ParallelState) -> Result<R> + Sync,
{
    let LaunchConfig {
        world_size,
        tensor_parallel_size,
        timeout,
    } = *config;
    crate::ensure!(world_size > 0, "world size must be positive");
    crate::ensure!(
        tensor_parallel_size > 0 && world_size % tensor_parallel_size == 0,
        "world size {world_size} is not a multiple of the tensor-parallel size {tensor_parallel_size}"
    );
    info!(world_size, tensor_parallel_size, "launching ranks");

    let backends: Vec<CpuBackend> = (0..world_size / tensor_parallel_size)
        .flat_map(|_| CpuBackend::ring(tensor_parallel_size, timeout))
        .collect();

    let results: Vec<Result<R>> = thread::scope(|scope| {
        let f = &f;
        let mut handles = Vec::with_capacity(world_size);
        for (global_rank, backend) in backends.into_iter().enumerate() {
            let handle = thread::Builder::new()
                .name(format!("rank-{global_rank}"))
                .spawn_scoped(scope, move || {
                    let group: Arc<dyn CollectiveBackend> = Arc::new(backend);
                    let state = ParallelState::initialize(
                        global_rank,
                        world_size,
                        tensor_parallel_size,
                        group,
                    )?;
                    f(state)
                });
            handles.push((global_rank, handle));
        }

        handles
            .into_iter()
            .map(|(rank, handle)| match handle {
                Ok(handle) => handle.join().unwrap_or_else(|payload| {
                    Err(Error::RankPanicked {
                        rank,
                        message: panic_message(payload.as_ref()),
                    })
                }),
                Err(e) => Err(Error::Io(e)),
            })
            .collect()
    });

    results.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups_are_consecutive_ranks() {
        let config = LaunchConfig::new(6, 2);
        let ranks = launch(&config, |state| {
            Ok((
                state.global_rank(),
                state.tensor_parallel_group_index(),
                state.tensor_parallel_rank(),
            ))
        })
        .unwrap();
        assert_eq!(
            ranks,
            vec![(0, 0, 0), (1, 0, 1), (2, 1, 0), (3, 1, 1), (4, 2, 0), (5, 2, 1)]
        );
    }

    #[test]
    fn test_groups_reduce_independently() {
        let results = launch(&LaunchConfig::new(4, 2), |state| {
            let mut buf = [state.global_rank() as f32];
            state.group().all_reduce_sum(&mut buf)?;
            Ok(buf[0])
        })
        .unwrap();
        assert_eq!(results, vec![1.0, 1.0, 5.0, 5.0]);
    }

    #[test]
    fn test_invalid_grid() {
        assert!(matches!(
            launch(&LaunchConfig::new(6, 4), |_| Ok(())),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn test_panicking_rank_is_reported() {
        let result = launch(&LaunchConfig::new(2, 2), |state| {
            if state.global_rank() == 1 {
                panic!("boom");
            }
            state.group().barrier()
        });
        // Rank 0 fails first in rank order because its neighbour vanished.
        match result {
            Err(Error::Comm { rank: 0, .. }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_initialize_checks_group() {
        let ring = CpuBackend::ring(2, None);
        let group: Arc<dyn CollectiveBackend> = Arc::new(ring.into_iter().next().unwrap());
        assert!(ParallelState::initialize(1, 2, 2, group).is_err());
    }

    #[test]
    fn test_destroy_releases_state_handle() {
        let ring = CpuBackend::ring(1, None);
        let group: Arc<dyn CollectiveBackend> = Arc::new(ring.into_iter().next().unwrap());
        let state = ParallelState::initialize(0, 1, 1, Arc::clone(&group)).unwrap();
        let layer_handle = state.group();
        assert_eq!(Arc::strong_count(&group), 3);
        state.destroy();
        assert_eq!(Arc::strong_count(&group), 2);
        drop(layer_handle);
        assert_eq!(Arc::strong_count(&group), 1);
    }
}

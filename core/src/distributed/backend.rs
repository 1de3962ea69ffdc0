use crate::error::Result;
use std::fmt::Debug;

/// Abstraction for a collective communication group.
///
/// Every member of a group must issue the same collectives in the same order with buffers of the
/// same length. Payloads are `f32`: half-precision activations are widened before they travel and
/// rounded by the caller once the reduction is complete.
///
/// The trait is object safe so layers can hold an `Arc<dyn CollectiveBackend>`.
pub trait CollectiveBackend: Debug + Send + Sync {
    /// Rank of this member inside the group.
    fn rank(&self) -> usize;

    /// Number of members in the group.
    fn world_size(&self) -> usize;

    /// In-place element-wise sum over the group. Afterwards every rank holds the same buffer.
    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()>;

    /// Concatenates every rank's `local` buffer in rank order.
    fn all_gather(&self, local: &[f32]) -> Result<Vec<f32>>;

    /// Sums `full` over the group and returns chunk `rank` of the result.
    ///
    /// `full.len()` must be divisible by the world size.
    fn reduce_scatter(&self, full: &[f32]) -> Result<Vec<f32>>;

    /// Returns once every rank has entered the barrier.
    fn barrier(&self) -> Result<()>;
}

//! Seeded parameter and input initialisation.

use crate::tensor::Tensor;
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Samples every element from `N(0, 1)`.
pub fn randn<R: Rng, const RANK: usize>(shape: [usize; RANK], rng: &mut R) -> Tensor<f32, RANK> {
    Tensor::from_fn(shape, |_| rng.sample::<f32, _>(StandardNormal))
}

/// Samples every element from `U(-bound, bound)`.
pub fn uniform<R: Rng, const RANK: usize>(
    shape: [usize; RANK],
    bound: f32,
    rng: &mut R,
) -> Tensor<f32, RANK> {
    let dist = Uniform::new_inclusive(-bound, bound);
    Tensor::from_fn(shape, |_| rng.sample(dist))
}

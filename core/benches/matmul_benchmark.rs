use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tp_block::nn::init::{randn, seeded_rng};
use tp_block::tensor::Tensor;

fn benchmark_matmul(c: &mut Criterion) {
    let mut group = c.benchmark_group("matmul");
    let mut rng = seeded_rng(0);

    // Activations [tokens, dim] against a [dim, dim] weight, as in the block projections.
    for (tokens, dim) in [(64, 64), (256, 256), (1024, 256)] {
        let x: Tensor<f32, 2> = randn([tokens, dim], &mut rng);
        let w: Tensor<f32, 2> = randn([dim, dim], &mut rng);

        group.bench_function(format!("nn_{tokens}x{dim}"), |b| {
            b.iter(|| black_box(x.matmul(&w).unwrap()))
        });
        group.bench_function(format!("nt_{tokens}x{dim}"), |b| {
            b.iter(|| black_box(x.matmul_nt(&w).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_matmul);
criterion_main!(benches);

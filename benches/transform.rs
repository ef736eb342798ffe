use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use vdc::{Lifting1D, WaveletBlock};

const WIDTHS: [usize; 3] = [32, 64, 256];
const BLOCK_SIZES: [usize; 2] = [16, 32];

fn set_up_signal(n: usize) -> Vec<f32> {
    (0..n).map(|i| (i as f32 * 0.37).sin() * 10.0 + (i % 7) as f32).collect()
}

fn lifting_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("lifting_forward");
    for &(n, ntilde) in &[(1, 1), (2, 2), (4, 4)] {
        for width in WIDTHS.iter() {
            let lifting = Lifting1D::new(n, ntilde, *width).unwrap();
            let id = BenchmarkId::new(format!("{}_{}", n, ntilde), width);
            group.bench_with_input(id, width, |b, &width| {
                b.iter_with_setup(
                    || set_up_signal(width),
                    |mut data| lifting.forward_transform(black_box(&mut data)).unwrap(),
                );
            });
        }
    }
    group.finish();
}

fn lifting_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("lifting_round_trip");
    for width in WIDTHS.iter() {
        let lifting = Lifting1D::new(2, 2, *width).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(width), width, |b, &width| {
            b.iter_with_setup(
                || set_up_signal(width),
                |mut data| {
                    lifting.forward_transform(&mut data).unwrap();
                    lifting.inverse_transform(black_box(&mut data)).unwrap();
                },
            );
        });
    }
    group.finish();
}

fn block_forward_inverse(c: &mut Criterion) {
    let mut group = c.benchmark_group("wavelet_block_3d");
    for size in BLOCK_SIZES.iter() {
        let wb = WaveletBlock::new(3, [*size; 3], 1, 1).unwrap();
        let children: Vec<Vec<f32>> = (0..wb.num_children())
            .map(|c| set_up_signal(wb.block_len()).into_iter().map(|v| v + c as f32).collect())
            .collect();
        group.bench_with_input(BenchmarkId::new("forward", size), size, |b, _| {
            b.iter(|| wb.forward(black_box(&children)).unwrap());
        });
        let coeffs = wb.forward(&children).unwrap();
        group.bench_with_input(BenchmarkId::new("inverse", size), size, |b, _| {
            b.iter(|| wb.inverse(black_box(&coeffs)).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, lifting_forward, lifting_round_trip, block_forward_inverse);
criterion_main!(benches);

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use kornia_pnp as kpnp;
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, Rng, SeedableRng};

type PnpDataset = (Vec<[f64; 3]>, Vec<[f64; 2]>, [[f64; 3]; 3]);

fn generate_cube_dataset_with_seed(num_points: usize, noise_px: f64, seed: u64) -> PnpDataset {
    let k = [[800.0, 0.0, 640.0], [0.0, 800.0, 480.0], [0.0, 0.0, 1.0]];

    // points in a 1m cube around z in [3,6]
    let mut world = Vec::with_capacity(num_points);
    let mut rng = StdRng::seed_from_u64(seed);
    for _ in 0..num_points {
        world.push([
            rng.random_range(-0.5..0.5),
            rng.random_range(-0.5..0.5),
            rng.random_range(3.0..6.0),
        ]);
    }

    // mild rotation about y, small translation
    let (s, c) = 0.25f64.sin_cos();
    let r = [[c, 0.0, s], [0.0, 1.0, 0.0], [-s, 0.0, c]];
    let t = [0.2, -0.1, 0.3];

    let mut image = Vec::with_capacity(num_points);
    for p in &world {
        let xc = r[0][0] * p[0] + r[0][1] * p[1] + r[0][2] * p[2] + t[0];
        let yc = r[1][0] * p[0] + r[1][1] * p[1] + r[1][2] * p[2] + t[1];
        let zc = r[2][0] * p[0] + r[2][1] * p[1] + r[2][2] * p[2] + t[2];
        let u = k[0][0] * xc / zc + k[0][2] + rng.random_range(-noise_px..noise_px);
        let v = k[1][1] * yc / zc + k[1][2] + rng.random_range(-noise_px..noise_px);
        image.push([u, v]);
    }

    (world, image, k)
}

fn inject_outliers_random(image: &mut [[f64; 2]], fraction: f64, seed: u64) {
    let num_out = (fraction.clamp(0.0, 1.0) * image.len() as f64) as usize;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut idxs: Vec<usize> = (0..image.len()).collect();
    idxs.shuffle(&mut rng);
    for &i in idxs.iter().take(num_out) {
        let angle = rng.random_range(0.0..(2.0 * std::f64::consts::PI));
        let radius = rng.random_range(300.0..800.0);
        image[i][0] += radius * angle.cos();
        image[i][1] += radius * angle.sin();
    }
}

fn bench_epnp(c: &mut Criterion) {
    let mut group = c.benchmark_group("pnp_epnp");
    let closed_form = kpnp::PnPMethod::EPnP(kpnp::EPnPParams {
        refine_lm: None,
        ..Default::default()
    });
    for &n in &[8usize, 32, 128, 512, 2048] {
        let (world, image, k) = generate_cube_dataset_with_seed(n, 0.5, 42);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("closed_form", n), &n, |b, _| {
            b.iter(|| std::hint::black_box(kpnp::solve_pnp(&world, &image, &k, &closed_form)))
        });
        group.bench_with_input(BenchmarkId::new("refined", n), &n, |b, _| {
            b.iter(|| {
                std::hint::black_box(kpnp::solve_pnp(
                    &world,
                    &image,
                    &k,
                    &kpnp::PnPMethod::EPnPDefault,
                ))
            })
        });
    }
    group.finish();
}

fn bench_ransac(c: &mut Criterion) {
    let mut group = c.benchmark_group("pnp_ransac");
    for &n in &[32usize, 128, 512, 2048] {
        let seed = 10_000u64 + n as u64;
        let (world, mut image, k) = generate_cube_dataset_with_seed(n, 0.5, seed);
        inject_outliers_random(&mut image, 0.20, seed.wrapping_add(12345));

        let params = kpnp::RansacParams {
            max_iterations: 200,
            confidence: Some(0.99),
            random_seed: Some(seed),
            ..Default::default()
        };

        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                std::hint::black_box(kpnp::solve_pnp_ransac(
                    &world,
                    &image,
                    &k,
                    &kpnp::PnPMethod::EPnPDefault,
                    &params,
                ))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_epnp, bench_ransac);
criterion_main!(benches);

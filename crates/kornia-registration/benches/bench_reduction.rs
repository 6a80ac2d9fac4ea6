use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use glam::{DMat4, DVec3};
use kornia_registration::reduction::{reduce_sum_2d, ReductionBuffer};
use kornia_registration::{
    registration_icp, ICPConvergenceCriteria, PointCloud, ReductionMethod,
    TransformationEstimation,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

const METHODS: [ReductionMethod; 3] = [
    ReductionMethod::Tree,
    ReductionMethod::WarpShuffle,
    ReductionMethod::Atomic,
];

fn random_buffer<const W: usize>(width: usize, height: usize, seed: u64) -> ReductionBuffer<W> {
    let mut rng = StdRng::seed_from_u64(seed);
    let data = (0..width * height)
        .map(|_| std::array::from_fn(|_| rng.random_range(-1.0..1.0)))
        .collect();
    ReductionBuffer::new(width, height, data).unwrap()
}

fn bench_reduce_sum_2d(c: &mut Criterion) {
    let mut group = c.benchmark_group("reduce_sum_2d");
    for (width, height) in [(320, 240), (640, 480), (1280, 960)] {
        let buffer = random_buffer::<29>(width, height, 42);
        group.throughput(Throughput::Elements((width * height) as u64));
        for method in METHODS {
            group.bench_with_input(
                BenchmarkId::new(format!("{method:?}"), format!("{width}x{height}")),
                &buffer,
                |b, buffer| {
                    b.iter(|| std::hint::black_box(reduce_sum_2d(buffer, method)));
                },
            );
        }
    }
    group.finish();
}

fn surface(n: usize) -> PointCloud {
    let mut points = Vec::with_capacity(n * n);
    let mut normals = Vec::with_capacity(n * n);
    for i in 0..n {
        for j in 0..n {
            let x = -1.0 + 2.0 * i as f64 / (n - 1) as f64;
            let y = -1.0 + 2.0 * j as f64 / (n - 1) as f64;
            let z = 0.2 * (2.0 * x).sin() * (3.0 * y).cos();
            let dzdx = 0.4 * (2.0 * x).cos() * (3.0 * y).cos();
            let dzdy = -0.6 * (2.0 * x).sin() * (3.0 * y).sin();
            points.push([x, y, z]);
            normals.push(DVec3::new(-dzdx, -dzdy, 1.0).normalize().to_array());
        }
    }
    PointCloud::new(points, Some(normals), None).unwrap()
}

fn bench_icp(c: &mut Criterion) {
    let mut group = c.benchmark_group("registration_icp");
    let motion = DMat4::from_rotation_z(0.01) * DMat4::from_translation(DVec3::new(0.005, 0.0, 0.0));
    let criteria = ICPConvergenceCriteria {
        max_iterations: 10,
        ..Default::default()
    };
    for n in [64, 128, 256] {
        let target = surface(n);
        let source = target.transformed(&motion.inverse());
        let max_dist = 4.0 / n as f64;
        group.throughput(Throughput::Elements((n * n) as u64));
        for (name, estimation) in [
            ("point_to_point", TransformationEstimation::default()),
            ("point_to_plane", TransformationEstimation::PointToPlane),
        ] {
            group.bench_with_input(BenchmarkId::new(name, n * n), &n, |b, _| {
                b.iter(|| {
                    let res = registration_icp(
                        &source,
                        &target,
                        max_dist,
                        &DMat4::IDENTITY,
                        estimation,
                        &criteria,
                        ReductionMethod::Tree,
                    )
                    .unwrap();
                    std::hint::black_box(res);
                });
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_reduce_sum_2d, bench_icp);
criterion_main!(benches);

use glam::{DMat4, DVec3};
use kornia_registration::keyframe::point_point_pairs;
use kornia_registration::linalg::{rigid_from_parts, so3_exp};
use kornia_registration::{
    estimate_rigid_ransac, evaluate_registration, registration_icp, DepthImage,
    DescriptorMatcher, HammingMatcher, ICPConvergenceCriteria, KeyframeBundle,
    PinholeCameraIntrinsic, PointCloud, RansacParams, ReductionMethod, RegistrationError,
    TransformationEstimation,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

const WIDTH: usize = 640;
const HEIGHT: usize = 480;

fn truth() -> DMat4 {
    rigid_from_parts(so3_exp(DVec3::new(0.0, 0.05, 0.01)), DVec3::new(0.1, 0.0, 0.05))
}

/// Two keyframes observing the same points, the target moved by `truth()`.
/// Keypoint 1 of the source has no depth and keypoints 22.. get a wrong target depth.
fn keyframes(intrinsic: &PinholeCameraIntrinsic) -> Result<(KeyframeBundle, KeyframeBundle), RegistrationError> {
    let mut rng = StdRng::seed_from_u64(11);
    let mut source_depth = vec![0.0f32; WIDTH * HEIGHT];
    let mut target_depth = vec![0.0f32; WIDTH * HEIGHT];
    let mut source_kps = Vec::new();
    let mut target_kps = Vec::new();
    let mut descriptors = Vec::new();

    for i in 0..30usize {
        let (u, v) = (100 + 80 * (i % 6), 100 + 60 * (i / 6));
        let d = 2.0 + (i % 5) as f32 * 0.25;
        if i != 1 {
            source_depth[v * WIDTH + u] = d;
        }
        let s = intrinsic.backproject(u as f64, v as f64, d as f64);
        let t = truth().transform_point3(s);
        let Some(px) = intrinsic.project(t) else {
            return Err(RegistrationError::InvalidInput("point behind camera".to_string()));
        };
        let z = if i >= 22 { t.z + 1.0 } else { t.z };
        target_depth[px[1] as usize * WIDTH + px[0] as usize] = z as f32;

        source_kps.push([u as f64, v as f64]);
        target_kps.push(px);
        descriptors.push(std::array::from_fn(|_| rng.random::<u8>()));
    }

    let source = KeyframeBundle::new(
        source_kps,
        descriptors.clone(),
        DepthImage::new(WIDTH, HEIGHT, source_depth)?,
        None,
    )?;
    let target = KeyframeBundle::new(
        target_kps,
        descriptors,
        DepthImage::new(WIDTH, HEIGHT, target_depth)?,
        None,
    )?;
    Ok((source, target))
}

#[test]
fn keyframe_ransac_3d3d() -> Result<(), RegistrationError> {
    let intrinsic = PinholeCameraIntrinsic::new(500.0, 500.0, 320.0, 240.0)?;
    let (source, target) = keyframes(&intrinsic)?;

    let matches = HammingMatcher::default().match_descriptors(&source.descriptors, &target.descriptors);
    assert_eq!(matches.len(), 30);
    assert!(matches.iter().all(|m| m.query_idx == m.train_idx && m.distance == 0));

    let pairs = point_point_pairs(&source, &target, &matches, &intrinsic);
    assert_eq!(pairs.source.len(), 29);
    assert!(!pairs.match_indices.contains(&1));

    let params = RansacParams {
        random_seed: Some(3),
        ..Default::default()
    };
    let result = estimate_rigid_ransac(&pairs.source, &pairs.target, params)?;
    assert!(result.success);
    assert_eq!(result.num_inliers, 21);
    assert!(result.transformation.abs_diff_eq(truth(), 1e-4));
    // inliers are the pairs built from keypoints 0 and 2..22
    let inlier_keypoints: Vec<usize> = result
        .inlier_indices()
        .into_iter()
        .map(|i| matches[pairs.match_indices[i]].query_idx)
        .collect();
    assert_eq!(inlier_keypoints, [0].into_iter().chain(2..22).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn ransac_seeds_icp() -> Result<(), RegistrationError> {
    let mut points = Vec::new();
    for i in 0..25 {
        for j in 0..25 {
            let (x, y) = (i as f64 * 0.08 - 1.0, j as f64 * 0.08 - 1.0);
            points.push([x, y, 0.3 * (2.0 * x).sin() * (3.0 * y).cos()]);
        }
    }
    let source = PointCloud::from_points(points);
    let motion = rigid_from_parts(so3_exp(DVec3::new(0.3, -0.2, 0.5)), DVec3::new(0.4, 0.2, -0.1));
    let target = source.transformed(&motion);

    // a coarse pose from a subset of known pairs, then dense refinement
    let subset: Vec<usize> = (0..source.len()).step_by(37).collect();
    let src: Vec<[f64; 3]> = subset.iter().map(|&i| source.points()[i]).collect();
    let dst: Vec<[f64; 3]> = subset.iter().map(|&i| target.points()[i]).collect();
    let coarse = estimate_rigid_ransac(
        &src,
        &dst,
        RansacParams {
            random_seed: Some(0),
            max_iterations: 50,
            ..Default::default()
        },
    )?;
    assert!(coarse.success);

    let refined = registration_icp(
        &source,
        &target,
        0.03,
        &coarse.transformation,
        TransformationEstimation::default(),
        &ICPConvergenceCriteria::default(),
        ReductionMethod::WarpShuffle,
    )?;
    assert!(refined.converged());
    assert!(refined.transformation.abs_diff_eq(motion, 1e-8));

    let eval = evaluate_registration(&source, &target, 0.03, &refined.transformation)?;
    assert!((eval.fitness - 1.0).abs() < 1e-12);
    assert!(eval.inlier_rmse < 1e-8);
    Ok(())
}

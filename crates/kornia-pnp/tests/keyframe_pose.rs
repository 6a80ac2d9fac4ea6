use glam::{DMat4, DVec3};
use kornia_pnp::{estimate_pose_3d3d, estimate_pose_pnp, PnPError, RansacParams};
use kornia_registration::linalg::{rigid_from_parts, so3_exp};
use kornia_registration::{
    DepthImage, HammingMatcher, KeyframeBundle, PinholeCameraIntrinsic, RegistrationError,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

const WIDTH: usize = 640;
const HEIGHT: usize = 480;

fn truth() -> DMat4 {
    rigid_from_parts(so3_exp(DVec3::new(0.02, -0.06, 0.01)), DVec3::new(-0.1, 0.05, 0.1))
}

/// Two keyframes of the same scene, the target camera moved by `truth()`.
/// Source keypoint 1 has no depth and target depths of keypoints 22.. are off by 1 m.
fn keyframes(intrinsic: &PinholeCameraIntrinsic) -> Result<(KeyframeBundle, KeyframeBundle), RegistrationError> {
    let mut rng = StdRng::seed_from_u64(4);
    let mut source_depth = vec![0.0f32; WIDTH * HEIGHT];
    let mut target_depth = vec![0.0f32; WIDTH * HEIGHT];
    let mut source_kps = Vec::new();
    let mut target_kps = Vec::new();
    let mut descriptors = Vec::new();

    for i in 0..30usize {
        let (u, v) = (90 + 85 * (i % 6), 90 + 65 * (i / 6));
        let d = 1.5 + (i % 4) as f32 * 0.4 + (i / 6) as f32 * 0.1;
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
fn pnp_pipeline_recovers_motion() -> Result<(), RegistrationError> {
    let intrinsic = PinholeCameraIntrinsic::new(525.0, 525.0, 319.5, 239.5)?;
    let (source, target) = keyframes(&intrinsic)?;

    let params = RansacParams {
        random_seed: Some(17),
        ..Default::default()
    };
    let pose = estimate_pose_pnp(&source, &target, &HammingMatcher::default(), &intrinsic, &params);

    assert!(pose.success, "{:?}", pose.failure);
    assert_eq!(pose.matches.len(), 30);
    // depth errors in the target do not affect the 3D-2D path
    assert_eq!(pose.num_inliers, 29);
    assert!(!pose.inlier_mask[1]);
    assert!(pose.transformation.abs_diff_eq(truth(), 1e-6));
    Ok(())
}

#[test]
fn rigid_pipeline_rejects_bad_depth() -> Result<(), RegistrationError> {
    let intrinsic = PinholeCameraIntrinsic::new(525.0, 525.0, 319.5, 239.5)?;
    let (source, target) = keyframes(&intrinsic)?;

    let params = kornia_registration::RansacParams {
        random_seed: Some(17),
        ..Default::default()
    };
    let pose = estimate_pose_3d3d(&source, &target, &HammingMatcher::default(), &intrinsic, &params);

    assert!(pose.success, "{:?}", pose.failure);
    assert_eq!(pose.num_inliers, 21);
    let inlier_keypoints: Vec<usize> = pose.inlier_matches().iter().map(|m| m.query_idx).collect();
    assert_eq!(inlier_keypoints, [0].into_iter().chain(2..22).collect::<Vec<_>>());
    assert!(pose.transformation.abs_diff_eq(truth(), 1e-4));
    Ok(())
}

#[test]
fn pipelines_fail_without_enough_matches() -> Result<(), RegistrationError> {
    let intrinsic = PinholeCameraIntrinsic::new(525.0, 525.0, 319.5, 239.5)?;
    let (source, target) = keyframes(&intrinsic)?;
    let depth = DepthImage::new(WIDTH, HEIGHT, vec![0.0; WIDTH * HEIGHT])?;

    let empty = KeyframeBundle::new(Vec::new(), Vec::new(), depth.clone(), None)?;
    let pose = estimate_pose_pnp(&source, &empty, &HammingMatcher::default(), &intrinsic, &RansacParams::default());
    assert!(!pose.success);
    assert_eq!(pose.transformation, DMat4::IDENTITY);
    assert!(matches!(
        pose.failure,
        Some(PnPError::Registration(RegistrationError::InvalidInput(_)))
    ));

    // three keypoints only
    let few = KeyframeBundle::new(
        target.keypoints[..3].to_vec(),
        target.descriptors[..3].to_vec(),
        depth,
        None,
    )?;
    let pose = estimate_pose_pnp(&source, &few, &HammingMatcher::default(), &intrinsic, &RansacParams::default());
    assert_eq!(
        pose.failure,
        Some(PnPError::Registration(RegistrationError::InsufficientData {
            required: 4,
            actual: 3
        }))
    );
    assert_eq!(pose.inlier_mask, vec![false; 3]);

    let pose = estimate_pose_3d3d(
        &source,
        &few,
        &HammingMatcher::default(),
        &intrinsic,
        &kornia_registration::RansacParams::default(),
    );
    assert!(!pose.success);
    assert_eq!(
        pose.failure,
        Some(PnPError::Registration(RegistrationError::InsufficientData {
            required: 5,
            actual: 3
        }))
    );
    Ok(())
}

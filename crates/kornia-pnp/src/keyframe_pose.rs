//! Relative pose between two RGB-D keyframes.
//!
//! Both pipelines match descriptors, lift the matched source keypoints to 3D
//! and run RANSAC. The PnP path keeps the target keypoints in pixels, the 3D-3D
//! path lifts them too. The returned transform maps the source camera frame
//! into the target camera frame.

use glam::DMat4;
use kornia_registration::keyframe::{point_pixel_pairs, point_point_pairs};
use kornia_registration::{
    estimate_rigid_ransac, DescriptorMatcher, FeatureMatch, KeyframeBundle, PinholeCameraIntrinsic,
    RegistrationError,
};

use crate::pnp::PnPError;
use crate::ransac::{solve_pnp_ransac, RansacParams};
use crate::PnPMethod;

/// Minimum matches for the PnP pipeline.
pub const MIN_MATCHES_PNP: usize = 4;

/// Minimum matches for the 3D-3D pipeline.
pub const MIN_MATCHES_3D3D: usize = 5;

/// Outcome of a keyframe pose pipeline.
#[derive(Debug, Clone)]
pub struct KeyframePose {
    /// Whether the transform is usable.
    pub success: bool,
    /// Source camera to target camera, identity on failure.
    pub transformation: DMat4,
    /// Descriptor matches the estimate was computed from.
    pub matches: Vec<FeatureMatch>,
    /// One flag per match. Matches dropped for missing depth are never inliers.
    pub inlier_mask: Vec<bool>,
    /// Number of inlier matches.
    pub num_inliers: usize,
    /// Why the estimate is unusable, when it is.
    pub failure: Option<PnPError>,
}

impl KeyframePose {
    fn failed(matches: Vec<FeatureMatch>, err: PnPError) -> Self {
        log::debug!("keyframe pose failed: {err}");
        let n = matches.len();
        Self {
            success: false,
            transformation: DMat4::IDENTITY,
            matches,
            inlier_mask: vec![false; n],
            num_inliers: 0,
            failure: Some(err),
        }
    }

    /// The inlier matches, in match order.
    pub fn inlier_matches(&self) -> Vec<FeatureMatch> {
        self.matches
            .iter()
            .zip(self.inlier_mask.iter())
            .filter_map(|(m, &inlier)| inlier.then_some(*m))
            .collect()
    }
}

fn insufficient(required: usize, actual: usize) -> PnPError {
    PnPError::Registration(RegistrationError::InsufficientData { required, actual })
}

/// Spread a per-pair inlier mask back onto the match list.
fn mask_per_match(num_matches: usize, match_indices: &[usize], pair_mask: &[bool]) -> Vec<bool> {
    let mut mask = vec![false; num_matches];
    for (&m, &inlier) in match_indices.iter().zip(pair_mask.iter()) {
        mask[m] = inlier;
    }
    mask
}

/// Estimate the relative pose from source 3D points and target pixels.
///
/// Fails when either keyframe has no descriptors, when there are fewer than
/// four matches or back-projected points, or when RANSAC keeps fewer inliers
/// than `params.min_inliers`.
pub fn estimate_pose_pnp<M: DescriptorMatcher>(
    source: &KeyframeBundle,
    target: &KeyframeBundle,
    matcher: &M,
    intrinsic: &PinholeCameraIntrinsic,
    params: &RansacParams,
) -> KeyframePose {
    if source.descriptors.is_empty() || target.descriptors.is_empty() {
        return KeyframePose::failed(
            Vec::new(),
            PnPError::Registration(RegistrationError::InvalidInput(
                "keyframe without descriptors".to_string(),
            )),
        );
    }

    let matches = matcher.match_descriptors(&source.descriptors, &target.descriptors);
    log::debug!("PnP keyframe pose: {} matches", matches.len());
    if matches.len() < MIN_MATCHES_PNP {
        let n = matches.len();
        return KeyframePose::failed(matches, insufficient(MIN_MATCHES_PNP, n));
    }

    let pairs = point_pixel_pairs(source, target, &matches, intrinsic);
    if pairs.points.len() < MIN_MATCHES_PNP {
        let n = pairs.points.len();
        return KeyframePose::failed(matches, insufficient(MIN_MATCHES_PNP, n));
    }

    let k = intrinsic.to_matrix();
    let estimate = match solve_pnp_ransac(&pairs.points, &pairs.pixels, &k, &PnPMethod::EPnPDefault, params) {
        Ok(estimate) => estimate,
        Err(e) => return KeyframePose::failed(matches, e),
    };
    if !estimate.success {
        let err = estimate
            .failure
            .unwrap_or_else(|| insufficient(params.min_inliers, estimate.inliers.len()));
        return KeyframePose::failed(matches, err);
    }

    let inlier_mask = mask_per_match(matches.len(), &pairs.match_indices, &estimate.inlier_mask);
    KeyframePose {
        success: true,
        transformation: estimate.transformation,
        num_inliers: estimate.inliers.len(),
        matches,
        inlier_mask,
        failure: None,
    }
}

/// Estimate the relative pose from matched keypoints lifted to 3D in both frames.
///
/// Pairs where either depth is missing are dropped before RANSAC, keeping the
/// match order. Fails when there are fewer than five matches or pairs, or
/// when RANSAC does not reach `params.min_inliers`.
pub fn estimate_pose_3d3d<M: DescriptorMatcher>(
    source: &KeyframeBundle,
    target: &KeyframeBundle,
    matcher: &M,
    intrinsic: &PinholeCameraIntrinsic,
    params: &kornia_registration::RansacParams,
) -> KeyframePose {
    let matches = matcher.match_descriptors(&source.descriptors, &target.descriptors);
    log::debug!("3D-3D keyframe pose: {} matches", matches.len());
    if matches.len() < MIN_MATCHES_3D3D {
        let n = matches.len();
        return KeyframePose::failed(matches, insufficient(MIN_MATCHES_3D3D, n));
    }

    let pairs = point_point_pairs(source, target, &matches, intrinsic);
    if pairs.source.len() < MIN_MATCHES_3D3D {
        let n = pairs.source.len();
        return KeyframePose::failed(matches, insufficient(MIN_MATCHES_3D3D, n));
    }

    let estimate = match estimate_rigid_ransac(&pairs.source, &pairs.target, params.clone()) {
        Ok(estimate) => estimate,
        Err(e) => return KeyframePose::failed(matches, e.into()),
    };
    if !estimate.success {
        let err = estimate
            .failure
            .map(PnPError::from)
            .unwrap_or_else(|| insufficient(params.min_inliers, estimate.num_inliers));
        return KeyframePose::failed(matches, err);
    }

    let inlier_mask = mask_per_match(matches.len(), &pairs.match_indices, &estimate.inlier_mask);
    KeyframePose {
        success: true,
        transformation: estimate.transformation,
        num_inliers: estimate.num_inliers,
        matches,
        inlier_mask,
        failure: None,
    }
}

//! Sparse keyframe data: keypoints, binary descriptors and depth.
//!
//! Keyframes are matched with a brute-force Hamming matcher and the matched
//! keypoints are lifted to 3D with their depth, `p = d * K⁻¹ [u, v, 1]ᵗ`.
//! Keypoints without a usable depth are filtered out, keeping the original
//! match order.

use rayon::prelude::*;

use crate::camera::PinholeCameraIntrinsic;
use crate::error::RegistrationError;

/// A 256-bit binary descriptor (ORB/BRIEF layout).
pub type Descriptor = [u8; 32];

/// A single channel depth map in meters, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthImage {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl DepthImage {
    /// Create a depth map from metric values.
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Result<Self, RegistrationError> {
        if data.len() != width * height {
            return Err(RegistrationError::MismatchedLengths {
                left_name: "depth data",
                left_len: data.len(),
                right_name: "width * height",
                right_len: width * height,
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Create a depth map from raw sensor units, e.g. millimeters with `scale = 1000.0`.
    pub fn from_raw(
        width: usize,
        height: usize,
        raw: &[u16],
        scale: f32,
    ) -> Result<Self, RegistrationError> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(RegistrationError::InvalidInput(format!(
                "depth scale must be positive, got {scale}"
            )));
        }
        Self::new(width, height, raw.iter().map(|&d| d as f32 / scale).collect())
    }

    /// Image width.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Image height.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Depth at the pixel containing `(u, v)`, if it is inside the image.
    pub fn get(&self, u: f64, v: f64) -> Option<f32> {
        if !(u >= 0.0 && v >= 0.0) {
            return None;
        }
        let (x, y) = (u as usize, v as usize);
        if x >= self.width || y >= self.height {
            return None;
        }
        Some(self.data[y * self.width + x])
    }
}

/// An RGB image, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorImage {
    width: usize,
    height: usize,
    data: Vec<[u8; 3]>,
}

impl ColorImage {
    /// Create a color image.
    pub fn new(width: usize, height: usize, data: Vec<[u8; 3]>) -> Result<Self, RegistrationError> {
        if data.len() != width * height {
            return Err(RegistrationError::MismatchedLengths {
                left_name: "color data",
                left_len: data.len(),
                right_name: "width * height",
                right_len: width * height,
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Color at the pixel containing `(u, v)`.
    pub fn get(&self, u: f64, v: f64) -> Option<[u8; 3]> {
        if !(u >= 0.0 && v >= 0.0) {
            return None;
        }
        let (x, y) = (u as usize, v as usize);
        (x < self.width && y < self.height).then(|| self.data[y * self.width + x])
    }
}

/// Keypoints, descriptors and images of one RGB-D frame.
#[derive(Debug, Clone)]
pub struct KeyframeBundle {
    /// Keypoint pixel positions `[u, v]`.
    pub keypoints: Vec<[f64; 2]>,
    /// One descriptor per keypoint.
    pub descriptors: Vec<Descriptor>,
    /// Depth map registered to the color image.
    pub depth: DepthImage,
    /// Optional color image.
    pub color: Option<ColorImage>,
}

impl KeyframeBundle {
    /// Create a bundle, checking that keypoints and descriptors are parallel
    /// and that the color image matches the depth resolution.
    pub fn new(
        keypoints: Vec<[f64; 2]>,
        descriptors: Vec<Descriptor>,
        depth: DepthImage,
        color: Option<ColorImage>,
    ) -> Result<Self, RegistrationError> {
        if keypoints.len() != descriptors.len() {
            return Err(RegistrationError::MismatchedLengths {
                left_name: "keypoints",
                left_len: keypoints.len(),
                right_name: "descriptors",
                right_len: descriptors.len(),
            });
        }
        if let Some(color) = &color {
            if color.width != depth.width || color.height != depth.height {
                return Err(RegistrationError::InvalidInput(format!(
                    "color image {}x{} does not match depth {}x{}",
                    color.width, color.height, depth.width, depth.height
                )));
            }
        }
        Ok(Self {
            keypoints,
            descriptors,
            depth,
            color,
        })
    }

    /// Back-project keypoint `idx` to a camera-frame 3D point.
    pub fn backproject(&self, idx: usize, intrinsic: &PinholeCameraIntrinsic) -> Option<[f64; 3]> {
        let kp = self.keypoints.get(idx)?;
        backproject_keypoint(&self.depth, intrinsic, *kp)
    }
}

/// A match between keypoint `query_idx` of the source and `train_idx` of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureMatch {
    /// Index into the source (query) keypoints.
    pub query_idx: usize,
    /// Index into the target (train) keypoints.
    pub train_idx: usize,
    /// Hamming distance between the two descriptors.
    pub distance: u32,
}

/// Matches two descriptor sets.
pub trait DescriptorMatcher {
    /// Return matches from `query` into `train`, in query order.
    fn match_descriptors(&self, query: &[Descriptor], train: &[Descriptor]) -> Vec<FeatureMatch>;
}

/// Brute-force Hamming nearest-neighbour matcher.
///
/// With cross-check enabled a pair is kept only when each descriptor is the
/// other's nearest neighbour.
#[derive(Debug, Clone, Copy)]
pub struct HammingMatcher {
    /// Keep only mutual nearest neighbours.
    pub cross_check: bool,
}

impl Default for HammingMatcher {
    fn default() -> Self {
        Self { cross_check: true }
    }
}

impl DescriptorMatcher for HammingMatcher {
    fn match_descriptors(&self, query: &[Descriptor], train: &[Descriptor]) -> Vec<FeatureMatch> {
        if query.is_empty() || train.is_empty() {
            return Vec::new();
        }
        let forward: Vec<(usize, u32)> = query.par_iter().map(|q| nearest(q, train)).collect();
        let backward: Vec<usize> = if self.cross_check {
            train.par_iter().map(|t| nearest(t, query).0).collect()
        } else {
            Vec::new()
        };

        forward
            .into_iter()
            .enumerate()
            .filter(|&(q, (t, _))| !self.cross_check || backward[t] == q)
            .map(|(q, (t, distance))| FeatureMatch {
                query_idx: q,
                train_idx: t,
                distance,
            })
            .collect()
    }
}

/// Number of differing bits between two descriptors.
pub fn hamming_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

// lowest index wins ties
fn nearest(d: &Descriptor, candidates: &[Descriptor]) -> (usize, u32) {
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| (i, hamming_distance(d, c)))
        .fold((0, u32::MAX), |best, cur| if cur.1 < best.1 { cur } else { best })
}

/// Lift a keypoint to 3D, or `None` if its depth is missing, non-positive or
/// NaN, or the keypoint lies outside the depth map.
pub fn backproject_keypoint(
    depth: &DepthImage,
    intrinsic: &PinholeCameraIntrinsic,
    keypoint: [f64; 2],
) -> Option<[f64; 3]> {
    let d = depth.get(keypoint[0], keypoint[1])?;
    if !(d.is_finite() && d > 0.0) {
        return None;
    }
    Some(
        intrinsic
            .backproject(keypoint[0], keypoint[1], d as f64)
            .to_array(),
    )
}

/// 3D source points paired with 2D target pixels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointPixelPairs {
    /// Back-projected source points, camera frame of the source.
    pub points: Vec<[f64; 3]>,
    /// Target keypoint pixels.
    pub pixels: Vec<[f64; 2]>,
    /// Index into the input match list for every surviving pair.
    pub match_indices: Vec<usize>,
}

/// 3D source points paired with 3D target points.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointPointPairs {
    /// Back-projected source points.
    pub source: Vec<[f64; 3]>,
    /// Back-projected target points.
    pub target: Vec<[f64; 3]>,
    /// Optional source colors sampled from the source color image.
    pub colors: Option<Vec<[u8; 3]>>,
    /// Index into the input match list for every surviving pair.
    pub match_indices: Vec<usize>,
}

/// Build 3D-2D pairs: source keypoints are back-projected, target keypoints stay in pixels.
pub fn point_pixel_pairs(
    source: &KeyframeBundle,
    target: &KeyframeBundle,
    matches: &[FeatureMatch],
    intrinsic: &PinholeCameraIntrinsic,
) -> PointPixelPairs {
    let mut out = PointPixelPairs::default();
    for (i, m) in matches.iter().enumerate() {
        let Some(pixel) = target.keypoints.get(m.train_idx) else {
            continue;
        };
        if let Some(p) = source.backproject(m.query_idx, intrinsic) {
            out.points.push(p);
            out.pixels.push(*pixel);
            out.match_indices.push(i);
        }
    }
    out
}

/// Build 3D-3D pairs: both keypoints are back-projected and a pair survives
/// only if both depths are valid.
pub fn point_point_pairs(
    source: &KeyframeBundle,
    target: &KeyframeBundle,
    matches: &[FeatureMatch],
    intrinsic: &PinholeCameraIntrinsic,
) -> PointPointPairs {
    let mut out = PointPointPairs {
        colors: source.color.as_ref().map(|_| Vec::new()),
        ..Default::default()
    };
    for (i, m) in matches.iter().enumerate() {
        let (Some(s), Some(t)) = (
            source.backproject(m.query_idx, intrinsic),
            target.backproject(m.train_idx, intrinsic),
        ) else {
            continue;
        };
        out.source.push(s);
        out.target.push(t);
        out.match_indices.push(i);
        if let (Some(colors), Some(image)) = (out.colors.as_mut(), source.color.as_ref()) {
            let kp = source.keypoints[m.query_idx];
            colors.push(image.get(kp[0], kp[1]).unwrap_or_default());
        }
    }
    out
}

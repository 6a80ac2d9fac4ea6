use kiddo::immutable::float::kdtree::ImmutableKdTree;
use rayon::prelude::*;

/// A set of (source index, target index) pairs with their squared distances.
///
/// Every source index appears at most once and the pairs are sorted by source
/// index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrespondenceSet {
    pairs: Vec<[usize; 2]>,
    squared_distances: Vec<f64>,
}

impl CorrespondenceSet {
    /// Build a set from explicit pairs, computing squared distances from the point sets.
    ///
    /// Pairs that reference an index outside either point set are dropped. The
    /// result is sorted by source index; when a source index is paired more than
    /// once only its closest target is kept.
    pub fn from_pairs(pairs: &[[usize; 2]], source: &[[f64; 3]], target: &[[f64; 3]]) -> Self {
        let mut valid: Vec<([usize; 2], f64)> = pairs
            .iter()
            .filter(|[s, t]| *s < source.len() && *t < target.len())
            .map(|&[s, t]| ([s, t], squared_distance(&source[s], &target[t])))
            .collect();
        valid.sort_by(|(a, da), (b, db)| a[0].cmp(&b[0]).then(da.total_cmp(db)));
        valid.dedup_by_key(|(pair, _)| pair[0]);

        let (pairs, squared_distances) = valid.into_iter().unzip();
        Self {
            pairs,
            squared_distances,
        }
    }

    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether the set holds no pairs.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// The `[source, target]` index pairs.
    pub fn pairs(&self) -> &[[usize; 2]] {
        &self.pairs
    }

    /// Squared distances, parallel to [`CorrespondenceSet::pairs`].
    pub fn squared_distances(&self) -> &[f64] {
        &self.squared_distances
    }

    /// Root mean square of the pair distances, zero for an empty set.
    pub fn rmse(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        (self.squared_distances.iter().sum::<f64>() / self.len() as f64).sqrt()
    }
}

/// Nearest-neighbour correspondence search over a fixed target cloud.
///
/// The kd-tree over the target is built once and reused for every query, so
/// the ICP loop pays for it a single time while the source moves.
#[derive(Default)]
pub struct CorrespondenceFinder {
    tree: Option<ImmutableKdTree<f64, u32, 3, 32>>,
}

impl CorrespondenceFinder {
    /// Index the target points.
    pub fn new(target: &[[f64; 3]]) -> Self {
        let tree = if target.is_empty() {
            None
        } else {
            Some(ImmutableKdTree::new_from_slice(target))
        };
        Self { tree }
    }

    /// For each source point find its nearest target point and keep the pair
    /// if the distance is at most `max_distance`.
    ///
    /// The search runs in parallel over the source points; the output order
    /// follows the source order and is deterministic.
    pub fn find(&self, source: &[[f64; 3]], max_distance: f64) -> CorrespondenceSet {
        let Some(tree) = &self.tree else {
            return CorrespondenceSet::default();
        };
        let max_sq = max_distance * max_distance;

        let (pairs, squared_distances) = source
            .par_iter()
            .enumerate()
            .filter_map(|(i, p)| {
                let nn = tree.nearest_one::<kiddo::SquaredEuclidean>(p);
                (nn.distance <= max_sq).then_some(([i, nn.item as usize], nn.distance))
            })
            .unzip();

        CorrespondenceSet {
            pairs,
            squared_distances,
        }
    }
}

/// Find nearest-neighbour correspondences from `source` into `target` within `max_distance`.
pub fn find_correspondences(
    source: &[[f64; 3]],
    target: &[[f64; 3]],
    max_distance: f64,
) -> CorrespondenceSet {
    CorrespondenceFinder::new(target).find(source, max_distance)
}

fn squared_distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)
}

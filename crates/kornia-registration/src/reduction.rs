//! Group-then-global parallel reduction of fixed-width vectors.
//!
//! The domain is split into work groups of [`GROUP_SIZE`] lanes (16x16 tiles
//! for 2D buffers, runs of 256 consecutive elements for 1D launches). Every
//! group reduces its lanes locally and the group results are combined into a
//! single vector of width `W`. Groups run on the rayon thread pool; a launch
//! returns only after every group has been combined, so the caller never sees
//! a partial accumulator.
//!
//! Lanes that fall outside the domain, or that the kernel marks as invalid,
//! contribute a zero vector.

use std::sync::atomic::{AtomicU64, Ordering};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::RegistrationError;

/// Side length of a 2D work group.
pub const GROUP_DIM: usize = 16;

/// Number of lanes in a work group.
pub const GROUP_SIZE: usize = GROUP_DIM * GROUP_DIM;

/// Number of lanes that cooperate in the shuffle fast path.
pub const WARP_SIZE: usize = 32;

/// How lanes are reduced inside a group and how groups are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReductionMethod {
    /// Tree halving inside each group, then every group result is merged once.
    #[default]
    Tree,
    /// Butterfly shuffle over 32-lane warps, then the group results are merged once.
    WarpShuffle,
    /// Tree halving inside each group, then atomic adds into one global accumulator.
    ///
    /// The combine order depends on scheduling, so results can differ from the
    /// other methods in the last bits.
    Atomic,
}

/// A dense 2D buffer of per-element vectors with an optional validity mask.
#[derive(Debug, Clone)]
pub struct ReductionBuffer<const W: usize> {
    width: usize,
    height: usize,
    data: Vec<[f64; W]>,
    mask: Option<Vec<bool>>,
}

impl<const W: usize> ReductionBuffer<W> {
    /// Create a buffer from row-major data of size `width * height`.
    pub fn new(width: usize, height: usize, data: Vec<[f64; W]>) -> Result<Self, RegistrationError> {
        if data.len() != width * height {
            return Err(RegistrationError::MismatchedLengths {
                left_name: "data",
                left_len: data.len(),
                right_name: "width * height",
                right_len: width * height,
            });
        }
        Ok(Self {
            width,
            height,
            data,
            mask: None,
        })
    }

    /// Attach a row-major validity mask; elements with `false` contribute zero.
    pub fn with_mask(mut self, mask: Vec<bool>) -> Result<Self, RegistrationError> {
        if mask.len() != self.data.len() {
            return Err(RegistrationError::MismatchedLengths {
                left_name: "mask",
                left_len: mask.len(),
                right_name: "data",
                right_len: self.data.len(),
            });
        }
        self.mask = Some(mask);
        Ok(self)
    }

    /// Buffer width.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Buffer height.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Element at `(x, y)` if it is inside the buffer and valid.
    pub fn get(&self, x: usize, y: usize) -> Option<[f64; W]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = y * self.width + x;
        match &self.mask {
            Some(mask) if !mask[idx] => None,
            _ => Some(self.data[idx]),
        }
    }
}

/// Sum every valid element of a 2D buffer.
///
/// This is the full-image reduction: 16x16 tiles are reduced locally and the
/// tile results are combined with `method`.
pub fn reduce_sum_2d<const W: usize>(
    buffer: &ReductionBuffer<W>,
    method: ReductionMethod,
) -> [f64; W] {
    launch_reduction_2d(buffer.width, buffer.height, method, |x, y| buffer.get(x, y))
}

/// Launch a reduction over a `width x height` domain.
///
/// `kernel` is evaluated once per element and returns `None` for elements that
/// must not contribute.
pub fn launch_reduction_2d<const W: usize, F>(
    width: usize,
    height: usize,
    method: ReductionMethod,
    kernel: F,
) -> [f64; W]
where
    F: Fn(usize, usize) -> Option<[f64; W]> + Sync,
{
    let groups_x = width.div_ceil(GROUP_DIM);
    let groups_y = height.div_ceil(GROUP_DIM);

    run_groups(groups_x * groups_y, method, |group, lane| {
        let x = (group % groups_x) * GROUP_DIM + lane % GROUP_DIM;
        let y = (group / groups_x) * GROUP_DIM + lane / GROUP_DIM;
        if x < width && y < height {
            kernel(x, y)
        } else {
            None
        }
    })
}

/// Launch a reduction over `n` elements, one lane per element.
pub fn launch_reduction<const W: usize, F>(n: usize, method: ReductionMethod, kernel: F) -> [f64; W]
where
    F: Fn(usize) -> Option<[f64; W]> + Sync,
{
    run_groups(n.div_ceil(GROUP_SIZE), method, |group, lane| {
        let idx = group * GROUP_SIZE + lane;
        if idx < n {
            kernel(idx)
        } else {
            None
        }
    })
}

fn run_groups<const W: usize, F>(num_groups: usize, method: ReductionMethod, load: F) -> [f64; W]
where
    F: Fn(usize, usize) -> Option<[f64; W]> + Sync,
{
    let load_lanes = |group: usize| -> Vec<[f64; W]> {
        (0..GROUP_SIZE)
            .map(|lane| load(group, lane).unwrap_or([0.0; W]))
            .collect()
    };

    match method {
        ReductionMethod::Tree => (0..num_groups)
            .into_par_iter()
            .map(|group| tree_reduce(&mut load_lanes(group)))
            .reduce(|| [0.0; W], add),
        ReductionMethod::WarpShuffle => (0..num_groups)
            .into_par_iter()
            .map(|group| warp_shuffle_reduce(&load_lanes(group)))
            .reduce(|| [0.0; W], add),
        ReductionMethod::Atomic => {
            let total: [AtomicF64; W] = std::array::from_fn(|_| AtomicF64::new(0.0));
            (0..num_groups).into_par_iter().for_each(|group| {
                let partial = tree_reduce(&mut load_lanes(group));
                for (acc, v) in total.iter().zip(partial.iter()) {
                    acc.fetch_add(*v);
                }
            });
            // for_each returned, every group has been combined
            std::array::from_fn(|i| total[i].load())
        }
    }
}

/// Tree-halving reduction of a power-of-two number of lanes.
///
/// At each step the first half of the active lanes adds the value of the
/// matching lane in the second half, so no lane reads a value written in the
/// same step.
fn tree_reduce<const W: usize>(lanes: &mut [[f64; W]]) -> [f64; W] {
    debug_assert!(lanes.len().is_power_of_two());
    let mut active = lanes.len() / 2;
    while active > 0 {
        let (lo, hi) = lanes.split_at_mut(active);
        for (a, b) in lo.iter_mut().zip(hi.iter()) {
            *a = add(*a, *b);
        }
        active /= 2;
    }
    lanes.first().copied().unwrap_or([0.0; W])
}

/// Reduce a group with butterfly shuffles over 32-lane warps.
///
/// Every warp exchanges registers with `lane ^ offset` for offsets 16..1, after
/// which every lane holds the warp total. The first warp then shuffles the
/// per-warp totals the same way.
fn warp_shuffle_reduce<const W: usize>(lanes: &[[f64; W]]) -> [f64; W] {
    let mut warp_totals = [[0.0; W]; WARP_SIZE];
    for (total, warp) in warp_totals.iter_mut().zip(lanes.chunks(WARP_SIZE)) {
        let mut regs = [[0.0; W]; WARP_SIZE];
        regs[..warp.len()].copy_from_slice(warp);
        *total = butterfly(regs);
    }
    butterfly(warp_totals)
}

fn butterfly<const W: usize>(mut regs: [[f64; W]; WARP_SIZE]) -> [f64; W] {
    let mut offset = WARP_SIZE / 2;
    while offset > 0 {
        // all lanes read before any lane writes
        let snapshot = regs;
        for (lane, reg) in regs.iter_mut().enumerate() {
            *reg = add(*reg, snapshot[lane ^ offset]);
        }
        offset /= 2;
    }
    regs[0]
}

#[inline]
fn add<const W: usize>(mut a: [f64; W], b: [f64; W]) -> [f64; W] {
    for (x, y) in a.iter_mut().zip(b.iter()) {
        *x += y;
    }
    a
}

/// An `f64` that supports atomic addition through a compare-and-swap loop.
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    /// Create a new atomic value.
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    /// Add `value` and return the previous value.
    pub fn fetch_add(&self, value: f64) -> f64 {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(prev) => return f64::from_bits(prev),
                Err(actual) => current = actual,
            }
        }
    }

    /// Read the current value.
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }
}

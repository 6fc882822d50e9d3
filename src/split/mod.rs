//! Split finding: evaluates numeric and categorical candidates from node
//! histograms and selects the best under the regularization constraints.
//!
//! The missing bin (index 0) is tried on both sides of every candidate; the
//! winning side becomes the node's default routing for missing values at
//! inference. Ties break deterministically: higher gain, then lower feature
//! index, then lower candidate ordinal.

use crate::histogram::{GradPair, Histogram, HistogramLayout};

// ============================================================================
// SplitParams
// ============================================================================

/// Regularization and constraint parameters for gain computation.
#[derive(Debug, Clone, Copy)]
pub struct SplitParams {
    pub reg_lambda: f64,
    pub reg_alpha: f64,
    /// Gamma, subtracted from every gain.
    pub min_gain: f64,
    /// Minimum hessian sum per child.
    pub min_node_hess: f64,
    /// Categorical bipartitions are enumerated exhaustively up to this many
    /// populated bins; beyond it, bins are sorted by gradient/hessian ratio
    /// and scanned like a numeric feature.
    pub max_brute_bins: u32,
}

impl Default for SplitParams {
    fn default() -> Self {
        Self {
            reg_lambda: 1.0,
            reg_alpha: 0.0,
            min_gain: 0.0,
            min_node_hess: 0.0,
            max_brute_bins: 10,
        }
    }
}

/// L1 soft threshold: `sign(g) * max(0, |g| - alpha)`.
#[inline]
pub fn soft_threshold(g: f64, alpha: f64) -> f64 {
    if g > alpha {
        g - alpha
    } else if g < -alpha {
        g + alpha
    } else {
        0.0
    }
}

impl SplitParams {
    /// Score term `S(g, h) = soft(g, alpha)^2 / (h + lambda)`.
    ///
    /// Returns `None` when the denominator is non-positive or the result is
    /// not finite; such candidates are silently demoted to "no split".
    #[inline]
    fn score(&self, g: f64, h: f64) -> Option<f64> {
        let denom = h + self.reg_lambda;
        if denom <= 0.0 {
            return None;
        }
        let t = soft_threshold(g, self.reg_alpha);
        let s = t * t / denom;
        s.is_finite().then_some(s)
    }

    /// Optimal leaf weight `-soft(g, alpha) / (h + lambda)`, zero when
    /// numerically degenerate.
    #[inline]
    pub fn leaf_weight(&self, g: f64, h: f64) -> f64 {
        let denom = h + self.reg_lambda;
        if denom <= 0.0 {
            return 0.0;
        }
        let w = -soft_threshold(g, self.reg_alpha) / denom;
        if w.is_finite() {
            w
        } else {
            0.0
        }
    }

    /// Gain of splitting `parent` into `left` and `right`, or `None` when the
    /// candidate violates `min_node_hess`, leaves a child without any mass,
    /// or is numerically degenerate.
    #[inline]
    pub fn gain(&self, left: GradPair, right: GradPair, parent: GradPair) -> Option<f64> {
        if left.1 < self.min_node_hess || right.1 < self.min_node_hess {
            return None;
        }
        if (left.0 == 0.0 && left.1 == 0.0) || (right.0 == 0.0 && right.1 == 0.0) {
            return None;
        }
        let s_left = self.score(left.0, left.1)?;
        let s_right = self.score(right.0, right.1)?;
        let s_parent = self.score(parent.0, parent.1)?;
        let gain = 0.5 * (s_left + s_right - s_parent) - self.min_gain;
        gain.is_finite().then_some(gain)
    }
}

// ============================================================================
// SplitInfo
// ============================================================================

/// How a committed split routes non-missing bins.
#[derive(Debug, Clone, PartialEq)]
pub enum SplitKind {
    /// Go left when `bin <= threshold`.
    Numeric { threshold: u32 },
    /// Go left when the bin code is in `left` (sorted ascending).
    Categorical { left: Vec<u32> },
}

/// A selected split with the statistics needed to create its children.
#[derive(Debug, Clone)]
pub struct SplitInfo {
    pub feature: u32,
    pub kind: SplitKind,
    /// Routing for the missing bin, learned from the winning candidate.
    pub default_left: bool,
    pub gain: f64,
    /// Left child stats, missing included when routed left.
    pub left: GradPair,
    /// Right child stats, missing included when routed right.
    pub right: GradPair,
    /// Candidate ordinal within its feature; tie-break only.
    pub(crate) position: u64,
}

impl SplitInfo {
    /// Route one bin value.
    #[inline]
    pub fn goes_left(&self, bin: u32) -> bool {
        if bin == 0 {
            return self.default_left;
        }
        match &self.kind {
            SplitKind::Numeric { threshold } => bin <= *threshold,
            SplitKind::Categorical { left } => left.binary_search(&bin).is_ok(),
        }
    }

    /// `true` when `self` is preferred over `other` under the deterministic
    /// ordering: gain desc, feature asc, candidate ordinal asc.
    fn beats(&self, other: &SplitInfo) -> bool {
        if self.gain != other.gain {
            return self.gain > other.gain;
        }
        if self.feature != other.feature {
            return self.feature < other.feature;
        }
        self.position < other.position
    }
}

// ============================================================================
// Split search
// ============================================================================

/// Find the best split for one node.
///
/// `unordered[f]` marks set-split (categorical) columns; numeric and rank
/// columns scan bins in order. Returns `None` when no candidate clears
/// `min_gain` and the degeneracy checks.
pub fn find_best_split(
    hist: &Histogram,
    layout: &HistogramLayout,
    unordered: &[bool],
    params: &SplitParams,
) -> Option<SplitInfo> {
    let parent = hist.total(layout);
    let mut best: Option<SplitInfo> = None;

    for (k, &feature) in layout.features().iter().enumerate() {
        let bins = hist.feature(layout, k);
        let candidate = if unordered[feature as usize] {
            best_categorical(feature, bins, parent, params)
        } else {
            best_ordered(feature, bins, parent, params)
        };
        if let Some(c) = candidate {
            if best.as_ref().map_or(true, |b| c.beats(b)) {
                best = Some(c);
            }
        }
    }
    // Gain already carries the -min_gain term; zero qualifies.
    best.filter(|s| s.gain >= 0.0)
}

/// Try a (left, right) candidate with the missing stats on each side, keeping
/// whichever clears the checks and scores higher. `make_kind` builds the
/// routing payload shared by both variants.
#[allow(clippy::too_many_arguments)]
fn try_candidate(
    feature: u32,
    left_nm: GradPair,
    right_nm: GradPair,
    missing: GradPair,
    parent: GradPair,
    params: &SplitParams,
    ordinal: u64,
    make_kind: impl Fn() -> SplitKind,
    best: &mut Option<SplitInfo>,
) {
    for (variant, default_left) in [(0u64, true), (1u64, false)] {
        let (left, right) = if default_left {
            (
                (left_nm.0 + missing.0, left_nm.1 + missing.1),
                right_nm,
            )
        } else {
            (
                left_nm,
                (right_nm.0 + missing.0, right_nm.1 + missing.1),
            )
        };
        let Some(gain) = params.gain(left, right, parent) else {
            continue;
        };
        let candidate = SplitInfo {
            feature,
            kind: make_kind(),
            default_left,
            gain,
            left,
            right,
            position: ordinal * 2 + variant,
        };
        if best.as_ref().map_or(true, |b| candidate.beats(b)) {
            *best = Some(candidate);
        }
    }
}

/// Left-to-right prefix scan over ordered bins.
fn best_ordered(
    feature: u32,
    bins: &[GradPair],
    parent: GradPair,
    params: &SplitParams,
) -> Option<SplitInfo> {
    let n_bins = bins.len();
    if n_bins < 3 {
        return None;
    }
    let missing = bins[0];
    let total_nm = bins[1..]
        .iter()
        .fold((0.0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1));

    let mut best = None;
    let mut left = (0.0, 0.0);
    for p in 1..n_bins - 1 {
        left.0 += bins[p].0;
        left.1 += bins[p].1;
        let right = (total_nm.0 - left.0, total_nm.1 - left.1);
        try_candidate(
            feature,
            left,
            right,
            missing,
            parent,
            params,
            p as u64,
            || SplitKind::Numeric {
                threshold: p as u32,
            },
            &mut best,
        );
    }
    best
}

/// Categorical search: exhaustive bipartitions for small cardinalities,
/// otherwise a one-dimensional embedding by gradient/hessian ratio scanned
/// like an ordered feature.
fn best_categorical(
    feature: u32,
    bins: &[GradPair],
    parent: GradPair,
    params: &SplitParams,
) -> Option<SplitInfo> {
    let missing = bins[0];
    // Populated non-missing bins only; empty categories route with missing.
    let cats: Vec<u32> = (1..bins.len() as u32)
        .filter(|&b| {
            let (g, h) = bins[b as usize];
            g != 0.0 || h != 0.0
        })
        .collect();
    if cats.len() < 2 {
        return None;
    }

    let total_nm = cats.iter().fold((0.0, 0.0), |a, &b| {
        (a.0 + bins[b as usize].0, a.1 + bins[b as usize].1)
    });

    let mut best = None;
    if cats.len() <= params.max_brute_bins as usize {
        // Enumerate every non-trivial bipartition; the last category is
        // pinned right so each pair is visited once.
        let n_free = cats.len() - 1;
        for mask in 1u64..(1u64 << n_free) {
            let mut left_set: Vec<u32> = Vec::with_capacity(cats.len());
            let mut left = (0.0, 0.0);
            for (i, &c) in cats[..n_free].iter().enumerate() {
                if mask >> i & 1 == 1 {
                    left_set.push(c);
                    left.0 += bins[c as usize].0;
                    left.1 += bins[c as usize].1;
                }
            }
            let right = (total_nm.0 - left.0, total_nm.1 - left.1);
            try_candidate(
                feature,
                left,
                right,
                missing,
                parent,
                params,
                mask,
                || SplitKind::Categorical {
                    left: left_set.clone(),
                },
                &mut best,
            );
        }
    } else {
        // Sort by g/h ratio, then prefix-scan the sorted order.
        let mut order = cats.clone();
        order.sort_by(|&a, &b| {
            let (ga, ha) = bins[a as usize];
            let (gb, hb) = bins[b as usize];
            let ra = ga / ha.max(1e-12);
            let rb = gb / hb.max(1e-12);
            ra.partial_cmp(&rb).unwrap().then(a.cmp(&b))
        });

        let mut left = (0.0, 0.0);
        for p in 1..order.len() {
            let c = order[p - 1];
            left.0 += bins[c as usize].0;
            left.1 += bins[c as usize].1;
            let right = (total_nm.0 - left.0, total_nm.1 - left.1);
            let mut left_set: Vec<u32> = order[..p].to_vec();
            left_set.sort_unstable();
            try_candidate(
                feature,
                left,
                right,
                missing,
                parent,
                params,
                p as u64,
                || SplitKind::Categorical {
                    left: left_set.clone(),
                },
                &mut best,
            );
        }
    }
    best
}

//! Histogram engine: per-(node, feature, bin) gradient/hessian sums.
//!
//! Bins accumulate in `f64` regardless of the configured gradient storage
//! precision; the subtraction trick makes small differences of large sums
//! common, and gain computation cannot afford the drift.
//!
//! Two build paths cover the two partitioning regimes:
//! - **horizontal** (row partitions): every partition accumulates a local
//!   histogram for each target node, then a deterministic tree-reduce sums
//!   them;
//! - **vertical** (column shards): gradients are allgathered into global row
//!   order once per level and every shard fills the slots of its own columns,
//!   which are disjoint ranges of the shared layout.

use rayon::prelude::*;

use crate::data::{BinIndex, BinnedDataset, ColumnShard, GradFloat};
use crate::exec::tree_reduce;

/// One histogram slot: (gradient sum, hessian sum).
pub type GradPair = (f64, f64);

// ============================================================================
// Gradients
// ============================================================================

/// Per-partition gradient/hessian blocks, column-major by output.
///
/// `grad[output * n_rows + row]` inside each block; blocks align with the
/// partitions of the binned dataset they were computed from.
#[derive(Debug, Clone)]
pub struct GradientBlock<F: GradFloat> {
    grad: Vec<F>,
    hess: Vec<F>,
    n_rows: usize,
}

impl<F: GradFloat> GradientBlock<F> {
    pub fn zeros(n_rows: usize, raw_size: usize) -> Self {
        Self {
            grad: vec![F::default(); n_rows * raw_size],
            hess: vec![F::default(); n_rows * raw_size],
            n_rows,
        }
    }

    #[inline]
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    #[inline]
    pub fn output(&self, output: usize) -> (&[F], &[F]) {
        let lo = output * self.n_rows;
        let hi = lo + self.n_rows;
        (&self.grad[lo..hi], &self.hess[lo..hi])
    }

    #[inline]
    pub fn set(&mut self, local_row: usize, output: usize, grad: f64, hess: f64) {
        let i = output * self.n_rows + local_row;
        self.grad[i] = F::from_f64(grad);
        self.hess[i] = F::from_f64(hess);
    }
}

/// Gradients for the whole dataset, one block per partition.
#[derive(Debug, Clone)]
pub struct Gradients<F: GradFloat> {
    blocks: Vec<GradientBlock<F>>,
    raw_size: usize,
}

impl<F: GradFloat> Gradients<F> {
    pub fn new(blocks: Vec<GradientBlock<F>>, raw_size: usize) -> Self {
        Self { blocks, raw_size }
    }

    #[inline]
    pub fn raw_size(&self) -> usize {
        self.raw_size
    }

    #[inline]
    pub fn blocks(&self) -> &[GradientBlock<F>] {
        &self.blocks
    }

    /// Gather one output's (grad, hess) pairs into global row order, the
    /// layout the vertical path broadcasts to every column shard.
    pub fn allgather_output(&self, output: usize) -> (Vec<f64>, Vec<f64>) {
        let n: usize = self.blocks.iter().map(|b| b.n_rows).sum();
        let mut grad = Vec::with_capacity(n);
        let mut hess = Vec::with_capacity(n);
        for block in &self.blocks {
            let (g, h) = block.output(output);
            grad.extend(g.iter().map(|v| v.to_f64()));
            hess.extend(h.iter().map(|v| v.to_f64()));
        }
        (grad, hess)
    }
}

// ============================================================================
// Layout
// ============================================================================

/// Bin offsets for a selected feature subset.
///
/// Shared by every node histogram of one (tree, level); selection order is
/// ascending feature id, so layouts built from the same subset are identical
/// across partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramLayout {
    features: Vec<u32>,
    /// `offsets[k]..offsets[k+1]` are the slots of `features[k]`.
    offsets: Vec<u32>,
}

impl HistogramLayout {
    pub fn new(features: Vec<u32>, num_bins: &[u32]) -> Self {
        debug_assert!(features.windows(2).all(|w| w[0] < w[1]));
        let mut offsets = Vec::with_capacity(features.len() + 1);
        let mut acc = 0u32;
        offsets.push(0);
        for &f in &features {
            acc += num_bins[f as usize];
            offsets.push(acc);
        }
        Self { features, offsets }
    }

    #[inline]
    pub fn features(&self) -> &[u32] {
        &self.features
    }

    #[inline]
    pub fn n_slots(&self) -> usize {
        *self.offsets.last().unwrap_or(&0) as usize
    }

    /// Slot range of the k-th selected feature.
    #[inline]
    pub fn range(&self, k: usize) -> std::ops::Range<usize> {
        self.offsets[k] as usize..self.offsets[k + 1] as usize
    }

    /// Position of a feature id within the selection, if selected.
    pub fn position(&self, feature: u32) -> Option<usize> {
        self.features.binary_search(&feature).ok()
    }
}

// ============================================================================
// Histogram
// ============================================================================

/// Node histogram over a shared [`HistogramLayout`].
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    bins: Vec<GradPair>,
}

impl Histogram {
    pub fn zeros(layout: &HistogramLayout) -> Self {
        Self {
            bins: vec![(0.0, 0.0); layout.n_slots()],
        }
    }

    /// Build from raw bin contents. Agreement with the layout's slot count is
    /// the caller's responsibility.
    pub fn from_bins(bins: Vec<GradPair>) -> Self {
        Self { bins }
    }

    #[inline]
    pub fn bins(&self) -> &[GradPair] {
        &self.bins
    }

    /// Slice of one selected feature's bins.
    #[inline]
    pub fn feature(&self, layout: &HistogramLayout, k: usize) -> &[GradPair] {
        &self.bins[layout.range(k)]
    }

    /// dst += src
    pub fn merge(&mut self, other: &Histogram) {
        debug_assert_eq!(self.bins.len(), other.bins.len());
        for (d, s) in self.bins.iter_mut().zip(&other.bins) {
            d.0 += s.0;
            d.1 += s.1;
        }
    }

    /// self -= child; yields the sibling of `child` under this parent.
    pub fn subtract(&mut self, child: &Histogram) {
        debug_assert_eq!(self.bins.len(), child.bins.len());
        for (d, s) in self.bins.iter_mut().zip(&child.bins) {
            d.0 -= s.0;
            d.1 -= s.1;
        }
    }

    pub fn clear(&mut self) {
        self.bins.fill((0.0, 0.0));
    }

    /// Node totals, read from the first feature's bins. Every feature's bins
    /// sum to the same pair, which is what enables the subtraction trick.
    pub fn total(&self, layout: &HistogramLayout) -> GradPair {
        if layout.features.is_empty() {
            return (0.0, 0.0);
        }
        let mut g = 0.0;
        let mut h = 0.0;
        for &(bg, bh) in self.feature(layout, 0) {
            g += bg;
            h += bh;
        }
        (g, h)
    }
}

/// Row slot value marking rows outside every active node.
pub const NO_NODE: u32 = u32::MAX;

// ============================================================================
// Horizontal build
// ============================================================================

/// One tree's histogram work for the current level.
///
/// Several concurrently grown trees batch their requests into a single data
/// pass: one parallel map over partitions, one tree-reduce.
pub struct BuildRequest<'t> {
    /// Global row id to node slot; [`NO_NODE`] rows are skipped.
    pub node_of: &'t [u32],
    /// Node slot to target position, `-1` for non-targets.
    pub target_of: &'t [i32],
    pub n_targets: usize,
    pub layout: &'t HistogramLayout,
    /// Which gradient output this tree trains on.
    pub output: usize,
}

/// Build aggregated histograms for every request in one pass over the
/// row-partitioned data. Results align with `requests`.
pub fn build_histograms_multi<B: BinIndex, F: GradFloat>(
    data: &BinnedDataset<B>,
    gradients: &Gradients<F>,
    requests: &[BuildRequest<'_>],
    aggregation_depth: u32,
) -> Vec<Vec<Histogram>> {
    let partials: Vec<Vec<Vec<Histogram>>> = data
        .partitions()
        .par_iter()
        .zip(gradients.blocks().par_iter())
        .map(|(part, block)| {
            requests
                .iter()
                .map(|req| {
                    let mut hists: Vec<Histogram> = (0..req.n_targets)
                        .map(|_| Histogram::zeros(req.layout))
                        .collect();
                    let (grad, hess) = block.output(req.output);
                    let nodes =
                        &req.node_of[part.row_offset()..part.row_offset() + part.n_rows()];

                    for (k, &f) in req.layout.features().iter().enumerate() {
                        let col = part.column(f as usize);
                        let base = req.layout.range(k).start;
                        for (row, &bin) in col.iter().enumerate() {
                            let node = nodes[row];
                            if node == NO_NODE {
                                continue;
                            }
                            let t = req.target_of[node as usize];
                            if t < 0 {
                                continue;
                            }
                            let slot = base + bin.to_u32() as usize;
                            let cell = &mut hists[t as usize].bins[slot];
                            cell.0 += grad[row].to_f64();
                            cell.1 += hess[row].to_f64();
                        }
                    }
                    hists
                })
                .collect()
        })
        .collect();

    tree_reduce(partials, aggregation_depth, |mut a, b| {
        for (xs, ys) in a.iter_mut().zip(&b) {
            for (x, y) in xs.iter_mut().zip(ys) {
                x.merge(y);
            }
        }
        a
    })
    .unwrap_or_else(|| {
        requests
            .iter()
            .map(|req| {
                (0..req.n_targets)
                    .map(|_| Histogram::zeros(req.layout))
                    .collect()
            })
            .collect()
    })
}

/// Single-tree convenience wrapper around [`build_histograms_multi`].
#[allow(clippy::too_many_arguments)]
pub fn build_histograms<B: BinIndex, F: GradFloat>(
    data: &BinnedDataset<B>,
    gradients: &Gradients<F>,
    output: usize,
    node_of: &[u32],
    target_of: &[i32],
    n_targets: usize,
    layout: &HistogramLayout,
    aggregation_depth: u32,
) -> Vec<Histogram> {
    build_histograms_multi(
        data,
        gradients,
        &[BuildRequest {
            node_of,
            target_of,
            n_targets,
            layout,
            output,
        }],
        aggregation_depth,
    )
    .pop()
    .unwrap()
}

// ============================================================================
// Vertical build
// ============================================================================

/// Build histograms from column shards and allgathered gradients.
///
/// `gathered_grad`/`gathered_hess` hold one output's values in global
/// `(partition, row ordinal)` order; shards write disjoint slot ranges of the
/// shared layout, so the per-shard results combine by addition.
#[allow(clippy::too_many_arguments)]
pub fn build_histograms_vertical<B: BinIndex>(
    shards: &[ColumnShard<B>],
    gathered_grad: &[f64],
    gathered_hess: &[f64],
    node_of: &[u32],
    target_of: &[i32],
    n_targets: usize,
    layout: &HistogramLayout,
) -> Vec<Histogram> {
    let partials: Vec<Vec<Histogram>> = shards
        .par_iter()
        .map(|shard| {
            let mut hists: Vec<Histogram> =
                (0..n_targets).map(|_| Histogram::zeros(layout)).collect();
            for (k_local, &f) in shard.columns().iter().enumerate() {
                let Some(k) = layout.position(f) else {
                    continue;
                };
                let col = shard.column(k_local);
                let base = layout.range(k).start;
                for (row, &bin) in col.iter().enumerate() {
                    let node = node_of[row];
                    if node == NO_NODE {
                        continue;
                    }
                    let t = target_of[node as usize];
                    if t < 0 {
                        continue;
                    }
                    let slot = base + bin.to_u32() as usize;
                    let cell = &mut hists[t as usize].bins[slot];
                    cell.0 += gathered_grad[row];
                    cell.1 += gathered_hess[row];
                }
            }
            hists
        })
        .collect();

    // Shards touch disjoint slots; a plain fold is already deterministic.
    let mut out: Vec<Histogram> = (0..n_targets).map(|_| Histogram::zeros(layout)).collect();
    for partial in partials {
        for (x, y) in out.iter_mut().zip(&partial) {
            x.merge(y);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{shard_columns, BinnedPartition};
    use std::sync::Arc;

    /// 6 rows over 2 partitions, 2 columns.
    fn dataset() -> BinnedDataset<u8> {
        let p0 = BinnedPartition::new(
            vec![1u8, 2, 1, 0, 1, 1], // col0: [1,2,1], col1: [0,1,1]
            vec![1.0; 3],
            vec![0.0; 3],
            0,
            2,
        );
        let p1 = BinnedPartition::new(
            vec![2u8, 1, 2, 2, 1, 2], // col0: [2,1,2], col1: [2,1,2]
            vec![1.0; 3],
            vec![0.0; 3],
            3,
            2,
        );
        BinnedDataset::new(vec![p0, p1], 1, Arc::new(vec![3, 3]))
    }

    fn gradients() -> Gradients<f64> {
        let mut b0 = GradientBlock::zeros(3, 1);
        let mut b1 = GradientBlock::zeros(3, 1);
        for row in 0..3 {
            b0.set(row, 0, (row + 1) as f64, 1.0);
            b1.set(row, 0, (row + 4) as f64, 1.0);
        }
        Gradients::new(vec![b0, b1], 1)
    }

    fn single_node_setup() -> (Vec<u32>, Vec<i32>, HistogramLayout) {
        let node_of = vec![0u32; 6];
        let target_of = vec![0i32];
        let layout = HistogramLayout::new(vec![0, 1], &[3, 3]);
        (node_of, target_of, layout)
    }

    #[test]
    fn layout_offsets() {
        let layout = HistogramLayout::new(vec![0, 2], &[4, 8, 3]);
        assert_eq!(layout.n_slots(), 7);
        assert_eq!(layout.range(0), 0..4);
        assert_eq!(layout.range(1), 4..7);
        assert_eq!(layout.position(2), Some(1));
        assert_eq!(layout.position(1), None);
    }

    #[test]
    fn horizontal_build_accumulates() {
        let data = dataset();
        let grads = gradients();
        let (node_of, target_of, layout) = single_node_setup();

        let hists = build_histograms(&data, &grads, 0, &node_of, &target_of, 1, &layout, 2);
        assert_eq!(hists.len(), 1);
        let h = &hists[0];

        // Column 0 bins: rows with bin1 = {0,2,4} grads {1,3,5}; bin2 = {1,3,5} grads {2,4,6}.
        let col0 = h.feature(&layout, 0);
        assert_eq!(col0[0], (0.0, 0.0));
        assert_eq!(col0[1], (9.0, 3.0));
        assert_eq!(col0[2], (12.0, 3.0));

        // Column 1 bins: bin0 = {row0}, bin1 = {1,2,4}, bin2 = {3,5}.
        let col1 = h.feature(&layout, 1);
        assert_eq!(col1[0], (1.0, 1.0));
        assert_eq!(col1[1], (10.0, 3.0));
        assert_eq!(col1[2], (10.0, 2.0));

        // Additivity: both columns sum to the node total.
        assert_eq!(h.total(&layout), (21.0, 6.0));
        let t1: GradPair = col1.iter().fold((0.0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1));
        assert_eq!(t1, (21.0, 6.0));
    }

    #[test]
    fn vertical_build_matches_horizontal() {
        let data = dataset();
        let grads = gradients();
        let (node_of, target_of, layout) = single_node_setup();

        let horizontal = build_histograms(&data, &grads, 0, &node_of, &target_of, 1, &layout, 2);

        let shards = shard_columns(&data, 2);
        let (g, h) = grads.allgather_output(0);
        let vertical =
            build_histograms_vertical(&shards, &g, &h, &node_of, &target_of, 1, &layout);

        assert_eq!(horizontal, vertical);
    }

    #[test]
    fn subtraction_recovers_sibling() {
        let data = dataset();
        let grads = gradients();
        let layout = HistogramLayout::new(vec![0, 1], &[3, 3]);

        // Parent: all rows in node 0.
        let parent = build_histograms(&data, &grads, 0, &[0; 6], &[0], 1, &layout, 2);

        // Children: rows 0..3 in node 1, rows 3..6 in node 2.
        let node_of = vec![1u32, 1, 1, 2, 2, 2];
        let both = build_histograms(&data, &grads, 0, &node_of, &[-1, 0, 1], 2, &layout, 2);

        let mut derived = parent[0].clone();
        derived.subtract(&both[0]);
        for (a, b) in derived.bins().iter().zip(both[1].bins()) {
            assert!((a.0 - b.0).abs() < 1e-9);
            assert!((a.1 - b.1).abs() < 1e-9);
        }
    }

    #[test]
    fn rows_outside_targets_are_skipped() {
        let data = dataset();
        let grads = gradients();
        let layout = HistogramLayout::new(vec![0], &[3, 3]);

        let mut node_of = vec![0u32; 6];
        node_of[0] = NO_NODE;
        node_of[5] = 7; // node 7 is not a target
        let mut target_of = vec![-1i32; 8];
        target_of[0] = 0;

        let hists = build_histograms(&data, &grads, 0, &node_of, &target_of, 1, &layout, 2);
        // Rows 0 and 5 excluded: total grad = 2+3+4+5 = 14.
        assert_eq!(hists[0].total(&layout), (14.0, 4.0));
    }

    #[test]
    fn gradient_block_layout() {
        let mut b = GradientBlock::<f32>::zeros(4, 2);
        b.set(1, 0, 1.5, 2.5);
        b.set(1, 1, -3.0, 4.0);
        let (g0, h0) = b.output(0);
        let (g1, h1) = b.output(1);
        assert_eq!(g0[1], 1.5);
        assert_eq!(h0[1], 2.5);
        assert_eq!(g1[1], -3.0);
        assert_eq!(h1[1], 4.0);
    }
}

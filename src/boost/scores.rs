//! Running raw-score maintenance across the partitioned dataset.
//!
//! GBTree stores one accumulated raw vector per row. DART additionally keeps
//! every tree's raw contribution per row, because dropout reweights already
//! appended trees and the accumulated prefix must then be rebuilt from the
//! per-tree parts.
//!
//! The score series is chained iteration over iteration; a [`Checkpointer`]
//! periodically materializes it into fresh buffers and drops the previous
//! checkpoint, bounding lineage growth.

use crate::data::GradFloat;
use crate::exec::ResourceRecorder;
use crate::logger::TrainingLogger;

/// Per-row raw scores for every partition of one dataset.
///
/// Row layout inside a partition buffer, stride = `raw_size + n_trees`:
/// accumulated raw values first, then (DART only) one raw value per tree.
#[derive(Debug, Clone, PartialEq)]
pub struct RawScores<F: GradFloat> {
    parts: Vec<Vec<F>>,
    part_sizes: Vec<usize>,
    raw_size: usize,
    /// Per-tree raw slots per row; stays 0 for GBTree.
    n_trees: usize,
    dart: bool,
}

impl<F: GradFloat> RawScores<F> {
    /// Initialize accumulated scores to the base score.
    pub fn new(part_sizes: &[usize], raw_size: usize, dart: bool, base: &[f64]) -> Self {
        debug_assert_eq!(base.len(), raw_size);
        let parts = part_sizes
            .iter()
            .map(|&n| {
                let mut buf = vec![F::default(); n * raw_size];
                for row in 0..n {
                    for (o, &b) in base.iter().enumerate() {
                        buf[row * raw_size + o] = F::from_f64(b);
                    }
                }
                buf
            })
            .collect();
        Self {
            parts,
            part_sizes: part_sizes.to_vec(),
            raw_size,
            n_trees: 0,
            dart,
        }
    }

    #[inline]
    pub fn raw_size(&self) -> usize {
        self.raw_size
    }

    #[inline]
    pub fn n_trees(&self) -> usize {
        self.n_trees
    }

    /// Whether per-tree raw contributions are stored (DART mode).
    #[inline]
    pub fn is_dart(&self) -> bool {
        self.dart
    }

    #[inline]
    fn stride(&self) -> usize {
        self.raw_size + self.n_trees
    }

    /// Accumulated raw vector of one row.
    #[inline]
    pub fn acc(&self, part: usize, row: usize) -> &[F] {
        let s = self.stride();
        &self.parts[part][row * s..row * s + self.raw_size]
    }

    /// Stored raw contribution of tree `j` for one row (DART only).
    #[inline]
    pub fn tree_raw(&self, part: usize, row: usize, tree: usize) -> f64 {
        let s = self.stride();
        self.parts[part][row * s + self.raw_size + tree].to_f64()
    }

    /// Add `delta` into the accumulated slot (GBTree path).
    #[inline]
    pub fn add_acc(&mut self, part: usize, row: usize, output: usize, delta: f64) {
        let s = self.stride();
        let slot = &mut self.parts[part][row * s + output];
        *slot = F::from_f64(slot.to_f64() + delta);
    }

    /// Effective raw score: the accumulated prefix minus the dropped trees'
    /// weighted contributions. With no dropout this is a plain copy.
    pub fn effective_into(
        &self,
        part: usize,
        row: usize,
        dropped_trees: &[usize],
        weights: &[f64],
        out: &mut [f64],
    ) {
        let acc = self.acc(part, row);
        for (o, slot) in out.iter_mut().enumerate() {
            *slot = acc[o].to_f64();
        }
        for &j in dropped_trees {
            let output = j % self.raw_size;
            out[output] -= weights[j] * self.tree_raw(part, row, j);
        }
    }

    /// Append per-tree raw contributions (DART path).
    ///
    /// `raws[t][part][row]` is new tree `t`'s raw value; rows are re-laid out
    /// with the widened stride. Accumulated slots are left untouched; call
    /// [`RawScores::rebuild_acc`] or add incrementally afterwards.
    pub fn append_tree_raws(&mut self, raws: &[Vec<Vec<f64>>]) {
        debug_assert!(self.dart);
        let n_new = raws.len();
        if n_new == 0 {
            return;
        }
        let old_stride = self.stride();
        let new_stride = old_stride + n_new;

        for (p, buf) in self.parts.iter_mut().enumerate() {
            let n_rows = self.part_sizes[p];
            let mut fresh = vec![F::default(); n_rows * new_stride];
            for row in 0..n_rows {
                let src = &buf[row * old_stride..(row + 1) * old_stride];
                let dst = &mut fresh[row * new_stride..(row + 1) * new_stride];
                dst[..old_stride].copy_from_slice(src);
                for (t, tree_raws) in raws.iter().enumerate() {
                    dst[old_stride + t] = F::from_f64(tree_raws[p][row]);
                }
            }
            *buf = fresh;
        }
        self.n_trees += n_new;
    }

    /// Rebuild every accumulated slot as `base + sum_j weights[j] * raw_j`,
    /// adding trees in index order (DART after reweighting).
    pub fn rebuild_acc(&mut self, base: &[f64], weights: &[f64]) {
        debug_assert!(self.dart);
        debug_assert_eq!(weights.len(), self.n_trees);
        let stride = self.stride();
        let raw_size = self.raw_size;

        for (p, buf) in self.parts.iter_mut().enumerate() {
            let n_rows = self.part_sizes[p];
            for row in 0..n_rows {
                let slice = &mut buf[row * stride..(row + 1) * stride];
                let mut acc: Vec<f64> = base.to_vec();
                for (j, &w) in weights.iter().enumerate() {
                    acc[j % raw_size] += w * slice[raw_size + j].to_f64();
                }
                for (o, &v) in acc.iter().enumerate() {
                    slice[o] = F::from_f64(v);
                }
            }
        }
    }

    /// Visit every row's full stride slice mutably, partition-parallel.
    pub fn for_each_row_mut<Func>(&mut self, f: Func)
    where
        Func: Fn(usize, usize, &mut [F]) + Sync,
    {
        use rayon::prelude::*;
        let stride = self.stride();
        self.parts.par_iter_mut().enumerate().for_each(|(p, buf)| {
            for (row, slice) in buf.chunks_exact_mut(stride).enumerate() {
                f(p, row, slice);
            }
        });
    }

    /// Materialize into fresh buffers, truncating the (conceptual) lineage
    /// chain. Values are unchanged.
    pub fn materialize(&mut self) -> Vec<Vec<F>> {
        let snapshot: Vec<Vec<F>> = self.parts.iter().cloned().collect();
        for (buf, fresh) in self.parts.iter_mut().zip(snapshot.iter()) {
            *buf = fresh.clone();
        }
        snapshot
    }

    pub fn part_sizes(&self) -> &[usize] {
        &self.part_sizes
    }
}

// ============================================================================
// Checkpointer
// ============================================================================

/// Materializes the raw-score series every `interval` iterations and drops
/// the previous checkpoint. A negative interval disables checkpointing.
pub struct Checkpointer<F: GradFloat> {
    interval: i32,
    since_last: u32,
    previous: Option<Vec<Vec<F>>>,
}

impl<F: GradFloat> Checkpointer<F> {
    pub fn new(interval: i32) -> Self {
        Self {
            interval,
            since_last: 0,
            previous: None,
        }
    }

    /// Call once per iteration after the score update.
    pub fn tick(
        &mut self,
        scores: &mut RawScores<F>,
        recorder: &mut ResourceRecorder,
        logger: &TrainingLogger,
    ) {
        if self.interval <= 0 {
            return;
        }
        self.since_last += 1;
        if self.since_last < self.interval as u32 {
            return;
        }
        self.since_last = 0;
        let checkpoint = scores.materialize();
        // Dropping the previous checkpoint mirrors deleting the prior
        // materialization; tracked intermediates go with it.
        self.previous = Some(checkpoint);
        recorder.release_all();
        logger.debug("checkpointed raw-score series");
    }

    pub fn has_checkpoint(&self) -> bool {
        self.previous.is_some()
    }
}

//! The fitted ensemble: trees, weights, base score, and bound discretizer.

pub mod persist;

use ndarray::{Array2, ArrayView2};

use crate::discretizer::Discretizer;
use crate::error::ShapeError;
use crate::tree::Tree;

/// A gradient boosted model.
///
/// `trees.len() == weights.len()` always; tree `i` contributes to output
/// `i % raw_size`. Under DART the tree count is a multiple of `raw_size`.
#[derive(Debug, Clone, PartialEq)]
pub struct GbmModel {
    trees: Vec<Tree>,
    weights: Vec<f64>,
    base_score: Vec<f64>,
    discretizer: Discretizer,
}

impl GbmModel {
    pub fn new(
        trees: Vec<Tree>,
        weights: Vec<f64>,
        base_score: Vec<f64>,
        discretizer: Discretizer,
    ) -> Self {
        debug_assert_eq!(trees.len(), weights.len());
        Self {
            trees,
            weights,
            base_score,
            discretizer,
        }
    }

    #[inline]
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    #[inline]
    pub fn raw_size(&self) -> usize {
        self.base_score.len()
    }

    #[inline]
    pub fn n_base_models(&self) -> usize {
        self.trees.len() / self.raw_size()
    }

    #[inline]
    pub fn trees(&self) -> &[Tree] {
        &self.trees
    }

    #[inline]
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    #[inline]
    pub fn base_score(&self) -> &[f64] {
        &self.base_score
    }

    #[inline]
    pub fn discretizer(&self) -> &Discretizer {
        &self.discretizer
    }

    /// Copy with only the first `n` trees (and weights).
    pub fn truncated(&self, n: usize) -> Self {
        let n = n.min(self.trees.len());
        Self {
            trees: self.trees[..n].to_vec(),
            weights: self.weights[..n].to_vec(),
            base_score: self.base_score.clone(),
            discretizer: self.discretizer.clone(),
        }
    }

    /// Raw (pre-link) prediction using the first `first_n` trees
    /// (`None` = all).
    pub fn predict_raw(
        &self,
        features: &[f64],
        first_n: Option<usize>,
    ) -> Result<Vec<f64>, ShapeError> {
        let bins = self.discretizer.transform(features)?;
        Ok(self.predict_raw_bins(&bins, first_n))
    }

    /// Raw prediction from already-discretized bins.
    pub fn predict_raw_bins(&self, bins: &[u32], first_n: Option<usize>) -> Vec<f64> {
        let n = first_n.unwrap_or(self.trees.len()).min(self.trees.len());
        let raw_size = self.raw_size();
        let mut raw = self.base_score.clone();
        for i in 0..n {
            raw[i % raw_size] += self.weights[i] * self.trees[i].predict(bins);
        }
        raw
    }

    /// Alias for [`GbmModel::predict_raw`]; the objective's link inverse is
    /// applied by the caller when probabilities are wanted.
    pub fn predict(&self, features: &[f64], first_n: Option<usize>) -> Result<Vec<f64>, ShapeError> {
        self.predict_raw(features, first_n)
    }

    /// Batch raw prediction over a (rows x features) matrix.
    pub fn predict_batch(&self, data: ArrayView2<'_, f64>) -> Result<Array2<f64>, ShapeError> {
        let n_rows = data.nrows();
        let mut out = Array2::zeros((n_rows, self.raw_size()));
        let mut row_buf = vec![0.0; data.ncols()];
        for r in 0..n_rows {
            for (b, v) in row_buf.iter_mut().zip(data.row(r)) {
                *b = *v;
            }
            let raw = self.predict_raw(&row_buf, None)?;
            for (o, v) in raw.into_iter().enumerate() {
                out[(r, o)] = v;
            }
        }
        Ok(out)
    }

    /// Per-tree leaf ids for one row.
    ///
    /// Plain mode returns each tree's leaf ordinal; one-hot mode offsets the
    /// ordinals by cumulative leaf counts, yielding indices into the
    /// concatenated leaf space.
    pub fn leaf(&self, features: &[f64], one_hot: bool) -> Result<Vec<u32>, ShapeError> {
        let bins = self.discretizer.transform(features)?;
        let mut out = Vec::with_capacity(self.trees.len());
        let mut offset = 0u32;
        for tree in &self.trees {
            let ordinal = tree.leaf_ordinal(&bins);
            out.push(if one_hot { offset + ordinal } else { ordinal });
            offset += tree.n_leaves() as u32;
        }
        Ok(out)
    }

    /// Gain-based feature importance over the first `first_n` trees,
    /// normalized to sum to one (all zeros when no tree ever split).
    pub fn feature_importance(&self, first_n: Option<usize>) -> Vec<f64> {
        let n = first_n.unwrap_or(self.trees.len()).min(self.trees.len());
        let mut acc = vec![0.0; self.discretizer.n_cols()];
        for i in 0..n {
            self.trees[i].add_importance(self.weights[i], &mut acc);
        }
        let total: f64 = acc.iter().sum();
        if total > 0.0 {
            for v in &mut acc {
                *v /= total;
            }
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoostConfig;
    use crate::data::RawInstance;
    use crate::discretizer::{ColumnSchema, Discretizer};
    use crate::exec::PartitionedDataset;
    use crate::split::{SplitInfo, SplitKind};
    use crate::tree::MutableTree;
    use ndarray::array;

    fn fitted_discretizer() -> Discretizer {
        let rows: Vec<RawInstance> = (0..8)
            .map(|i| RawInstance::labeled(0.0, vec![i as f64]))
            .collect();
        let data = PartitionedDataset::from_rows(rows, 2);
        Discretizer::fit(&data, &ColumnSchema::all_numeric(1), &BoostConfig::default()).unwrap()
    }

    fn stump_pair_model() -> GbmModel {
        // Tree 0: split bins <= 4 -> -1.0, else 1.0. Tree 1: single leaf 0.5.
        let mut t0 = MutableTree::new(0.0, 8.0);
        let (l, r) = t0.split_node(
            0,
            SplitInfo {
                feature: 0,
                kind: SplitKind::Numeric { threshold: 4 },
                default_left: true,
                gain: 2.0,
                left: (-4.0, 4.0),
                right: (4.0, 4.0),
                position: 0,
            },
        );
        t0.set_leaf_value(l, -1.0);
        t0.set_leaf_value(r, 1.0);

        let mut t1 = MutableTree::new(0.0, 8.0);
        t1.set_leaf_value(0, 0.5);

        GbmModel::new(
            vec![t0.freeze(), t1.freeze()],
            vec![0.1, 0.2],
            vec![3.0],
            fitted_discretizer(),
        )
    }

    #[test]
    fn predict_accumulates_weighted_trees() {
        let model = stump_pair_model();
        // x = 0 -> bin 1 -> left: 3.0 + 0.1 * -1.0 + 0.2 * 0.5 = 3.0
        let p = model.predict(&[0.0], None).unwrap();
        assert!((p[0] - 3.0).abs() < 1e-12);
        // x = 7 -> top bin -> right: 3.0 + 0.1 + 0.1 = 3.2
        let p = model.predict(&[7.0], None).unwrap();
        assert!((p[0] - 3.2).abs() < 1e-12);
    }

    #[test]
    fn predict_first_n_prefix() {
        let model = stump_pair_model();
        let p0 = model.predict(&[7.0], Some(0)).unwrap();
        assert!((p0[0] - 3.0).abs() < 1e-12);
        let p1 = model.predict(&[7.0], Some(1)).unwrap();
        assert!((p1[0] - 3.1).abs() < 1e-12);
    }

    #[test]
    fn predict_rejects_wrong_width() {
        let model = stump_pair_model();
        assert!(matches!(
            model.predict(&[1.0, 2.0], None),
            Err(ShapeError::FeatureCount { .. })
        ));
    }

    #[test]
    fn predictions_finite_for_finite_model() {
        let model = stump_pair_model();
        for x in [-100.0, 0.0, 3.5, 1e9, f64::NAN] {
            let p = model.predict(&[x], None).unwrap();
            assert!(p[0].is_finite());
        }
    }

    #[test]
    fn leaf_ids_and_one_hot() {
        let model = stump_pair_model();
        let plain = model.leaf(&[0.0], false).unwrap();
        assert_eq!(plain, vec![0, 0]);
        let onehot = model.leaf(&[7.0], true).unwrap();
        // Tree 0 has 2 leaves; tree 1's single leaf is global index 2.
        assert_eq!(onehot, vec![1, 2]);
    }

    #[test]
    fn importance_normalizes() {
        let model = stump_pair_model();
        let imp = model.feature_importance(None);
        assert_eq!(imp.len(), 1);
        assert!((imp[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn truncated_keeps_prefix() {
        let model = stump_pair_model();
        let cut = model.truncated(1);
        assert_eq!(cut.n_trees(), 1);
        assert_eq!(cut.weights(), &[0.1]);
    }

    #[test]
    fn batch_predict_matches_rowwise() {
        let model = stump_pair_model();
        let data = array![[0.0], [7.0]];
        let batch = model.predict_batch(data.view()).unwrap();
        for (r, x) in [0.0, 7.0].iter().enumerate() {
            let single = model.predict(&[*x], None).unwrap();
            assert!((batch[(r, 0)] - single[0]).abs() < 1e-12);
        }
    }
}

//! Evaluation functions.
//!
//! Two flavors mirror the two aggregation shapes the driver supports:
//! incremental metrics fold row-by-row into a small accumulator that merges
//! commutatively (reduced with a tree-reduce of configurable depth), batch
//! metrics receive the whole materialized (weight, label, raw, score) set.

/// Accumulator for incremental metrics: a weighted numerator/denominator
/// pair, merged by addition.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvalAcc {
    pub num: f64,
    pub den: f64,
}

impl EvalAcc {
    pub fn merge(self, other: EvalAcc) -> EvalAcc {
        EvalAcc {
            num: self.num + other.num,
            den: self.den + other.den,
        }
    }
}

/// Materialized evaluation set for batch metrics.
///
/// `label`, `raw`, and `score` are row-major with stride `raw_size`.
#[derive(Debug, Clone, Default)]
pub struct EvalRows {
    pub raw_size: usize,
    pub weight: Vec<f64>,
    pub label: Vec<f64>,
    pub raw: Vec<f64>,
    pub score: Vec<f64>,
}

impl EvalRows {
    pub fn n_rows(&self) -> usize {
        self.weight.len()
    }
}

/// Shared metric metadata.
pub trait EvalMetric: Send + Sync {
    fn name(&self) -> &'static str;

    fn higher_is_better(&self) -> bool {
        false
    }
}

/// Commutative fold over (weight, label, raw, score) rows.
pub trait IncrementalEval: EvalMetric {
    fn fold(&self, acc: &mut EvalAcc, weight: f64, label: &[f64], raw: &[f64], score: &[f64]);

    fn finish(&self, acc: EvalAcc) -> f64;
}

/// Metric over the whole materialized set.
pub trait BatchEval: EvalMetric {
    fn compute(&self, rows: &EvalRows) -> f64;
}

/// A metric of either flavor, as configured on the trainer.
pub enum EvalFunction {
    Incremental(Box<dyn IncrementalEval>),
    Batch(Box<dyn BatchEval>),
}

impl EvalFunction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Incremental(m) => m.name(),
            Self::Batch(m) => m.name(),
        }
    }

    pub fn higher_is_better(&self) -> bool {
        match self {
            Self::Incremental(m) => m.higher_is_better(),
            Self::Batch(m) => m.higher_is_better(),
        }
    }
}

// ============================================================================
// Incremental metrics
// ============================================================================

/// Weighted mean squared error.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mse;

impl EvalMetric for Mse {
    fn name(&self) -> &'static str {
        "mse"
    }
}

impl IncrementalEval for Mse {
    fn fold(&self, acc: &mut EvalAcc, weight: f64, label: &[f64], _raw: &[f64], score: &[f64]) {
        for (l, s) in label.iter().zip(score) {
            let d = s - l;
            acc.num += weight * d * d;
        }
        acc.den += weight;
    }

    fn finish(&self, acc: EvalAcc) -> f64 {
        if acc.den > 0.0 {
            acc.num / acc.den
        } else {
            0.0
        }
    }
}

/// Weighted root mean squared error.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rmse;

impl EvalMetric for Rmse {
    fn name(&self) -> &'static str {
        "rmse"
    }
}

impl IncrementalEval for Rmse {
    fn fold(&self, acc: &mut EvalAcc, weight: f64, label: &[f64], raw: &[f64], score: &[f64]) {
        Mse.fold(acc, weight, label, raw, score);
    }

    fn finish(&self, acc: EvalAcc) -> f64 {
        Mse.finish(acc).sqrt()
    }
}

/// Weighted mean absolute error.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mae;

impl EvalMetric for Mae {
    fn name(&self) -> &'static str {
        "mae"
    }
}

impl IncrementalEval for Mae {
    fn fold(&self, acc: &mut EvalAcc, weight: f64, label: &[f64], _raw: &[f64], score: &[f64]) {
        for (l, s) in label.iter().zip(score) {
            acc.num += weight * (s - l).abs();
        }
        acc.den += weight;
    }

    fn finish(&self, acc: EvalAcc) -> f64 {
        if acc.den > 0.0 {
            acc.num / acc.den
        } else {
            0.0
        }
    }
}

/// Binary cross-entropy on transformed scores (probabilities).
#[derive(Debug, Clone, Copy, Default)]
pub struct LogLoss;

impl EvalMetric for LogLoss {
    fn name(&self) -> &'static str {
        "logloss"
    }
}

impl IncrementalEval for LogLoss {
    fn fold(&self, acc: &mut EvalAcc, weight: f64, label: &[f64], _raw: &[f64], score: &[f64]) {
        let p = score[0].clamp(1e-15, 1.0 - 1e-15);
        let y = label[0];
        acc.num += weight * -(y * p.ln() + (1.0 - y) * (1.0 - p).ln());
        acc.den += weight;
    }

    fn finish(&self, acc: EvalAcc) -> f64 {
        if acc.den > 0.0 {
            acc.num / acc.den
        } else {
            0.0
        }
    }
}

/// Binary classification error at a 0.5 probability threshold.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorRate;

impl EvalMetric for ErrorRate {
    fn name(&self) -> &'static str {
        "error"
    }
}

impl IncrementalEval for ErrorRate {
    fn fold(&self, acc: &mut EvalAcc, weight: f64, label: &[f64], _raw: &[f64], score: &[f64]) {
        let predicted = if score[0] >= 0.5 { 1.0 } else { 0.0 };
        if predicted != label[0] {
            acc.num += weight;
        }
        acc.den += weight;
    }

    fn finish(&self, acc: EvalAcc) -> f64 {
        if acc.den > 0.0 {
            acc.num / acc.den
        } else {
            0.0
        }
    }
}

// ============================================================================
// Batch metrics
// ============================================================================

/// Area under the ROC curve; needs the whole set to rank, so batch-only.
#[derive(Debug, Clone, Copy, Default)]
pub struct Auc;

impl EvalMetric for Auc {
    fn name(&self) -> &'static str {
        "auc"
    }

    fn higher_is_better(&self) -> bool {
        true
    }
}

impl BatchEval for Auc {
    fn compute(&self, rows: &EvalRows) -> f64 {
        let n = rows.n_rows();
        let stride = rows.raw_size.max(1);
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            rows.score[a * stride]
                .partial_cmp(&rows.score[b * stride])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Weighted rank-sum with midranks for score ties.
        let mut pos_w = 0.0;
        let mut neg_w = 0.0;
        let mut pos_rank_sum = 0.0;
        let mut rank = 0.0;
        let mut i = 0;
        while i < n {
            let mut j = i;
            let mut tie_w = 0.0;
            while j < n && rows.score[order[j] * stride] == rows.score[order[i] * stride] {
                tie_w += rows.weight[order[j]];
                j += 1;
            }
            let mid = rank + (tie_w + 1.0) / 2.0;
            for &row in &order[i..j] {
                let w = rows.weight[row];
                if rows.label[row * stride] >= 0.5 {
                    pos_w += w;
                    pos_rank_sum += w * mid;
                } else {
                    neg_w += w;
                }
            }
            rank += tie_w;
            i = j;
        }
        if pos_w == 0.0 || neg_w == 0.0 {
            return 0.5;
        }
        (pos_rank_sum - pos_w * (pos_w + 1.0) / 2.0) / (pos_w * neg_w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold_all(metric: &dyn IncrementalEval, rows: &[(f64, f64, f64)]) -> f64 {
        let mut acc = EvalAcc::default();
        for &(w, y, s) in rows {
            metric.fold(&mut acc, w, &[y], &[s], &[s]);
        }
        metric.finish(acc)
    }

    #[test]
    fn mse_and_rmse() {
        let rows = [(1.0, 0.0, 1.0), (1.0, 0.0, -1.0)];
        assert!((fold_all(&Mse, &rows) - 1.0).abs() < 1e-12);
        assert!((fold_all(&Rmse, &rows) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn mae_weighted() {
        let rows = [(3.0, 0.0, 2.0), (1.0, 0.0, -2.0)];
        // (3*2 + 1*2) / 4 = 2
        assert!((fold_all(&Mae, &rows) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn error_rate_counts_misclassifications() {
        let rows = [(1.0, 1.0, 0.9), (1.0, 0.0, 0.4), (1.0, 1.0, 0.2)];
        assert!((fold_all(&ErrorRate, &rows) - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn acc_merge_is_commutative() {
        let a = EvalAcc { num: 1.0, den: 2.0 };
        let b = EvalAcc { num: 3.0, den: 4.0 };
        assert_eq!(a.merge(b), b.merge(a));
    }

    #[test]
    fn auc_perfect_and_random() {
        let make = |pairs: &[(f64, f64)]| EvalRows {
            raw_size: 1,
            weight: vec![1.0; pairs.len()],
            label: pairs.iter().map(|&(y, _)| y).collect(),
            raw: pairs.iter().map(|&(_, s)| s).collect(),
            score: pairs.iter().map(|&(_, s)| s).collect(),
        };

        let perfect = make(&[(0.0, 0.1), (0.0, 0.2), (1.0, 0.8), (1.0, 0.9)]);
        assert!((Auc.compute(&perfect) - 1.0).abs() < 1e-12);

        let inverted = make(&[(1.0, 0.1), (1.0, 0.2), (0.0, 0.8), (0.0, 0.9)]);
        assert!(Auc.compute(&inverted).abs() < 1e-12);

        let single_class = make(&[(1.0, 0.3), (1.0, 0.7)]);
        assert_eq!(Auc.compute(&single_class), 0.5);
    }
}

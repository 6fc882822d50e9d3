//! Greedy-merge quantile sketch for approximate equal-depth binning.
//!
//! The sketch keeps a sorted list of (value, weight) centroids. When the list
//! grows past its capacity, the adjacent pair with the smallest combined
//! weight is merged into its weighted midpoint's *lower* value, keeping every
//! centroid an actually-observed value so that small-cardinality columns bin
//! exactly. Merging two sketches concatenates and re-compresses; the result
//! depends only on the input order, which the fit pass keeps fixed.

/// A weighted, sorted summary of one numeric column.
#[derive(Debug, Clone)]
pub struct QuantileSketch {
    /// Sorted (value, weight) centroids.
    entries: Vec<(f64, f64)>,
    capacity: usize,
}

impl QuantileSketch {
    /// `capacity` bounds the number of retained centroids; a few multiples of
    /// the target bin count is plenty.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity: capacity.max(4),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert one observation.
    pub fn insert(&mut self, value: f64, weight: f64) {
        debug_assert!(value.is_finite());
        match self
            .entries
            .binary_search_by(|(v, _)| v.partial_cmp(&value).unwrap())
        {
            Ok(i) => self.entries[i].1 += weight,
            Err(i) => self.entries.insert(i, (value, weight)),
        }
        if self.entries.len() > self.capacity {
            self.compress();
        }
    }

    /// Merge another sketch into this one.
    pub fn merge(&mut self, other: &QuantileSketch) {
        for &(v, w) in &other.entries {
            match self
                .entries
                .binary_search_by(|(ev, _)| ev.partial_cmp(&v).unwrap())
            {
                Ok(i) => self.entries[i].1 += w,
                Err(i) => self.entries.insert(i, (v, w)),
            }
        }
        while self.entries.len() > self.capacity {
            self.compress();
        }
    }

    /// Merge the adjacent pair with the smallest combined weight.
    fn compress(&mut self) {
        while self.entries.len() > self.capacity {
            let mut best = 0;
            let mut best_w = f64::INFINITY;
            for i in 0..self.entries.len() - 1 {
                let w = self.entries[i].1 + self.entries[i + 1].1;
                if w < best_w {
                    best_w = w;
                    best = i;
                }
            }
            let (_, w_hi) = self.entries.remove(best + 1);
            self.entries[best].1 += w_hi;
        }
    }

    /// Strictly increasing thresholds carving at most `max_non_missing` bins.
    ///
    /// With `d` distinct centroids and `d <= max_non_missing`, every centroid
    /// gets its own bin (thresholds are the centroids past the first). Larger
    /// summaries cut at equal cumulative-weight targets.
    pub fn thresholds(&self, max_non_missing: u32) -> Vec<f64> {
        let k = max_non_missing.max(1) as usize;
        if self.entries.len() <= 1 {
            return Vec::new();
        }
        if self.entries.len() <= k {
            return self.entries[1..].iter().map(|&(v, _)| v).collect();
        }

        let total: f64 = self.entries.iter().map(|&(_, w)| w).sum();
        let mut out = Vec::with_capacity(k - 1);
        let mut cum = 0.0;
        let mut next_cut = 1;
        for &(v, w) in &self.entries {
            if next_cut >= k {
                break;
            }
            let target = total * next_cut as f64 / k as f64;
            cum += w;
            if cum >= target {
                if out.last().map_or(true, |&last| v > last) {
                    out.push(v);
                }
                while next_cut < k && cum >= total * next_cut as f64 / k as f64 {
                    next_cut += 1;
                }
            }
        }
        // The first centroid can never be a threshold; it belongs to bin 1.
        if out.first() == self.entries.first().map(|&(v, _)| v).as_ref() {
            out.remove(0);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_cardinality_bins_exactly() {
        let mut sketch = QuantileSketch::new(64);
        for v in [0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0] {
            sketch.insert(v, 1.0);
        }
        let t = sketch.thresholds(63);
        assert_eq!(t, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn duplicate_values_accumulate_weight() {
        let mut sketch = QuantileSketch::new(16);
        for _ in 0..10 {
            sketch.insert(1.0, 1.0);
        }
        sketch.insert(2.0, 1.0);
        let t = sketch.thresholds(8);
        assert_eq!(t, vec![2.0]);
    }

    #[test]
    fn thresholds_strictly_increasing_under_compression() {
        let mut sketch = QuantileSketch::new(32);
        for i in 0..1000 {
            sketch.insert((i % 97) as f64, 1.0);
        }
        let t = sketch.thresholds(15);
        assert!(!t.is_empty());
        for w in t.windows(2) {
            assert!(w[0] < w[1]);
        }
        assert!(t.len() <= 14);
    }

    #[test]
    fn merge_matches_sequential_insert_for_small_inputs() {
        let values = [3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0];
        let mut whole = QuantileSketch::new(64);
        for v in values {
            whole.insert(v, 1.0);
        }
        let mut left = QuantileSketch::new(64);
        let mut right = QuantileSketch::new(64);
        for v in &values[..4] {
            left.insert(*v, 1.0);
        }
        for v in &values[4..] {
            right.insert(*v, 1.0);
        }
        left.merge(&right);
        assert_eq!(left.thresholds(32), whole.thresholds(32));
    }

    #[test]
    fn empty_and_constant_columns_have_no_thresholds() {
        let sketch = QuantileSketch::new(8);
        assert!(sketch.thresholds(8).is_empty());

        let mut constant = QuantileSketch::new(8);
        for _ in 0..5 {
            constant.insert(2.5, 1.0);
        }
        assert!(constant.thresholds(8).is_empty());
    }
}

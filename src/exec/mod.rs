//! Execution plane: partitioned datasets and the collective operations the
//! boosting loop is built on.
//!
//! The driver runs the loop sequentially; each step dispatches a parallel
//! map over partitions (rayon) followed by a deterministic [`tree_reduce`].
//! Partitions are immutable `Arc` chunks, so the structural operations
//! ([`PartitionedDataset::reorganize`], [`PartitionedDataset::extend`],
//! [`PartitionedDataset::allgather`]) are narrow dependencies that never copy
//! row data.

use std::any::Any;
use std::sync::Arc;

use rand::Rng;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;

// ============================================================================
// PartitionedDataset
// ============================================================================

/// One partition: an ordered list of shared chunks.
///
/// Keeping chunks instead of a flat buffer makes partition reorganization a
/// pointer operation.
#[derive(Debug, Clone)]
pub struct Partition<T> {
    chunks: Vec<Arc<Vec<T>>>,
}

impl<T> Partition<T> {
    pub fn from_chunk(chunk: Arc<Vec<T>>) -> Self {
        Self {
            chunks: vec![chunk],
        }
    }

    pub fn n_rows(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }

    /// Iterate rows in chunk order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.chunks.iter().flat_map(|c| c.iter())
    }
}

/// An ordered, immutable, row-partitioned dataset.
#[derive(Debug, Clone)]
pub struct PartitionedDataset<T> {
    parts: Vec<Partition<T>>,
}

impl<T: Send + Sync> PartitionedDataset<T> {
    /// Split `rows` into `n_parts` partitions of near-equal size, preserving
    /// row order.
    pub fn from_rows(rows: Vec<T>, n_parts: usize) -> Self {
        let n_parts = n_parts.max(1);
        let n = rows.len();
        let base = n / n_parts;
        let extra = n % n_parts;

        let mut rows = rows.into_iter();
        let parts = (0..n_parts)
            .map(|i| {
                let take = base + usize::from(i < extra);
                let chunk: Vec<T> = rows.by_ref().take(take).collect();
                Partition::from_chunk(Arc::new(chunk))
            })
            .collect();
        Self { parts }
    }

    pub fn n_partitions(&self) -> usize {
        self.parts.len()
    }

    pub fn n_rows(&self) -> usize {
        self.parts.iter().map(|p| p.n_rows()).sum()
    }

    pub fn partitions(&self) -> &[Partition<T>] {
        &self.parts
    }

    /// Parallel map over partitions. `f` receives the partition index and the
    /// partition; results keep partition order.
    pub fn map_partitions<U, F>(&self, f: F) -> Vec<U>
    where
        U: Send,
        F: Fn(usize, &Partition<T>) -> U + Sync,
    {
        self.parts
            .par_iter()
            .enumerate()
            .map(|(i, p)| f(i, p))
            .collect()
    }

    /// Narrow-dependency reorganization: output partition `i` is the
    /// concatenation of the parent partitions listed in `groups[i]`.
    /// A parent index may appear in several groups (multiset semantics).
    pub fn reorganize(&self, groups: &[Vec<usize>]) -> Self {
        let parts = groups
            .iter()
            .map(|group| {
                let chunks = group
                    .iter()
                    .flat_map(|&p| self.parts[p].chunks.iter().cloned())
                    .collect();
                Partition { chunks }
            })
            .collect();
        Self { parts }
    }

    /// Replicate parent partitions cyclically to reach `n_parts` partitions
    /// without moving any rows.
    pub fn extend(&self, n_parts: usize) -> Self {
        assert!(
            n_parts >= self.parts.len(),
            "extend target must not shrink the partition count"
        );
        let groups: Vec<Vec<usize>> = (0..n_parts).map(|i| vec![i % self.parts.len()]).collect();
        self.reorganize(&groups)
    }

    /// Weighted partition sampling.
    ///
    /// Weight semantics per partition: `>= 1` keeps the whole partition, `<= 0`
    /// drops it, anything in between row-filters with a per-partition PRNG
    /// seeded from `seed` and the partition index.
    pub fn sample_partitions(&self, weights: &[f64], seed: u64) -> Self
    where
        T: Clone,
    {
        assert_eq!(weights.len(), self.parts.len());
        let parts = self
            .parts
            .par_iter()
            .zip(weights.par_iter())
            .enumerate()
            .filter_map(|(i, (part, &w))| {
                if w <= 0.0 {
                    None
                } else if w >= 1.0 {
                    Some(part.clone())
                } else {
                    let mut rng = partition_rng(seed, i);
                    let rows: Vec<T> = part
                        .iter()
                        .filter(|_| rng.gen::<f64>() < w)
                        .cloned()
                        .collect();
                    Some(Partition::from_chunk(Arc::new(rows)))
                }
            })
            .collect();
        Self { parts }
    }

    /// Broadcast-ordered reshuffle: every output partition holds the full
    /// dataset in `(source partition, row ordinal)` order.
    ///
    /// Partitions already store rows in that canonical order, so a single
    /// shared copy of the global stream backs all `n_out` outputs.
    pub fn allgather(&self, n_out: usize) -> Self
    where
        T: Clone,
    {
        let global: Arc<Vec<T>> = Arc::new(self.parts.iter().flat_map(|p| p.iter().cloned()).collect());
        let parts = (0..n_out.max(1))
            .map(|_| Partition::from_chunk(global.clone()))
            .collect();
        Self { parts }
    }

    /// Collect all rows into one vector in partition order.
    pub fn collect_rows(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.parts.iter().flat_map(|p| p.iter().cloned()).collect()
    }
}

/// Deterministic PRNG for one partition of one operation.
pub fn partition_rng(seed: u64, partition: usize) -> Xoshiro256PlusPlus {
    Xoshiro256PlusPlus::seed_from_u64(seed.wrapping_add(partition as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

// ============================================================================
// tree_reduce
// ============================================================================

/// Reduce partial values with a balanced multi-round merge.
///
/// `depth` bounds the number of merge rounds, mirroring the aggregation-depth
/// knob of distributed tree reductions. The merge order depends only on the
/// input order, so the result is deterministic for any commutative-associative
/// `merge` and bit-identical for a fixed input order.
pub fn tree_reduce<T, F>(mut items: Vec<T>, depth: u32, merge: F) -> Option<T>
where
    F: Fn(T, T) -> T,
{
    if items.is_empty() {
        return None;
    }
    let depth = depth.max(1);

    while items.len() > 1 {
        // Group width chosen so `depth` rounds suffice for the initial size.
        let width = (items.len() as f64)
            .powf(1.0 / depth as f64)
            .ceil()
            .max(2.0) as usize;

        let mut next = Vec::with_capacity(items.len().div_ceil(width));
        let mut it = items.into_iter();
        loop {
            let mut acc = match it.next() {
                Some(v) => v,
                None => break,
            };
            for _ in 1..width {
                match it.next() {
                    Some(v) => acc = merge(acc, v),
                    None => break,
                }
            }
            next.push(acc);
        }
        items = next;
    }
    items.pop()
}

// ============================================================================
// Row and block sampling
// ============================================================================

/// Sample local row ids of one partition for one base model.
///
/// Two modes: block sampling draws whole `block_size` runs (faster, coarser);
/// instance sampling draws single rows. `rate >= 1` returns `None`, which is
/// the caller's signal to take the bit-identical no-sampling path.
pub fn sample_partition_rows(
    n_rows: usize,
    rate: f64,
    block_size: usize,
    sample_blocks: bool,
    rng: &mut Xoshiro256PlusPlus,
) -> Option<Vec<u32>> {
    if rate >= 1.0 {
        return None;
    }

    let mut picked = Vec::with_capacity((n_rows as f64 * rate) as usize + 1);
    if sample_blocks {
        let block_size = block_size.max(1);
        let mut start = 0usize;
        while start < n_rows {
            let end = (start + block_size).min(n_rows);
            if rng.gen::<f64>() < rate {
                picked.extend((start as u32)..(end as u32));
            }
            start = end;
        }
    } else {
        for row in 0..n_rows {
            if rng.gen::<f64>() < rate {
                picked.push(row as u32);
            }
        }
    }
    Some(picked)
}

// ============================================================================
// ResourceRecorder
// ============================================================================

/// Tracks intermediates persisted during one iteration (blockified input,
/// gradient blocks, allgathered blocks) and releases them at iteration end.
#[derive(Default)]
pub struct ResourceRecorder {
    handles: Vec<(&'static str, Arc<dyn Any + Send + Sync>)>,
}

impl ResourceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a persisted intermediate under a short tag.
    pub fn track<T: Send + Sync + 'static>(&mut self, tag: &'static str, value: Arc<T>) {
        self.handles.push((tag, value));
    }

    pub fn n_tracked(&self) -> usize {
        self.handles.len()
    }

    /// Drop every tracked handle.
    pub fn release_all(&mut self) {
        self.handles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rows_balances_partitions() {
        let data = PartitionedDataset::from_rows((0..10).collect::<Vec<i32>>(), 3);
        assert_eq!(data.n_partitions(), 3);
        let sizes: Vec<usize> = data.partitions().iter().map(|p| p.n_rows()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        assert_eq!(data.collect_rows(), (0..10).collect::<Vec<i32>>());
    }

    #[test]
    fn reorganize_concatenates_parents() {
        let data = PartitionedDataset::from_rows(vec![1, 2, 3, 4, 5, 6], 3);
        let merged = data.reorganize(&[vec![0, 2], vec![1, 1]]);
        assert_eq!(merged.n_partitions(), 2);
        let p0: Vec<i32> = merged.partitions()[0].iter().copied().collect();
        let p1: Vec<i32> = merged.partitions()[1].iter().copied().collect();
        assert_eq!(p0, vec![1, 2, 5, 6]);
        assert_eq!(p1, vec![3, 4, 3, 4]);
    }

    #[test]
    fn extend_replicates_without_copying() {
        let data = PartitionedDataset::from_rows(vec![1, 2, 3, 4], 2);
        let wide = data.extend(5);
        assert_eq!(wide.n_partitions(), 5);
        let p4: Vec<i32> = wide.partitions()[4].iter().copied().collect();
        assert_eq!(p4, vec![1, 2]);
    }

    #[test]
    fn allgather_preserves_canonical_order() {
        let data = PartitionedDataset::from_rows((0..9).collect::<Vec<i32>>(), 3);
        let gathered = data.allgather(3);
        assert_eq!(gathered.n_partitions(), 3);
        for part in gathered.partitions() {
            let rows: Vec<i32> = part.iter().copied().collect();
            assert_eq!(rows, (0..9).collect::<Vec<i32>>());
        }
    }

    #[test]
    fn sample_partitions_keep_drop_filter() {
        let data = PartitionedDataset::from_rows((0..300).collect::<Vec<i32>>(), 3);
        let sampled = data.sample_partitions(&[1.0, 0.0, 0.5], 7);
        // Partition 1 dropped entirely.
        assert_eq!(sampled.n_partitions(), 2);
        assert_eq!(sampled.partitions()[0].n_rows(), 100);
        let filtered = sampled.partitions()[1].n_rows();
        assert!(filtered > 20 && filtered < 80, "got {filtered}");
    }

    #[test]
    fn sample_partitions_deterministic() {
        let data = PartitionedDataset::from_rows((0..100).collect::<Vec<i32>>(), 2);
        let a = data.sample_partitions(&[0.5, 0.5], 11).collect_rows();
        let b = data.sample_partitions(&[0.5, 0.5], 11).collect_rows();
        assert_eq!(a, b);
    }

    #[test]
    fn tree_reduce_sums_at_any_depth() {
        for depth in 1..=4 {
            let total = tree_reduce((1..=100).collect::<Vec<u64>>(), depth, |a, b| a + b);
            assert_eq!(total, Some(5050));
        }
        assert_eq!(tree_reduce(Vec::<u64>::new(), 2, |a, b| a + b), None);
    }

    #[test]
    fn sample_rows_full_rate_is_none() {
        let mut rng = partition_rng(1, 0);
        assert!(sample_partition_rows(100, 1.0, 16, true, &mut rng).is_none());
    }

    #[test]
    fn sample_rows_block_mode_takes_runs() {
        let mut rng = partition_rng(3, 0);
        let rows = sample_partition_rows(100, 0.5, 10, true, &mut rng).unwrap();
        // Block mode only produces multiples of the block size (except tail).
        assert_eq!(rows.len() % 10, 0);
        for window in rows.chunks(10) {
            for (i, &r) in window.iter().enumerate() {
                assert_eq!(r, window[0] + i as u32);
            }
        }
    }

    #[test]
    fn recorder_releases_handles() {
        let mut rec = ResourceRecorder::new();
        let payload = Arc::new(vec![1u8, 2, 3]);
        rec.track("gradient-blocks", payload.clone());
        assert_eq!(rec.n_tracked(), 1);
        assert_eq!(Arc::strong_count(&payload), 2);
        rec.release_all();
        assert_eq!(Arc::strong_count(&payload), 1);
    }
}

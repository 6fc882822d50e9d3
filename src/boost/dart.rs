//! DART dropout: sampling the dropped set and reweighting trees.
//!
//! Each round, with probability `1 - drop_skip`, a subset of existing base
//! models is dropped from the residual computation. After the round's new
//! trees are appended, the dropped trees' weights shrink by `k / (k + eta)`
//! and each new tree gets weight `1 / (k + eta)`, preserving the ensemble's
//! expected contribution.

use rand::Rng;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::config::BoostConfig;

/// Sample the base-model indices dropped this round. Empty when dropout is
/// skipped or nothing can be dropped.
pub fn sample_dropout(
    config: &BoostConfig,
    n_base_models: usize,
    rng: &mut Xoshiro256PlusPlus,
) -> Vec<usize> {
    if n_base_models == 0 {
        return Vec::new();
    }
    if rng.gen::<f64>() < config.drop_skip {
        return Vec::new();
    }

    let wanted = (n_base_models as f64 * config.drop_rate).ceil() as usize;
    let k = wanted
        .max(config.min_drop as usize)
        .min(config.max_drop as usize)
        .min(n_base_models);
    if k == 0 {
        return Vec::new();
    }

    // Partial Fisher-Yates, sorted for deterministic downstream iteration.
    let mut pool: Vec<usize> = (0..n_base_models).collect();
    for i in 0..k {
        let j = rng.gen_range(i..pool.len());
        pool.swap(i, j);
    }
    let mut dropped = pool[..k].to_vec();
    dropped.sort_unstable();
    dropped
}

/// Expand dropped base-model indices to per-tree indices (`raw_size` trees
/// per base model, appended output-major).
pub fn expand_to_trees(dropped_base: &[usize], raw_size: usize) -> Vec<usize> {
    dropped_base
        .iter()
        .flat_map(|&b| (0..raw_size).map(move |o| b * raw_size + o))
        .collect()
}

/// Rescale dropped trees in place and return the weight for each new tree.
///
/// With `k` dropped base models and step size `eta`:
/// dropped weights scale by `k / (k + eta)`, new trees get `1 / (k + eta)`.
/// With an empty dropped set, new trees get weight 1.
pub fn reweight(weights: &mut [f64], dropped_trees: &[usize], k: usize, step_size: f64) -> f64 {
    if dropped_trees.is_empty() {
        return 1.0;
    }
    let k = k as f64;
    let factor = k / (k + step_size);
    for &j in dropped_trees {
        weights[j] *= factor;
    }
    1.0 / (k + step_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn dart_config(drop_rate: f64, drop_skip: f64) -> BoostConfig {
        BoostConfig::builder()
            .drop_rate(drop_rate)
            .drop_skip(drop_skip)
            .build()
            .unwrap()
    }

    #[test]
    fn dropout_respects_rate_and_clamps() {
        let config = dart_config(0.5, 0.0);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(9);
        let dropped = sample_dropout(&config, 10, &mut rng);
        assert_eq!(dropped.len(), 5);
        assert!(dropped.windows(2).all(|w| w[0] < w[1]));
        assert!(dropped.iter().all(|&b| b < 10));
    }

    #[test]
    fn dropout_skip_probability_one_never_drops() {
        let config = dart_config(1.0, 1.0);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        for _ in 0..50 {
            assert!(sample_dropout(&config, 10, &mut rng).is_empty());
        }
    }

    #[test]
    fn dropout_max_drop_clamps() {
        let config = BoostConfig::builder()
            .drop_rate(1.0)
            .drop_skip(0.0)
            .max_drop(3u32)
            .build()
            .unwrap();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(2);
        assert_eq!(sample_dropout(&config, 10, &mut rng).len(), 3);
    }

    #[test]
    fn dropout_min_drop_forces_drops() {
        let config = BoostConfig::builder()
            .drop_rate(0.0)
            .drop_skip(0.0)
            .min_drop(2u32)
            .build()
            .unwrap();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        assert_eq!(sample_dropout(&config, 10, &mut rng).len(), 2);
    }

    #[test]
    fn dropout_empty_ensemble() {
        let config = dart_config(0.5, 0.0);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(4);
        assert!(sample_dropout(&config, 0, &mut rng).is_empty());
    }

    #[test]
    fn expansion_covers_all_outputs() {
        assert_eq!(expand_to_trees(&[1, 3], 2), vec![2, 3, 6, 7]);
        assert_eq!(expand_to_trees(&[0], 1), vec![0]);
    }

    #[test]
    fn reweight_preserves_total_contribution() {
        // Invariant: sum of dropped new weights + w_new equals
        // sum_old * k/(k+eta) + 1/(k+eta).
        let mut weights = vec![0.3, 0.7, 0.5];
        let dropped = vec![0, 2];
        let k = 2;
        let eta = 0.1;
        let sum_old: f64 = dropped.iter().map(|&j| weights[j]).sum();

        let w_new = reweight(&mut weights, &dropped, k, eta);

        let sum_new: f64 = dropped.iter().map(|&j| weights[j]).sum();
        let expected = sum_old * (k as f64) / (k as f64 + eta) + 1.0 / (k as f64 + eta);
        assert!((sum_new + w_new - expected).abs() < 1e-12);
        assert!((weights[1] - 0.7).abs() < 1e-15); // untouched tree
    }

    #[test]
    fn reweight_without_dropout_gives_unit_weight() {
        let mut weights = vec![0.4, 0.6];
        let w_new = reweight(&mut weights, &[], 0, 0.1);
        assert_eq!(w_new, 1.0);
        assert_eq!(weights, vec![0.4, 0.6]);
    }
}

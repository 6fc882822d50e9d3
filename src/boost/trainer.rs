//! The boosting driver.
//!
//! The driver runs the loop sequentially and dispatches each step as a
//! parallel map over partitions: gradient computation, histogram building
//! (inside the tree learner), score updates, and evaluation. Configuration
//! is snapshotted into every iteration; callbacks mutate it only between
//! iterations, on the driver.
//!
//! Bin width (u8/u16/u32) and gradient precision (f32/f64) are picked at run
//! time; [`GbmTrainer::fit_from`] dispatches into the matching monomorphized
//! training loop.

use std::sync::Arc;

use rayon::prelude::*;

use crate::config::{BoostConfig, BoostType, FloatPrecision};
use crate::data::{
    shard_columns, BinIndex, BinWidth, BinnedDataset, BinnedPartition, GradFloat, RawInstance,
};
use crate::discretizer::{ColumnSchema, Discretizer};
use crate::error::{ShapeError, TrainError};
use crate::exec::{
    partition_rng, sample_partition_rows, tree_reduce, PartitionedDataset, ResourceRecorder,
};
use crate::histogram::{GradientBlock, Gradients};
use crate::logger::TrainingLogger;
use crate::metric::{EvalAcc, EvalFunction, EvalRows};
use crate::model::GbmModel;
use crate::objective::Objective;
use crate::split::SplitParams;
use crate::tree::learner::{HistogramSource, LearnerParams, TreeLearner, TreeSpec};
use crate::tree::Tree;

use super::callback::{Callback, MetricHistory};
use super::dart::{expand_to_trees, reweight, sample_dropout};
use super::scores::{Checkpointer, RawScores};

// ============================================================================
// GbmTrainer
// ============================================================================

/// Trains a [`GbmModel`] from raw partitioned instances.
///
/// ```no_run
/// use std::sync::Arc;
/// use dartboost::boost::GbmTrainer;
/// use dartboost::config::BoostConfig;
/// use dartboost::data::RawInstance;
/// use dartboost::discretizer::ColumnSchema;
/// use dartboost::exec::PartitionedDataset;
/// use dartboost::objective::SquaredLoss;
///
/// let rows: Vec<RawInstance> = (0..32)
///     .map(|i| RawInstance::labeled(i as f64, vec![i as f64]))
///     .collect();
/// let train = PartitionedDataset::from_rows(rows, 4);
/// let config = BoostConfig::builder().max_iter(10u32).build().unwrap();
/// let mut trainer = GbmTrainer::new(config, Arc::new(SquaredLoss));
/// let model = trainer
///     .fit(&train, &ColumnSchema::all_numeric(1), None)
///     .unwrap();
/// ```
pub struct GbmTrainer {
    config: BoostConfig,
    objective: Arc<dyn Objective>,
    evals: Vec<EvalFunction>,
    callbacks: Vec<Box<dyn Callback>>,
}

impl GbmTrainer {
    pub fn new(config: BoostConfig, objective: Arc<dyn Objective>) -> Self {
        Self {
            config,
            objective,
            evals: Vec::new(),
            callbacks: Vec::new(),
        }
    }

    /// Add an evaluation function, computed on train (and test when given)
    /// every iteration.
    pub fn with_eval(mut self, eval: EvalFunction) -> Self {
        self.evals.push(eval);
        self
    }

    pub fn with_callback(mut self, callback: Box<dyn Callback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn config(&self) -> &BoostConfig {
        &self.config
    }

    /// Train from scratch.
    pub fn fit(
        &mut self,
        train: &PartitionedDataset<RawInstance>,
        schema: &ColumnSchema,
        test: Option<&PartitionedDataset<RawInstance>>,
    ) -> Result<GbmModel, TrainError> {
        self.fit_from(train, schema, test, None)
    }

    /// Train, optionally continuing from an initial model.
    ///
    /// Continuation reuses the initial model's discretizer and base score;
    /// `max_iter` counts the additional rounds of this fit. With the same
    /// config and seed, a 10-round fit continued by another 10 rounds equals
    /// one 20-round fit.
    pub fn fit_from(
        &mut self,
        train: &PartitionedDataset<RawInstance>,
        schema: &ColumnSchema,
        test: Option<&PartitionedDataset<RawInstance>>,
        initial: Option<GbmModel>,
    ) -> Result<GbmModel, TrainError> {
        self.config.validate()?;
        let raw_size = self.objective.raw_size();

        let discretizer = match &initial {
            Some(model) => {
                if model.raw_size() != raw_size {
                    return Err(ShapeError::LabelSize {
                        expected: raw_size,
                        got: model.raw_size(),
                    }
                    .into());
                }
                model.discretizer().clone()
            }
            None => Discretizer::fit(train, schema, &self.config)?,
        };

        let width = BinWidth::for_bins(discretizer.max_num_bins());
        match (width, self.config.float_precision) {
            (BinWidth::U8, FloatPrecision::Single) => {
                self.fit_impl::<u8, f32>(train, test, discretizer, initial)
            }
            (BinWidth::U8, FloatPrecision::Double) => {
                self.fit_impl::<u8, f64>(train, test, discretizer, initial)
            }
            (BinWidth::U16, FloatPrecision::Single) => {
                self.fit_impl::<u16, f32>(train, test, discretizer, initial)
            }
            (BinWidth::U16, FloatPrecision::Double) => {
                self.fit_impl::<u16, f64>(train, test, discretizer, initial)
            }
            (BinWidth::U32, FloatPrecision::Single) => {
                self.fit_impl::<u32, f32>(train, test, discretizer, initial)
            }
            (BinWidth::U32, FloatPrecision::Double) => {
                self.fit_impl::<u32, f64>(train, test, discretizer, initial)
            }
        }
    }

    // ------------------------------------------------------------------
    // Monomorphized training loop
    // ------------------------------------------------------------------

    fn fit_impl<B: BinIndex, F: GradFloat>(
        &mut self,
        train: &PartitionedDataset<RawInstance>,
        test: Option<&PartitionedDataset<RawInstance>>,
        discretizer: Discretizer,
        initial: Option<GbmModel>,
    ) -> Result<GbmModel, TrainError> {
        let logger = TrainingLogger::new(self.config.verbosity);
        let raw_size = self.objective.raw_size();
        let num_bins = Arc::new(discretizer.num_bins());
        let dart = self.config.boost_type == BoostType::Dart;

        let binned: BinnedDataset<B> = bin_dataset(train, &discretizer, &num_bins, raw_size)?;
        let binned_test: Option<BinnedDataset<B>> = test
            .map(|t| bin_dataset(t, &discretizer, &num_bins, raw_size))
            .transpose()?;

        // Base score: explicit config, initial model, or weighted label mean.
        let base = match &initial {
            Some(model) => model.base_score().to_vec(),
            None => match &self.config.base_score {
                Some(base) => {
                    if base.len() != raw_size {
                        return Err(ShapeError::BaseScoreSize {
                            expected: raw_size,
                            got: base.len(),
                        }
                        .into());
                    }
                    base.clone()
                }
                None => label_mean(&binned, self.config.aggregation_depth),
            },
        };

        let part_sizes: Vec<usize> = binned.partitions().iter().map(|p| p.n_rows()).collect();
        let mut scores = RawScores::<F>::new(&part_sizes, raw_size, dart, &base);
        let mut test_scores = binned_test.as_ref().map(|b| {
            let sizes: Vec<usize> = b.partitions().iter().map(|p| p.n_rows()).collect();
            RawScores::<F>::new(&sizes, raw_size, dart, &base)
        });

        // Ensemble state, replayed from the initial model when continuing.
        let (mut trees, mut weights) = match initial {
            Some(model) => {
                let trees = model.trees().to_vec();
                let weights = model.weights().to_vec();
                replay_into_scores(&binned, &trees, &weights, &base, &mut scores);
                if let (Some(tb), Some(ts)) = (binned_test.as_ref(), test_scores.as_mut()) {
                    replay_into_scores(tb, &trees, &weights, &base, ts);
                }
                (trees, weights)
            }
            None => (Vec::new(), Vec::new()),
        };

        let unordered: Vec<bool> = (0..binned.n_cols())
            .map(|c| discretizer.is_unordered(c))
            .collect();

        // Vertical split pays off when columns dominate rows.
        let vertical = binned.n_cols() > binned.n_rows();
        let shards = vertical.then(|| shard_columns(&binned, binned.partitions().len()));
        if vertical {
            logger.debug("histogram mode: vertical (column shards)");
        }

        let mut recorder = ResourceRecorder::new();
        let mut checkpointer = Checkpointer::<F>::new(self.config.checkpoint_interval);
        let mut train_history: MetricHistory = Vec::new();
        let mut test_history: MetricHistory = Vec::new();

        let start_iter =
            (trees.len() / raw_size / self.config.base_model_parallelism as usize) as u64;
        logger.info(&format!(
            "training {} rounds ({} existing trees, {} rows, {} columns)",
            self.config.max_iter,
            trees.len(),
            binned.n_rows(),
            binned.n_cols(),
        ));

        let mut round = 0u32;
        let mut stopped = false;
        loop {
            // Snapshot for this iteration; callbacks mutate between rounds.
            let cfg = self.config.clone();
            cfg.validate()?;
            if round >= cfg.max_iter || stopped {
                break;
            }
            let iter = start_iter + round as u64;
            let iter_seed = cfg.seed.wrapping_add(iter);

            // DART dropout for this round.
            let dropped_base = if dart {
                let mut rng = partition_rng(iter_seed, 0);
                sample_dropout(&cfg, trees.len() / raw_size, &mut rng)
            } else {
                Vec::new()
            };
            let dropped_trees = expand_to_trees(&dropped_base, raw_size);

            // Gradients from effective scores, scaled by row weight.
            let gradients = Arc::new(compute_gradients(
                &binned,
                &scores,
                &dropped_trees,
                &weights,
                self.objective.as_ref(),
            ));
            recorder.track("gradient-blocks", gradients.clone());

            // Row sampling per base model; tree specs per (base model, output).
            let parallelism = cfg.base_model_parallelism as usize;
            let mut specs = Vec::with_capacity(parallelism * raw_size);
            for b in 0..parallelism {
                let sample_seed = iter_seed.wrapping_add(1_000 * (b as u64 + 1));
                let rows = sample_base_model_rows(&binned, &cfg, sample_seed);
                for o in 0..raw_size {
                    specs.push(TreeSpec {
                        output: o,
                        seed: sample_seed.wrapping_add(1 + o as u64),
                        rows: rows.clone(),
                    });
                }
            }

            // Leaves store unscaled Newton weights; shrinkage is carried by
            // the ensemble weights (step_size for GBTree, the DART factors
            // for DART).
            let learner_params = LearnerParams {
                max_depth: cfg.max_depth,
                max_leaves: cfg.max_leaves,
                col_sample_by_tree: cfg.col_sample_by_tree,
                col_sample_by_level: cfg.col_sample_by_level,
                split: SplitParams {
                    reg_lambda: cfg.reg_lambda,
                    reg_alpha: cfg.reg_alpha,
                    min_gain: cfg.min_gain,
                    min_node_hess: cfg.min_node_hess,
                    max_brute_bins: cfg.max_brute_bins,
                },
                aggregation_depth: cfg.aggregation_depth,
            };
            let source = match &shards {
                Some(s) => HistogramSource::Vertical(s),
                None => HistogramSource::Horizontal,
            };
            let learner = TreeLearner::new(&binned, source, &unordered, learner_params);
            let new_trees = learner.grow(gradients.as_ref(), &specs);

            if new_trees.iter().all(|t| t.is_empty()) {
                logger.warn(&format!("iteration {iter} produced no tree, stopping"));
                break;
            }

            // Append trees, assign weights, update running scores.
            if dart {
                let raws = predict_tree_raws(&binned, &new_trees);
                scores.append_tree_raws(&raws);
                if let (Some(tb), Some(ts)) = (binned_test.as_ref(), test_scores.as_mut()) {
                    let test_raws = predict_tree_raws(tb, &new_trees);
                    ts.append_tree_raws(&test_raws);
                }
                let w_new = reweight(&mut weights, &dropped_trees, dropped_base.len(), cfg.step_size);
                for _ in &new_trees {
                    weights.push(w_new);
                }
                trees.extend(new_trees);
                scores.rebuild_acc(&base, &weights);
                if let Some(ts) = test_scores.as_mut() {
                    ts.rebuild_acc(&base, &weights);
                }
            } else {
                for tree in new_trees {
                    let output = trees.len() % raw_size;
                    add_tree_to_acc(&binned, &tree, output, cfg.step_size, &mut scores);
                    if let (Some(tb), Some(ts)) = (binned_test.as_ref(), test_scores.as_mut()) {
                        add_tree_to_acc(tb, &tree, output, cfg.step_size, ts);
                    }
                    trees.push(tree);
                    weights.push(cfg.step_size);
                }
            }

            // Evaluation on train and test.
            if !self.evals.is_empty() {
                let train_metrics = evaluate(
                    &binned,
                    &scores,
                    self.objective.as_ref(),
                    &self.evals,
                    cfg.aggregation_depth,
                );
                let mut logged = train_metrics.clone();
                train_history.push(train_metrics);
                if let (Some(tb), Some(ts)) = (binned_test.as_ref(), test_scores.as_ref()) {
                    let test_metrics = evaluate(
                        tb,
                        ts,
                        self.objective.as_ref(),
                        &self.evals,
                        cfg.aggregation_depth,
                    );
                    logged.extend(
                        test_metrics
                            .iter()
                            .map(|(n, v)| (format!("test-{n}"), *v)),
                    );
                    test_history.push(test_metrics);
                }
                logger.log_iteration(iter as u32, &logged);
            }

            // Callbacks see a snapshot and may mutate the live config.
            if !self.callbacks.is_empty() {
                let snapshot = GbmModel::new(
                    trees.clone(),
                    weights.clone(),
                    base.clone(),
                    discretizer.clone(),
                );
                for callback in &mut self.callbacks {
                    if callback.on_iteration(
                        &mut self.config,
                        &snapshot,
                        iter as u32,
                        &train_history,
                        &test_history,
                    ) {
                        logger.info(&format!(
                            "callback {} requested termination at iteration {iter}",
                            callback.name()
                        ));
                        stopped = true;
                    }
                }
            }

            checkpointer.tick(&mut scores, &mut recorder, &logger);
            recorder.release_all();
            round += 1;
        }

        logger.info(&format!("training finished with {} trees", trees.len()));
        Ok(GbmModel::new(trees, weights, base, discretizer))
    }
}

// ============================================================================
// Per-step helpers
// ============================================================================

/// Discretize raw instances into a binned, row-partitioned dataset.
fn bin_dataset<B: BinIndex>(
    data: &PartitionedDataset<RawInstance>,
    discretizer: &Discretizer,
    num_bins: &Arc<Vec<u32>>,
    raw_size: usize,
) -> Result<BinnedDataset<B>, ShapeError> {
    let n_cols = discretizer.n_cols();
    if data.n_rows() == 0 {
        return Err(ShapeError::EmptyDataset);
    }

    let parts: Vec<Result<(Vec<B>, Vec<f64>, Vec<f64>), ShapeError>> =
        data.map_partitions(|_, part| {
            let n = part.n_rows();
            let mut bins = vec![B::default(); n * n_cols];
            let mut row_weights = Vec::with_capacity(n);
            let mut labels = Vec::with_capacity(n * raw_size);
            for (row, inst) in part.iter().enumerate() {
                if inst.features.len() != n_cols {
                    return Err(ShapeError::FeatureCount {
                        expected: n_cols,
                        got: inst.features.len(),
                    });
                }
                if inst.label.len() != raw_size {
                    return Err(ShapeError::LabelSize {
                        expected: raw_size,
                        got: inst.label.len(),
                    });
                }
                for (c, &v) in inst.features.iter().enumerate() {
                    bins[c * n + row] = B::from_u32(discretizer.bin_value(c, v));
                }
                row_weights.push(inst.weight);
                labels.extend_from_slice(&inst.label);
            }
            Ok((bins, row_weights, labels))
        });

    let mut offset = 0;
    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        let (bins, row_weights, labels) = part?;
        let n = row_weights.len();
        out.push(BinnedPartition::new(bins, row_weights, labels, offset, n_cols));
        offset += n;
    }
    Ok(BinnedDataset::new(out, raw_size, num_bins.clone()))
}

/// Weighted per-output label mean, reduced across partitions.
fn label_mean<B: BinIndex>(binned: &BinnedDataset<B>, aggregation_depth: u32) -> Vec<f64> {
    let raw_size = binned.raw_size();
    let partials: Vec<(Vec<f64>, f64)> = binned
        .partitions()
        .par_iter()
        .map(|part| {
            let mut sums = vec![0.0; raw_size];
            let mut total = 0.0;
            for row in 0..part.n_rows() {
                let w = part.weights()[row];
                for (s, &l) in sums.iter_mut().zip(part.label(row, raw_size)) {
                    *s += w * l;
                }
                total += w;
            }
            (sums, total)
        })
        .collect();

    let (sums, total) = tree_reduce(partials, aggregation_depth, |(mut a, wa), (b, wb)| {
        for (x, y) in a.iter_mut().zip(b) {
            *x += y;
        }
        (a, wa + wb)
    })
    .unwrap_or((vec![0.0; raw_size], 0.0));

    if total > 0.0 {
        sums.into_iter().map(|s| s / total).collect()
    } else {
        vec![0.0; raw_size]
    }
}

/// Gradients from the effective scores (accumulated minus dropped trees),
/// scaled by row weight.
fn compute_gradients<B: BinIndex, F: GradFloat>(
    binned: &BinnedDataset<B>,
    scores: &RawScores<F>,
    dropped_trees: &[usize],
    weights: &[f64],
    objective: &dyn Objective,
) -> Gradients<F> {
    let raw_size = binned.raw_size();
    let blocks: Vec<GradientBlock<F>> = binned
        .partitions()
        .par_iter()
        .enumerate()
        .map(|(p, part)| {
            let n = part.n_rows();
            let mut block = GradientBlock::zeros(n, raw_size);
            let mut raw = vec![0.0; raw_size];
            let mut score = vec![0.0; raw_size];
            let mut grad = vec![0.0; raw_size];
            let mut hess = vec![0.0; raw_size];
            for row in 0..n {
                scores.effective_into(p, row, dropped_trees, weights, &mut raw);
                objective.transform(&raw, &mut score);
                objective.compute(part.label(row, raw_size), &score, &mut grad, &mut hess);
                let w = part.weights()[row];
                for o in 0..raw_size {
                    block.set(row, o, grad[o] * w, hess[o] * w);
                }
            }
            block
        })
        .collect();
    Gradients::new(blocks, raw_size)
}

/// Sample one base model's rows. `None` means every row (the bit-identical
/// no-sampling path).
fn sample_base_model_rows<B: BinIndex>(
    binned: &BinnedDataset<B>,
    config: &BoostConfig,
    seed: u64,
) -> Option<Arc<Vec<u32>>> {
    if config.sub_sample >= 1.0 {
        return None;
    }
    let mut rows = Vec::new();
    for (p, part) in binned.partitions().iter().enumerate() {
        let mut rng = partition_rng(seed, p);
        if let Some(local) = sample_partition_rows(
            part.n_rows(),
            config.sub_sample,
            config.block_size as usize,
            config.sample_blocks,
            &mut rng,
        ) {
            let offset = part.row_offset() as u32;
            rows.extend(local.into_iter().map(|r| offset + r));
        }
    }
    Some(Arc::new(rows))
}

/// Per-tree raw contributions: `result[tree][partition][row]`.
fn predict_tree_raws<B: BinIndex>(binned: &BinnedDataset<B>, trees: &[Tree]) -> Vec<Vec<Vec<f64>>> {
    trees
        .iter()
        .map(|tree| {
            binned
                .partitions()
                .par_iter()
                .map(|part| {
                    (0..part.n_rows())
                        .map(|row| tree.predict_by(|f| part.bin(row, f as usize)))
                        .collect()
                })
                .collect()
        })
        .collect()
}

/// GBTree score update: `acc[output] += weight * tree(row)`.
fn add_tree_to_acc<B: BinIndex, F: GradFloat>(
    binned: &BinnedDataset<B>,
    tree: &Tree,
    output: usize,
    weight: f64,
    scores: &mut RawScores<F>,
) {
    let parts = binned.partitions();
    scores.for_each_row_mut(|p, row, slice| {
        let part = &parts[p];
        let pred = tree.predict_by(|f| part.bin(row, f as usize));
        let slot = &mut slice[output];
        *slot = F::from_f64(slot.to_f64() + weight * pred);
    });
}

/// Run every configured evaluation over one dataset's current scores.
fn evaluate<B: BinIndex, F: GradFloat>(
    binned: &BinnedDataset<B>,
    scores: &RawScores<F>,
    objective: &dyn Objective,
    evals: &[EvalFunction],
    aggregation_depth: u32,
) -> Vec<(String, f64)> {
    let raw_size = binned.raw_size();
    let needs_batch = evals.iter().any(|e| matches!(e, EvalFunction::Batch(_)));
    let batch_rows = needs_batch.then(|| materialize_rows(binned, scores, objective));

    evals
        .iter()
        .map(|eval| match eval {
            EvalFunction::Incremental(metric) => {
                let partials: Vec<EvalAcc> = binned
                    .partitions()
                    .par_iter()
                    .enumerate()
                    .map(|(p, part)| {
                        let mut acc = EvalAcc::default();
                        let mut raw = vec![0.0; raw_size];
                        let mut score = vec![0.0; raw_size];
                        for row in 0..part.n_rows() {
                            for (o, v) in scores.acc(p, row).iter().enumerate() {
                                raw[o] = v.to_f64();
                            }
                            objective.transform(&raw, &mut score);
                            metric.fold(
                                &mut acc,
                                part.weights()[row],
                                part.label(row, raw_size),
                                &raw,
                                &score,
                            );
                        }
                        acc
                    })
                    .collect();
                let acc =
                    tree_reduce(partials, aggregation_depth, EvalAcc::merge).unwrap_or_default();
                (metric.name().to_string(), metric.finish(acc))
            }
            EvalFunction::Batch(metric) => {
                let rows = batch_rows.as_ref().expect("materialized above");
                (metric.name().to_string(), metric.compute(rows))
            }
        })
        .collect()
}

/// Materialize the (weight, label, raw, score) set for batch evaluators, in
/// global partition order.
fn materialize_rows<B: BinIndex, F: GradFloat>(
    binned: &BinnedDataset<B>,
    scores: &RawScores<F>,
    objective: &dyn Objective,
) -> EvalRows {
    let raw_size = binned.raw_size();
    let mut rows = EvalRows {
        raw_size,
        ..Default::default()
    };
    let mut raw = vec![0.0; raw_size];
    let mut score = vec![0.0; raw_size];
    for (p, part) in binned.partitions().iter().enumerate() {
        for row in 0..part.n_rows() {
            for (o, v) in scores.acc(p, row).iter().enumerate() {
                raw[o] = v.to_f64();
            }
            objective.transform(&raw, &mut score);
            rows.weight.push(part.weights()[row]);
            rows.label.extend_from_slice(part.label(row, raw_size));
            rows.raw.extend_from_slice(&raw);
            rows.score.extend_from_slice(&score);
        }
    }
    rows
}

/// Replay an initial model's trees into fresh score buffers, tree by tree in
/// append order, matching what a live run would have produced.
fn replay_into_scores<B: BinIndex, F: GradFloat>(
    binned: &BinnedDataset<B>,
    trees: &[Tree],
    weights: &[f64],
    base: &[f64],
    scores: &mut RawScores<F>,
) {
    let raw_size = binned.raw_size();
    if scores.is_dart() {
        let raws = predict_tree_raws(binned, trees);
        scores.append_tree_raws(&raws);
        scores.rebuild_acc(base, weights);
    } else {
        for (i, (tree, &w)) in trees.iter().zip(weights).enumerate() {
            add_tree_to_acc(binned, tree, i % raw_size, w, scores);
        }
    }
}

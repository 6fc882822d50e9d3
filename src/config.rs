//! Boosting configuration.
//!
//! [`BoostConfig`] carries every tunable of the booster. Invalid values are
//! rejected when the builder runs, with a message naming the parameter and
//! the accepted range. The driver snapshots the config into each iteration;
//! callbacks may mutate it between iterations (driver-side only), and the
//! driver re-validates after any mutation.

use derive_builder::Builder;

use crate::error::ConfigError;
use crate::logger::Verbosity;

/// Boosting algorithm family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoostType {
    /// Plain gradient boosted trees: append-only weights of `step_size`.
    #[default]
    GbTree,
    /// Dropout boosting: each round may drop a subset of existing trees
    /// when computing residuals, then rescales their weights.
    Dart,
}

/// How numeric columns are cut into bins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NumericalBinType {
    /// Equal-width bins between the observed min and max.
    Width,
    /// Approximate equal-depth (quantile) bins.
    #[default]
    Depth,
}

/// Gradient and raw-score storage precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FloatPrecision {
    Single,
    #[default]
    Double,
}

/// Full booster configuration.
///
/// Build with [`BoostConfig::builder()`]; `build()` validates every field.
///
/// ```
/// use dartboost::config::BoostConfig;
///
/// let config = BoostConfig::builder()
///     .max_iter(50u32)
///     .max_depth(3u32)
///     .step_size(0.1)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_iter, 50);
/// ```
#[derive(Debug, Clone, Builder)]
#[builder(setter(into), default, build_fn(name = "build_unchecked", private))]
pub struct BoostConfig {
    /// Number of boosting iterations.
    #[builder(default = "20")]
    pub max_iter: u32,

    /// Maximum tree depth (root is depth 0).
    #[builder(default = "5")]
    pub max_depth: u32,

    /// Hard cap on leaves per tree.
    #[builder(default = "1000")]
    pub max_leaves: u32,

    /// Maximum bins per column, including the missing bin.
    #[builder(default = "64")]
    pub max_bins: u32,

    /// Minimum gain to commit a split (gamma).
    #[builder(default = "0.0")]
    pub min_gain: f64,

    /// Minimum hessian sum per child.
    #[builder(default = "0.0")]
    pub min_node_hess: f64,

    /// Shrinkage applied to new trees (eta).
    #[builder(default = "0.1")]
    pub step_size: f64,

    /// L1 regularization on leaf weights.
    #[builder(default = "0.0")]
    pub reg_alpha: f64,

    /// L2 regularization on leaf weights.
    #[builder(default = "1.0")]
    pub reg_lambda: f64,

    /// Per-output base score. `None` means the weighted label mean.
    #[builder(default)]
    pub base_score: Option<Vec<f64>>,

    /// Row subsampling ratio per base model, (0, 1].
    #[builder(default = "1.0")]
    pub sub_sample: f64,

    /// Column subsampling ratio per tree, (0, 1].
    #[builder(default = "1.0")]
    pub col_sample_by_tree: f64,

    /// Column subsampling ratio per level, (0, 1].
    #[builder(default = "1.0")]
    pub col_sample_by_level: f64,

    /// Boosting family.
    #[builder(default)]
    pub boost_type: BoostType,

    /// DART: fraction of base models dropped per round.
    #[builder(default = "0.0")]
    pub drop_rate: f64,

    /// DART: probability of skipping dropout in a round.
    #[builder(default = "0.5")]
    pub drop_skip: f64,

    /// DART: lower clamp on the number of dropped base models.
    #[builder(default = "0")]
    pub min_drop: u32,

    /// DART: upper clamp on the number of dropped base models.
    #[builder(default = "50")]
    pub max_drop: u32,

    /// Categorical splits enumerate all bipartitions up to this many
    /// non-empty bins; larger cardinalities fall back to the sorted scan.
    #[builder(default = "10")]
    pub max_brute_bins: u32,

    /// Numeric binning strategy.
    #[builder(default)]
    pub numerical_bin_type: NumericalBinType,

    /// Treat a raw zero as missing, regardless of column kind.
    #[builder(default = "false")]
    pub zero_as_missing: bool,

    /// Checkpoint the raw-score series every this many iterations.
    /// Negative disables checkpointing; zero is invalid.
    #[builder(default = "10")]
    pub checkpoint_interval: i32,

    /// Depth of tree-reduce aggregations.
    #[builder(default = "2")]
    pub aggregation_depth: u32,

    /// Random seed.
    #[builder(default = "42")]
    pub seed: u64,

    /// Base models trained concurrently per iteration.
    #[builder(default = "1")]
    pub base_model_parallelism: u32,

    /// Rows per sampling block.
    #[builder(default = "4096")]
    pub block_size: u32,

    /// Sample whole blocks instead of single instances. Faster, coarser.
    #[builder(default = "true")]
    pub sample_blocks: bool,

    /// Gradient and raw-score storage precision.
    #[builder(default)]
    pub float_precision: FloatPrecision,

    /// Log verbosity.
    #[builder(default = "Verbosity::Silent")]
    pub verbosity: Verbosity,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            max_iter: 20,
            max_depth: 5,
            max_leaves: 1000,
            max_bins: 64,
            min_gain: 0.0,
            min_node_hess: 0.0,
            step_size: 0.1,
            reg_alpha: 0.0,
            reg_lambda: 1.0,
            base_score: None,
            sub_sample: 1.0,
            col_sample_by_tree: 1.0,
            col_sample_by_level: 1.0,
            boost_type: BoostType::GbTree,
            drop_rate: 0.0,
            drop_skip: 0.5,
            min_drop: 0,
            max_drop: 50,
            max_brute_bins: 10,
            numerical_bin_type: NumericalBinType::Depth,
            zero_as_missing: false,
            checkpoint_interval: 10,
            aggregation_depth: 2,
            seed: 42,
            base_model_parallelism: 1,
            block_size: 4096,
            sample_blocks: true,
            float_precision: FloatPrecision::Double,
            verbosity: Verbosity::Silent,
        }
    }
}

impl BoostConfig {
    pub fn builder() -> BoostConfigBuilder {
        BoostConfigBuilder::default()
    }

    /// Check every field against its accepted range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn ratio(param: &'static str, v: f64) -> Result<(), ConfigError> {
            if !(v > 0.0 && v <= 1.0) {
                return Err(ConfigError::invalid(param, "in (0, 1]", v));
            }
            Ok(())
        }
        fn probability(param: &'static str, v: f64) -> Result<(), ConfigError> {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::invalid(param, "in [0, 1]", v));
            }
            Ok(())
        }
        fn non_negative(param: &'static str, v: f64) -> Result<(), ConfigError> {
            if !(v.is_finite() && v >= 0.0) {
                return Err(ConfigError::invalid(param, "finite and >= 0", v));
            }
            Ok(())
        }

        if self.max_iter == 0 {
            return Err(ConfigError::invalid("max_iter", ">= 1", self.max_iter));
        }
        if !(1..=30).contains(&self.max_depth) {
            return Err(ConfigError::invalid("max_depth", "in [1, 30]", self.max_depth));
        }
        if self.max_leaves < 2 {
            return Err(ConfigError::invalid("max_leaves", ">= 2", self.max_leaves));
        }
        if !(2..=(1 << 20)).contains(&self.max_bins) {
            return Err(ConfigError::invalid("max_bins", "in [2, 2^20]", self.max_bins));
        }
        non_negative("min_gain", self.min_gain)?;
        non_negative("min_node_hess", self.min_node_hess)?;
        if !(self.step_size.is_finite() && self.step_size > 0.0) {
            return Err(ConfigError::invalid("step_size", "finite and > 0", self.step_size));
        }
        non_negative("reg_alpha", self.reg_alpha)?;
        non_negative("reg_lambda", self.reg_lambda)?;
        if let Some(base) = &self.base_score {
            if base.iter().any(|v| !v.is_finite()) {
                return Err(ConfigError::invalid("base_score", "finite", "non-finite entry"));
            }
        }
        ratio("sub_sample", self.sub_sample)?;
        ratio("col_sample_by_tree", self.col_sample_by_tree)?;
        ratio("col_sample_by_level", self.col_sample_by_level)?;
        probability("drop_rate", self.drop_rate)?;
        probability("drop_skip", self.drop_skip)?;
        if self.min_drop > self.max_drop {
            return Err(ConfigError::DropRangeInverted {
                min_drop: self.min_drop,
                max_drop: self.max_drop,
            });
        }
        if self.max_brute_bins > 30 {
            return Err(ConfigError::invalid("max_brute_bins", "<= 30", self.max_brute_bins));
        }
        if self.checkpoint_interval == 0 {
            return Err(ConfigError::invalid(
                "checkpoint_interval",
                "non-zero (negative disables)",
                self.checkpoint_interval,
            ));
        }
        if self.aggregation_depth == 0 {
            return Err(ConfigError::invalid("aggregation_depth", ">= 1", self.aggregation_depth));
        }
        if self.base_model_parallelism == 0 {
            return Err(ConfigError::invalid(
                "base_model_parallelism",
                ">= 1",
                self.base_model_parallelism,
            ));
        }
        if self.block_size == 0 {
            return Err(ConfigError::invalid("block_size", ">= 1", self.block_size));
        }
        Ok(())
    }
}

impl BoostConfigBuilder {
    /// Build and validate the configuration.
    pub fn build(&self) -> Result<BoostConfig, ConfigError> {
        let config = self
            .build_unchecked()
            .map_err(|e| ConfigError::Incomplete(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

//! dartboost: a histogram-based gradient boosting machine for Rust.
//!
//! Trains an additive ensemble of regression trees over a feature matrix
//! pre-discretized into integer bins, with GBTree and DART (dropout) boosting
//! over a row-partitioned dataset.
//!
//! # Key Types
//!
//! - [`GbmTrainer`] / [`BoostConfig`] - training entry point and tunables
//! - [`GbmModel`] - fitted ensemble with prediction, leaf ids, importance
//! - [`Objective`] / [`EvalFunction`] - loss and evaluation contracts
//! - [`Discretizer`] / [`ColumnSchema`] - per-column binning
//! - [`PartitionedDataset`] - the execution plane's partitioned input
//!
//! # Training
//!
//! ```no_run
//! use std::sync::Arc;
//! use dartboost::{BoostConfig, ColumnSchema, GbmTrainer, RawInstance};
//! use dartboost::exec::PartitionedDataset;
//! use dartboost::objective::SquaredLoss;
//!
//! let rows: Vec<RawInstance> = (0..100)
//!     .map(|i| RawInstance::labeled(i as f64, vec![i as f64]))
//!     .collect();
//! let train = PartitionedDataset::from_rows(rows, 4);
//! let config = BoostConfig::builder().max_iter(50u32).build().unwrap();
//! let model = GbmTrainer::new(config, Arc::new(SquaredLoss))
//!     .fit(&train, &ColumnSchema::all_numeric(1), None)
//!     .unwrap();
//! let prediction = model.predict(&[42.0], None).unwrap();
//! ```

pub mod boost;
pub mod config;
pub mod data;
pub mod discretizer;
pub mod error;
pub mod exec;
pub mod histogram;
pub mod logger;
pub mod metric;
pub mod model;
pub mod objective;
pub mod split;
pub mod tree;

// Convenience re-exports
pub use boost::{Callback, EarlyStopping, GbmTrainer};
pub use config::{BoostConfig, BoostType, FloatPrecision, NumericalBinType};
pub use data::RawInstance;
pub use discretizer::{ColumnKind, ColumnSchema, Discretizer};
pub use error::{ConfigError, PersistError, ShapeError, TrainError};
pub use exec::PartitionedDataset;
pub use logger::Verbosity;
pub use metric::EvalFunction;
pub use model::GbmModel;
pub use objective::Objective;

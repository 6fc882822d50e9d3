//! Boosting: the driver loop, DART dropout, raw-score maintenance, and
//! training callbacks.

pub mod callback;
pub mod dart;
pub mod scores;
pub mod trainer;

pub use callback::{Callback, EarlyStopping, MetricHistory};
pub use scores::{Checkpointer, RawScores};
pub use trainer::GbmTrainer;

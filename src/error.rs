//! Error types for configuration, data validation, and model persistence.

/// Configuration errors, rejected when a [`BoostConfig`] is built.
///
/// [`BoostConfig`]: crate::config::BoostConfig
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("{param} must be {requirement}, got {got}")]
    InvalidParam {
        param: &'static str,
        requirement: &'static str,
        got: String,
    },

    #[error("min_drop ({min_drop}) must not exceed max_drop ({max_drop})")]
    DropRangeInverted { min_drop: u32, max_drop: u32 },

    #[error("builder missing required field: {0}")]
    Incomplete(String),
}

impl ConfigError {
    pub(crate) fn invalid(
        param: &'static str,
        requirement: &'static str,
        got: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidParam {
            param,
            requirement,
            got: got.to_string(),
        }
    }
}

/// Shape and schema errors raised at fit or predict time.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ShapeError {
    #[error("row has {got} features but the discretizer was fit on {expected}")]
    FeatureCount { expected: usize, got: usize },

    #[error("label has {got} values but the objective expects {expected}")]
    LabelSize { expected: usize, got: usize },

    #[error("base_score has {got} values but raw size is {expected}")]
    BaseScoreSize { expected: usize, got: usize },

    #[error("dataset has no rows")]
    EmptyDataset,
}

/// Model load/store validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PersistError {
    #[error("tree indices are not a contiguous unique cover of [0, {n}): {detail}")]
    TreeIndexGap { n: usize, detail: String },

    #[error("{trees} trees but {weights} weights")]
    WeightCountMismatch { trees: usize, weights: usize },

    #[error("tree {tree_index} node {node} references missing child {child}")]
    DanglingChild {
        tree_index: u32,
        node: u32,
        child: u32,
    },

    #[error("missing extra entry: {0}")]
    MissingExtra(&'static str),

    #[error("serialization: {0}")]
    Serde(String),

    #[error("io: {0}")]
    Io(String),
}

impl From<serde_json::Error> for PersistError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serde(e.to_string())
    }
}

impl From<std::io::Error> for PersistError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Top-level training error.
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

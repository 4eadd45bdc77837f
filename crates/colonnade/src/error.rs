// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::dataset::ExampleId;
use std::path::PathBuf;

/// Result alias used throughout the crate.
pub type TrainResult<T> = Result<T, ColonnadeError>;

/// Errors emitted by the routing harness and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ColonnadeError {
    /// The dataset provider holds no examples at all.
    #[error("dataset provider holds no examples")]
    EmptyDataset,

    /// A batch of features does not match the provider's example width.
    #[error("feature width mismatch: expected {expected}, got {got}")]
    FeatureWidthMismatch { expected: usize, got: usize },

    /// An example id was requested that the provider does not know.
    #[error("unknown example id {0}")]
    UnknownExample(ExampleId),

    /// A column index escaped the configured pool range.
    #[error("column index {index} out of range for a pool of {columns} columns")]
    ColumnOutOfRange { index: usize, columns: usize },

    /// The largest assignment bucket is smaller than one batch, so an epoch
    /// would perform zero updates and the mean loss would divide by zero.
    #[error(
        "no updates possible this epoch: the largest bucket holds {max_examples} example(s) \
         but one batch needs {batch_size}; shrink the batch size or grow the dataset"
    )]
    EmptyTrainingBudget {
        max_examples: usize,
        batch_size: usize,
    },

    /// A session-wide configuration value is unusable.
    #[error("invalid training config: {0}")]
    InvalidConfig(String),

    /// A layer definition cannot be applied on top of the current stack.
    #[error("invalid layer stack: {0}")]
    InvalidLayerStack(String),

    /// A layer definition is malformed on its own terms.
    #[error("invalid layer spec: {0}")]
    InvalidLayerSpec(String),

    /// Training was requested on a column whose stack has no trainable layer.
    #[error("column has no trainable layer")]
    NoTrainableLayer,

    /// An activation handed to `invert` does not match the column's top shape.
    #[error("activation width mismatch: expected {expected}, got {got}")]
    ActivationWidthMismatch { expected: usize, got: usize },

    /// Wrapper around file-system failures when reading data or writing tiles.
    #[error("io failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An IDX-format dataset file did not parse.
    #[error("malformed idx file {path}: {reason}")]
    MalformedIdx { path: PathBuf, reason: String },

    /// Wrapper around serde failures when loading or saving layer stacks.
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ColonnadeError {
    /// Attaches a path to a raw I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

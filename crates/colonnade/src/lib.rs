// SPDX-License-Identifier: AGPL-3.0-or-later

//! Colonnade trains a pool of autoencoder columns that compete for examples.
//!
//! Each example is routed to the column reconstructing it best, columns are
//! then trained in a balanced fashion on the examples routed to them, and the
//! two phases alternate until the routing stops moving. Layers are added
//! greedily, one depth level at a time, with optional full-dataset
//! pretraining before the routing rounds begin.
//!
//! [`session::TrainingSession`] drives the whole loop; the pieces underneath
//! ([`assignment::assign`], [`trainer::BalancedTrainer`],
//! [`pretrain::pretrain_until_patience`], [`convergence::stationary`]) are
//! public so callers can compose their own drivers.

pub mod assignment;
pub mod autoencoder;
pub mod column;
pub mod config;
pub mod convergence;
pub mod dataset;
pub mod diagnostics;
pub mod error;
pub mod pretrain;
pub mod session;
pub mod trainer;

#[cfg(test)]
pub(crate) mod testsupport;

pub use assignment::{assign, AssignmentMap, ColumnStats};
pub use autoencoder::AutoencoderColumn;
pub use column::Column;
pub use config::{
    LayerKind, LayerSpec, PatienceMode, PretrainSchedule, TrainPlan, TrainingConfig,
};
pub use convergence::stationary;
pub use dataset::{DataProvider, ExampleId, InMemoryDataset, Minibatch};
pub use error::{ColonnadeError, TrainResult};
pub use session::{LayerOutcome, SessionReport, TrainingSession};
pub use trainer::BalancedTrainer;

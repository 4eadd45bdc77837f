// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::error::{ColonnadeError, TrainResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// Default number of competing columns.
pub const DEFAULT_COLUMNS: usize = 4;
/// Default minibatch size used by providers.
pub const DEFAULT_BATCH_SIZE: usize = 256;
/// Default number of balanced-training epochs per routing round.
pub const DEFAULT_STEPS_PER_ROUND: usize = 1;
/// Default patience budget for open-ended pretraining.
pub const DEFAULT_PATIENCE: usize = 5;
/// Default minimum fractional improvement that resets the patience counter.
pub const DEFAULT_PATIENCE_DELTA: f32 = 1e-5;
/// Default cap on exemplar ids collected per column.
pub const DEFAULT_EXEMPLAR_CAP: usize = 64;
/// Hard cap on open-ended pretraining epochs. Without one, a column whose
/// loss keeps creeping down by more than the delta trains forever.
pub const DEFAULT_PRETRAIN_EPOCH_CAP: usize = 1000;

/// Structural description of one layer added to every column simultaneously.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LayerKind {
    /// Convolutional autoencoder layer (square kernel, valid padding).
    Conv {
        kernel: usize,
        stride: usize,
        channels: usize,
    },
    /// Fully connected autoencoder layer.
    Dense { units: usize },
    /// Input-masking corruption layer; active during training only.
    Corruption { level: f32 },
}

/// How a layer is pretrained on the full dataset before routing starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PretrainSchedule {
    /// No pretraining for this layer.
    Skip,
    /// Exactly this many full-dataset epochs.
    Fixed(usize),
    /// Train until `patience` consecutive non-improving epochs accumulate.
    UntilPatience,
}

/// Selects how per-column improvements gate the patience counter.
///
/// Under [`PatienceMode::SharedMin`] the minimum fractional change across all
/// columns feeds one shared counter, so the best-improving column keeps
/// everyone training.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatienceMode {
    /// One shared counter, reset whenever any column improves enough.
    #[default]
    SharedMin,
    /// Per-column counters; pretraining stops once every column has stalled.
    PerColumn,
}

/// Training policy attached to a layer definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainPlan {
    pub schedule: PretrainSchedule,
    pub patience: usize,
    pub patience_delta: f32,
    /// Fraction of unchanged assignments that counts as stationary.
    pub convergence_threshold: f32,
    /// Untrainable layers (e.g. corruption) skip pretraining and routing.
    pub trainable: bool,
}

impl Default for TrainPlan {
    fn default() -> Self {
        Self {
            schedule: PretrainSchedule::Skip,
            patience: DEFAULT_PATIENCE,
            patience_delta: DEFAULT_PATIENCE_DELTA,
            convergence_threshold: 0.0,
            trainable: true,
        }
    }
}

/// Immutable configuration record describing one depth level of the stack.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub kind: LayerKind,
    pub learning_rate: f32,
    pub plan: TrainPlan,
}

impl LayerSpec {
    /// Convolutional layer with the default training plan.
    pub fn conv(kernel: usize, stride: usize, channels: usize) -> Self {
        Self {
            kind: LayerKind::Conv {
                kernel,
                stride,
                channels,
            },
            learning_rate: 0.1,
            plan: TrainPlan::default(),
        }
    }

    /// Fully connected layer with the default training plan.
    pub fn dense(units: usize) -> Self {
        Self {
            kind: LayerKind::Dense { units },
            learning_rate: 0.1,
            plan: TrainPlan::default(),
        }
    }

    /// Corruption layer; never trained or routed on.
    pub fn corruption(level: f32) -> Self {
        Self {
            kind: LayerKind::Corruption { level },
            learning_rate: 0.0,
            plan: TrainPlan {
                trainable: false,
                ..TrainPlan::default()
            },
        }
    }

    /// Overrides the learning rate.
    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Overrides the pretraining schedule.
    pub fn with_schedule(mut self, schedule: PretrainSchedule) -> Self {
        self.plan.schedule = schedule;
        self
    }

    /// Overrides the patience budget and delta.
    pub fn with_patience(mut self, patience: usize, delta: f32) -> Self {
        self.plan.patience = patience;
        self.plan.patience_delta = delta;
        self
    }

    /// Overrides the stationarity threshold for the routing rounds.
    pub fn with_convergence_threshold(mut self, threshold: f32) -> Self {
        self.plan.convergence_threshold = threshold;
        self
    }

    /// Validates the structural fields before the spec reaches a column.
    pub fn validate(&self) -> TrainResult<()> {
        match self.kind {
            LayerKind::Conv {
                kernel, stride, ..
            } if kernel == 0 || stride == 0 => Err(ColonnadeError::InvalidLayerSpec(format!(
                "conv kernel and stride must be positive (kernel={kernel}, stride={stride})"
            ))),
            LayerKind::Conv { channels, .. } if channels == 0 => Err(
                ColonnadeError::InvalidLayerSpec("conv layer needs at least one channel".into()),
            ),
            LayerKind::Dense { units } if units == 0 => Err(ColonnadeError::InvalidLayerSpec(
                "dense layer needs at least one unit".into(),
            )),
            LayerKind::Corruption { level } if !(0.0..=1.0).contains(&level) => {
                Err(ColonnadeError::InvalidLayerSpec(format!(
                    "corruption level must stay within [0, 1], got {level}"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Session-wide knobs, passed in once and never mutated afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of competing encoder columns.
    pub columns: usize,
    /// Balanced-training epochs run between consecutive map rebuilds. This is
    /// deliberately a separate knob from any pretraining epoch budget.
    pub steps_per_round: usize,
    /// Number of distinct ground-truth labels, for the entropy report.
    pub num_labels: usize,
    /// Cap on exemplar ids collected per column.
    pub exemplar_cap: usize,
    /// Patience policy for open-ended pretraining.
    pub patience_mode: PatienceMode,
    /// Safety cap on open-ended pretraining epochs.
    pub pretrain_epoch_cap: usize,
    /// Seed for column weight init and corruption masks.
    pub seed: u64,
    /// Directory receiving diagnostic tiles and reports; `None` disables them.
    pub out_dir: Option<PathBuf>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            columns: DEFAULT_COLUMNS,
            steps_per_round: DEFAULT_STEPS_PER_ROUND,
            num_labels: 10,
            exemplar_cap: DEFAULT_EXEMPLAR_CAP,
            patience_mode: PatienceMode::default(),
            pretrain_epoch_cap: DEFAULT_PRETRAIN_EPOCH_CAP,
            seed: 42,
            out_dir: None,
        }
    }
}

impl TrainingConfig {
    /// Overrides the column count.
    pub fn with_columns(mut self, columns: usize) -> Self {
        self.columns = columns;
        self
    }

    /// Overrides the per-round training budget.
    pub fn with_steps_per_round(mut self, steps: usize) -> Self {
        self.steps_per_round = steps;
        self
    }

    /// Overrides the diagnostics output directory.
    pub fn with_out_dir(mut self, out_dir: impl Into<PathBuf>) -> Self {
        self.out_dir = Some(out_dir.into());
        self
    }

    /// Overrides the seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Loads a layer stack from a JSON file.
pub fn load_layers(path: &Path) -> TrainResult<Vec<LayerSpec>> {
    let file = File::open(path).map_err(|err| ColonnadeError::io(path, err))?;
    let layers: Vec<LayerSpec> = serde_json::from_reader(BufReader::new(file))?;
    for layer in &layers {
        layer.validate()?;
    }
    Ok(layers)
}

/// Saves a layer stack to a JSON file.
pub fn save_layers(path: &Path, layers: &[LayerSpec]) -> TrainResult<()> {
    let file = File::create(path).map_err(|err| ColonnadeError::io(path, err))?;
    serde_json::to_writer_pretty(BufWriter::new(file), layers)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_spec_builders_compose() {
        let spec = LayerSpec::conv(5, 2, 8)
            .with_learning_rate(0.7)
            .with_schedule(PretrainSchedule::UntilPatience)
            .with_patience(10, 1e-4)
            .with_convergence_threshold(0.99);
        assert!(spec.validate().is_ok());
        assert_eq!(spec.plan.patience, 10);
        assert_eq!(spec.plan.schedule, PretrainSchedule::UntilPatience);
        assert!((spec.plan.convergence_threshold - 0.99).abs() < f32::EPSILON);
    }

    #[test]
    fn corruption_layers_are_untrainable() {
        let spec = LayerSpec::corruption(0.15);
        assert!(!spec.plan.trainable);
        assert!(spec.validate().is_ok());
        assert!(LayerSpec::corruption(1.5).validate().is_err());
    }

    #[test]
    fn degenerate_specs_are_rejected() {
        assert!(LayerSpec::conv(0, 1, 8).validate().is_err());
        assert!(LayerSpec::conv(3, 1, 0).validate().is_err());
        assert!(LayerSpec::dense(0).validate().is_err());
    }

    #[test]
    fn layer_stack_round_trips_through_json() {
        let dir = std::env::temp_dir().join("colonnade-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("layers.json");
        let layers = vec![
            LayerSpec::corruption(0.15),
            LayerSpec::conv(5, 2, 8),
            LayerSpec::dense(16).with_schedule(PretrainSchedule::Fixed(20)),
        ];
        save_layers(&path, &layers).unwrap();
        let restored = load_layers(&path).unwrap();
        assert_eq!(layers, restored);
    }
}

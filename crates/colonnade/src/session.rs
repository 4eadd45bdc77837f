// SPDX-License-Identifier: AGPL-3.0-or-later

//! Outer training loop: grow every column by one layer, optionally pretrain
//! on the full dataset, then alternate map rebuilds with balanced training
//! until the routing goes stationary, and finish with diagnostics.

use crate::assignment::{assign, AssignmentMap};
use crate::autoencoder::AutoencoderColumn;
use crate::column::Column;
use crate::config::{LayerSpec, PretrainSchedule, TrainingConfig};
use crate::convergence::stationary;
use crate::dataset::DataProvider;
use crate::diagnostics::{
    save_exemplars, save_feature_tiles, save_reconstructions, save_top_activations,
    write_column_report, EntropyReport,
};
use crate::error::{ColonnadeError, TrainResult};
use crate::pretrain::{pretrain_fixed, pretrain_until_patience, PretrainReport};
use crate::trainer::BalancedTrainer;
use std::path::PathBuf;
use tracing::info;

/// What happened while processing one layer definition.
#[derive(Clone, Debug)]
pub struct LayerOutcome {
    pub layer: usize,
    pub pretrain: Option<PretrainReport>,
    /// Assignment/training alternations before the routing went stationary.
    pub rounds: usize,
    pub final_counts: Vec<usize>,
    pub entropies: Vec<f32>,
}

/// Summary of a full session over a layer stack.
#[derive(Clone, Debug, Default)]
pub struct SessionReport {
    pub layers: Vec<LayerOutcome>,
}

/// Owns the column pool, the provider handle, and the current assignment;
/// every piece of training state mutates only through these methods.
pub struct TrainingSession<C: Column, P: DataProvider> {
    columns: Vec<C>,
    provider: P,
    config: TrainingConfig,
    assignment: Option<AssignmentMap>,
}

impl<P: DataProvider> TrainingSession<AutoencoderColumn, P> {
    /// Builds a session over a pool of freshly seeded autoencoder columns.
    pub fn with_autoencoders(provider: P, config: TrainingConfig) -> TrainResult<Self> {
        let shape = provider.shape();
        let columns = (0..config.columns)
            .map(|col| AutoencoderColumn::new(shape, config.seed.wrapping_add(col as u64)))
            .collect();
        Self::new(columns, provider, config)
    }
}

impl<C: Column, P: DataProvider> TrainingSession<C, P> {
    /// Wraps an existing column pool.
    pub fn new(columns: Vec<C>, provider: P, config: TrainingConfig) -> TrainResult<Self> {
        if columns.is_empty() {
            return Err(ColonnadeError::InvalidConfig(
                "the column pool needs at least one column".into(),
            ));
        }
        if config.steps_per_round == 0 {
            return Err(ColonnadeError::InvalidConfig(
                "steps_per_round must be at least 1".into(),
            ));
        }
        if provider.is_empty() {
            return Err(ColonnadeError::EmptyDataset);
        }
        if let Some(dir) = &config.out_dir {
            std::fs::create_dir_all(dir).map_err(|err| ColonnadeError::io(dir.clone(), err))?;
        }
        Ok(Self {
            columns,
            provider,
            config,
            assignment: None,
        })
    }

    /// Immutable view of the column pool.
    pub fn columns(&self) -> &[C] {
        &self.columns
    }

    /// The most recent assignment map, once a trainable layer has run.
    pub fn assignment(&self) -> Option<&AssignmentMap> {
        self.assignment.as_ref()
    }

    /// Applies every layer definition in order and returns the per-layer
    /// outcomes. Collaborator failures abort the current layer and surface.
    pub fn run(&mut self, layers: &[LayerSpec]) -> TrainResult<SessionReport> {
        let mut report = SessionReport::default();
        for (index, spec) in layers.iter().enumerate() {
            report.layers.push(self.run_layer(index, spec)?);
        }
        Ok(report)
    }

    fn run_layer(&mut self, index: usize, spec: &LayerSpec) -> TrainResult<LayerOutcome> {
        for column in &mut self.columns {
            column.add_layer(spec)?;
        }
        info!(layer = index, kind = ?spec.kind, "layer added to every column");

        if !spec.plan.trainable {
            return Ok(LayerOutcome {
                layer: index,
                pretrain: None,
                rounds: 0,
                final_counts: Vec::new(),
                entropies: Vec::new(),
            });
        }

        let pretrain = match spec.plan.schedule {
            PretrainSchedule::Skip => None,
            PretrainSchedule::Fixed(epochs) => Some(pretrain_fixed(
                &mut self.columns,
                &self.provider,
                epochs,
            )?),
            PretrainSchedule::UntilPatience => Some(pretrain_until_patience(
                &mut self.columns,
                &self.provider,
                &spec.plan,
                self.config.patience_mode,
                self.config.pretrain_epoch_cap,
            )?),
        };
        if let Some(stage) = &pretrain {
            info!(
                layer = index,
                epochs = stage.epochs,
                losses = ?stage.final_losses,
                "all columns pretrained on all data"
            );
        }
        self.save_layer_tiles(index)?;

        let mut trainer = BalancedTrainer::new(self.columns.len(), self.provider.batch_size());
        let mut previous: Option<AssignmentMap> = None;
        let mut current = assign(&self.columns, &self.provider)?;
        let mut epoch = 0usize;
        let mut rounds = 0usize;
        while !stationary(
            Some(&current),
            previous.as_ref(),
            spec.plan.convergence_threshold,
        ) {
            info!(counts = ?current.stats().counts(), "mapping distribution");
            let losses = trainer.train_round(
                &mut self.columns,
                &self.provider,
                &current,
                self.config.steps_per_round,
                epoch,
            )?;
            info!(losses = ?losses, "encoding loss on mapped examples");
            epoch += self.config.steps_per_round;
            rounds += 1;
            previous = Some(current);
            current = assign(&self.columns, &self.provider)?;
        }
        info!(layer = index, rounds, "routing stationary");

        let entropy = EntropyReport::build(&current, &self.provider, self.config.num_labels)?;
        info!(layer = index, entropies = ?entropy.entropies, "column label entropies");
        self.save_round_reports(index, &current, &entropy)?;

        let outcome = LayerOutcome {
            layer: index,
            pretrain,
            rounds,
            final_counts: current.stats().counts().to_vec(),
            entropies: entropy.entropies.clone(),
        };
        self.assignment = Some(current);
        Ok(outcome)
    }

    fn out_path(&self, name: String) -> Option<PathBuf> {
        self.config.out_dir.as_ref().map(|dir| dir.join(name))
    }

    fn save_layer_tiles(&self, index: usize) -> TrainResult<()> {
        let level = index + 1;
        for (col, column) in self.columns.iter().enumerate() {
            if let Some(path) = self.out_path(format!("im_recon_col{col}_level{level}.pgm")) {
                save_reconstructions(column, &self.provider, &path)?;
            }
            if let Some(path) = self.out_path(format!("col{col}_level{level}.pgm")) {
                save_feature_tiles(column, &self.provider, &path)?;
            }
            if let Some(path) = self.out_path(format!("top_col{col}_level{level}.pgm")) {
                save_top_activations(column, &self.provider, &path)?;
            }
        }
        Ok(())
    }

    fn save_round_reports(
        &self,
        index: usize,
        map: &AssignmentMap,
        entropy: &EntropyReport,
    ) -> TrainResult<()> {
        let level = index + 1;
        if let Some(path) = self.out_path(format!("col2key_level{level}.txt")) {
            write_column_report(&path, entropy, map)?;
        }
        for col in 0..self.columns.len() {
            if let Some(path) = self.out_path(format!("col{col}_exemplars_level{level}.pgm")) {
                save_exemplars(map, &self.provider, col, self.config.exemplar_cap, &path)?;
            }
        }
        Ok(())
    }
}

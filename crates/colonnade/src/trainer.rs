// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::assignment::AssignmentMap;
use crate::column::Column;
use crate::dataset::{DataProvider, ExampleId};
use crate::error::{ColonnadeError, TrainResult};
use tracing::{debug, info};

/// Trains every column on a cycle of its assigned examples, with starved
/// columns falling back to the full dataset for the epoch.
///
/// Per-column cursors are explicit state on the trainer, so batch rotation
/// continues smoothly across the epochs of one routing round.
pub struct BalancedTrainer {
    batch_size: usize,
    cursors: Vec<usize>,
}

impl BalancedTrainer {
    /// Creates a trainer for a pool of `columns` columns.
    pub fn new(columns: usize, batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            cursors: vec![0; columns],
        }
    }

    /// Updates performed per epoch for the given assignment: the largest
    /// bucket divided by the batch size, with the whole dataset standing in
    /// for the largest bucket whenever any column starved. The remainder
    /// batch is dropped, not padded.
    pub fn updates_per_epoch<P: DataProvider + ?Sized>(
        &self,
        map: &AssignmentMap,
        provider: &P,
    ) -> usize {
        let stats = map.stats();
        let max_examples = if stats.has_starved_column() {
            provider.len()
        } else {
            stats.max_count()
        };
        max_examples / self.batch_size
    }

    /// Runs `epochs` training passes under the given assignment and returns
    /// the per-column loss averaged over the final epoch's updates.
    ///
    /// `first_epoch` only labels the log lines; the routing round length is
    /// configured by the caller and is not the same thing as a pretraining
    /// epoch budget.
    pub fn train_round<C, P>(
        &mut self,
        columns: &mut [C],
        provider: &P,
        map: &AssignmentMap,
        epochs: usize,
        first_epoch: usize,
    ) -> TrainResult<Vec<f32>>
    where
        C: Column,
        P: DataProvider + ?Sized,
    {
        if columns.len() != map.columns() {
            return Err(ColonnadeError::ColumnOutOfRange {
                index: map.columns(),
                columns: columns.len(),
            });
        }
        let stats = map.stats();
        let pools: Vec<&[ExampleId]> = (0..columns.len())
            .map(|col| {
                let members = stats.members(col);
                if members.is_empty() {
                    info!(column = col, "column has no examples mapped to it; training it on all data");
                    provider.ids()
                } else {
                    members
                }
            })
            .collect();
        for (col, pool) in pools.iter().enumerate() {
            debug!(column = col, examples = pool.len(), "training pool sized");
        }

        let updates = self.updates_per_epoch(map, provider);
        if updates == 0 {
            let max_examples = if stats.has_starved_column() {
                provider.len()
            } else {
                stats.max_count()
            };
            return Err(ColonnadeError::EmptyTrainingBudget {
                max_examples,
                batch_size: self.batch_size,
            });
        }

        let mut losses = vec![0.0f32; columns.len()];
        for epoch in first_epoch..first_epoch + epochs {
            info!(epoch, "balanced training epoch");
            losses.fill(0.0);
            for _ in 0..updates {
                for (col, column) in columns.iter_mut().enumerate() {
                    let batch_ids = self.next_batch(col, pools[col]);
                    let mb = provider.by_ids(&batch_ids)?;
                    losses[col] += column.train_on_batch(&mb.features)?;
                }
            }
        }
        Ok(losses.into_iter().map(|sum| sum / updates as f32).collect())
    }

    /// Draws `batch_size` ids by cycling the pool from the column's cursor,
    /// so a bucket smaller than one batch still fills every step.
    fn next_batch(&mut self, col: usize, pool: &[ExampleId]) -> Vec<ExampleId> {
        let cursor = self.cursors[col];
        let batch: Vec<ExampleId> = (0..self.batch_size)
            .map(|offset| pool[(cursor + offset) % pool.len()])
            .collect();
        self.cursors[col] = (cursor + self.batch_size) % pool.len();
        batch
    }
}

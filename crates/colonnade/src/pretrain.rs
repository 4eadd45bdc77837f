// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::column::Column;
use crate::config::{PatienceMode, TrainPlan};
use crate::dataset::DataProvider;
use crate::error::{ColonnadeError, TrainResult};
use tracing::{info, warn};

/// Best-loss records start here so the first epoch can only improve.
const INITIAL_BEST_LOSS: f32 = 10.0;

/// Outcome of a pretraining stage.
#[derive(Clone, Debug, PartialEq)]
pub struct PretrainReport {
    /// Full-dataset epochs actually run.
    pub epochs: usize,
    /// Mean loss per column from the final epoch, empty when skipped.
    pub final_losses: Vec<f32>,
    /// Whether the safety cap cut an open-ended stage short.
    pub capped: bool,
}

impl PretrainReport {
    fn skipped(columns: usize) -> Self {
        Self {
            epochs: 0,
            final_losses: vec![INITIAL_BEST_LOSS; columns],
            capped: false,
        }
    }
}

/// One full-dataset epoch: every column trains on every minibatch,
/// unconditionally. Returns the mean loss per column.
pub fn pretrain_epoch<C, P>(
    columns: &mut [C],
    provider: &P,
    epoch: usize,
) -> TrainResult<Vec<f32>>
where
    C: Column,
    P: DataProvider + ?Sized,
{
    info!(epoch, "pretrain epoch");
    let mut losses = vec![0.0f32; columns.len()];
    let mut batches = 0usize;
    for mb in provider.minibatches() {
        batches += 1;
        for (col, column) in columns.iter_mut().enumerate() {
            losses[col] += column.train_on_batch(&mb.features)?;
        }
    }
    if batches == 0 {
        return Err(ColonnadeError::EmptyDataset);
    }
    Ok(losses.into_iter().map(|sum| sum / batches as f32).collect())
}

/// Runs a fixed number of full-dataset epochs.
pub fn pretrain_fixed<C, P>(
    columns: &mut [C],
    provider: &P,
    epochs: usize,
) -> TrainResult<PretrainReport>
where
    C: Column,
    P: DataProvider + ?Sized,
{
    let mut final_losses = vec![INITIAL_BEST_LOSS; columns.len()];
    for epoch in 0..epochs {
        final_losses = pretrain_epoch(columns, provider, epoch)?;
        info!(epoch, losses = ?final_losses, "pretrain losses");
    }
    Ok(PretrainReport {
        epochs,
        final_losses,
        capped: false,
    })
}

/// Trains until the patience criterion fires, or until `epoch_cap` epochs
/// have run.
///
/// Under [`PatienceMode::SharedMin`] a single counter is shared by all
/// columns and resets whenever the best-improving column beats the delta, so
/// the strongest improver keeps everyone training. Under
/// [`PatienceMode::PerColumn`] each column carries its own counter and the
/// stage stops once every counter is exhausted.
pub fn pretrain_until_patience<C, P>(
    columns: &mut [C],
    provider: &P,
    plan: &TrainPlan,
    mode: PatienceMode,
    epoch_cap: usize,
) -> TrainResult<PretrainReport>
where
    C: Column,
    P: DataProvider + ?Sized,
{
    if plan.patience == 0 {
        return Ok(PretrainReport::skipped(columns.len()));
    }
    let mut losses = vec![INITIAL_BEST_LOSS; columns.len()];
    let mut best = losses.clone();
    let mut shared_patience = 0usize;
    let mut per_column_patience = vec![0usize; columns.len()];
    let mut epoch = 0usize;
    let mut capped = false;

    loop {
        let stop = match mode {
            PatienceMode::SharedMin => shared_patience >= plan.patience,
            PatienceMode::PerColumn => per_column_patience
                .iter()
                .all(|&count| count >= plan.patience),
        };
        if stop {
            break;
        }
        if epoch >= epoch_cap {
            warn!(epoch_cap, "pretraining hit the safety cap before converging");
            capped = true;
            break;
        }
        for (slot, &loss) in losses.iter().enumerate() {
            best[slot] = best[slot].min(loss);
        }
        losses = pretrain_epoch(columns, provider, epoch)?;
        let improvements: Vec<f32> = losses
            .iter()
            .zip(best.iter())
            .map(|(&new, &old)| (new - old) / old.abs())
            .collect();
        match mode {
            PatienceMode::SharedMin => {
                let sharpest = improvements
                    .iter()
                    .copied()
                    .fold(f32::INFINITY, f32::min);
                if sharpest < -plan.patience_delta {
                    shared_patience = 0;
                    info!(epoch, losses = ?losses, "pretrain losses ***");
                } else {
                    shared_patience += 1;
                    info!(epoch, losses = ?losses, "pretrain losses");
                }
            }
            PatienceMode::PerColumn => {
                for (slot, &improvement) in improvements.iter().enumerate() {
                    if improvement < -plan.patience_delta {
                        per_column_patience[slot] = 0;
                    } else {
                        per_column_patience[slot] += 1;
                    }
                }
                info!(epoch, losses = ?losses, "pretrain losses");
            }
        }
        epoch += 1;
    }

    Ok(PretrainReport {
        epochs: epoch,
        final_losses: losses,
        capped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainPlan;
    use crate::testsupport::{toy_provider, ScriptedColumn};

    fn plan(patience: usize, delta: f32) -> TrainPlan {
        TrainPlan {
            patience,
            patience_delta: delta,
            ..TrainPlan::default()
        }
    }

    #[test]
    fn fixed_pretraining_runs_exactly_the_budget() {
        let provider = toy_provider(8, 4);
        let mut columns = vec![ScriptedColumn::constant(2.0)];
        let report = pretrain_fixed(&mut columns, &provider, 3).unwrap();
        assert_eq!(report.epochs, 3);
        // Two minibatches per epoch over three epochs.
        assert_eq!(columns[0].seen_ids().len(), 3 * 8);
        assert!((report.final_losses[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn every_column_sees_every_batch_during_pretraining() {
        let provider = toy_provider(8, 4);
        let mut columns = vec![ScriptedColumn::constant(1.0), ScriptedColumn::constant(1.0)];
        pretrain_epoch(&mut columns, &provider, 0).unwrap();
        for column in &columns {
            assert_eq!(column.seen_ids(), (0..8u64).collect::<Vec<_>>());
        }
    }

    #[test]
    fn flat_losses_exhaust_patience_after_exactly_two_epochs() {
        let provider = toy_provider(4, 4);
        let mut columns = vec![ScriptedColumn::constant(10.0)];
        let report = pretrain_until_patience(
            &mut columns,
            &provider,
            &plan(2, 0.1),
            PatienceMode::SharedMin,
            100,
        )
        .unwrap();
        // Losses stay at the 10.0 baseline, so no epoch improves by more
        // than 10% and the stage stops after two non-improving epochs.
        assert_eq!(report.epochs, 2);
        assert!(!report.capped);
    }

    #[test]
    fn a_single_improving_column_resets_shared_patience() {
        let provider = toy_provider(4, 4);
        // One minibatch per epoch, so the script reads one entry per epoch.
        let mut columns = vec![
            ScriptedColumn::with_losses(vec![10.0, 10.0, 10.0, 10.0]),
            ScriptedColumn::with_losses(vec![10.0, 5.0, 10.0, 10.0]),
        ];
        let report = pretrain_until_patience(
            &mut columns,
            &provider,
            &plan(2, 0.1),
            PatienceMode::SharedMin,
            100,
        )
        .unwrap();
        // Epoch 0 improves on the 10.0 baseline for nobody, epoch 1 improves
        // column 1 by 50% and resets the shared counter; two flat epochs
        // follow before the stage stops.
        assert_eq!(report.epochs, 4);
    }

    #[test]
    fn per_column_mode_waits_for_every_column_to_stall() {
        let provider = toy_provider(4, 4);
        let mut columns = vec![
            ScriptedColumn::constant(10.0),
            ScriptedColumn::with_losses(vec![10.0, 5.0, 2.0, 2.0, 2.0]),
        ];
        let shared = pretrain_until_patience(
            &mut vec![ScriptedColumn::constant(10.0)],
            &provider,
            &plan(2, 0.1),
            PatienceMode::SharedMin,
            100,
        )
        .unwrap();
        let per_column = pretrain_until_patience(
            &mut columns,
            &provider,
            &plan(2, 0.1),
            PatienceMode::PerColumn,
            100,
        )
        .unwrap();
        assert!(per_column.epochs > shared.epochs);
    }

    #[test]
    fn safety_cap_bounds_an_ever_improving_run() {
        let provider = toy_provider(4, 4);
        // Halving every epoch always beats a 10% delta.
        let script: Vec<f32> = (0..64).map(|e| 10.0 / (1 << e.min(30)) as f32).collect();
        let mut columns = vec![ScriptedColumn::with_losses(script)];
        let report = pretrain_until_patience(
            &mut columns,
            &provider,
            &plan(2, 0.1),
            PatienceMode::SharedMin,
            5,
        )
        .unwrap();
        assert!(report.capped);
        assert_eq!(report.epochs, 5);
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared fixtures for the routing tests: a provider whose feature vectors
//! embed the example id in slot 0, and scripted columns that expose which
//! examples they were trained on.

use crate::column::Column;
use crate::config::LayerSpec;
use crate::dataset::{ExampleId, InMemoryDataset};
use crate::error::TrainResult;
use ndarray::{Array1, Array2};

pub(crate) const TOY_WIDTH: usize = 4;

/// Dataset of `rows` examples where `features[[r, 0]] == r` and labels cycle
/// through 0..3.
pub(crate) fn toy_provider(rows: usize, batch: usize) -> InMemoryDataset {
    let labels: Vec<usize> = (0..rows).map(|r| r % 3).collect();
    labeled_provider(&labels, batch)
}

/// Dataset with caller-chosen labels; ids remain the row numbers.
pub(crate) fn labeled_provider(labels: &[usize], batch: usize) -> InMemoryDataset {
    let rows = labels.len();
    let features = Array2::from_shape_fn((rows, TOY_WIDTH), |(r, c)| {
        if c == 0 {
            r as f32
        } else {
            0.0
        }
    });
    InMemoryDataset::new(features, labels.to_vec(), (1, 2, 2), batch).unwrap()
}

fn ids_from_features(features: &Array2<f32>) -> Vec<ExampleId> {
    features
        .rows()
        .into_iter()
        .map(|row| row[0] as ExampleId)
        .collect()
}

/// Column whose per-example loss is the distance between feature slot 0 and a
/// fixed centre, so routing outcomes are fully predictable.
pub(crate) struct NearestCenterColumn {
    center: f32,
    seen: Vec<ExampleId>,
}

impl NearestCenterColumn {
    pub(crate) fn new(center: f32) -> Self {
        Self {
            center,
            seen: Vec::new(),
        }
    }
}

impl Column for NearestCenterColumn {
    fn add_layer(&mut self, _spec: &LayerSpec) -> TrainResult<()> {
        Ok(())
    }

    fn train_on_batch(&mut self, features: &Array2<f32>) -> TrainResult<f32> {
        self.seen.extend(ids_from_features(features));
        Ok(0.0)
    }

    fn per_example_loss(&self, features: &Array2<f32>) -> TrainResult<Array1<f32>> {
        Ok(features
            .rows()
            .into_iter()
            .map(|row| (row[0] - self.center).abs())
            .collect())
    }

    fn forward(&self, features: &Array2<f32>) -> TrainResult<Array2<f32>> {
        Ok(features.clone())
    }

    fn reconstruct(&self, features: &Array2<f32>) -> TrainResult<(Array2<f32>, Array2<f32>)> {
        Ok((features.clone(), features.clone()))
    }

    fn output_shape(&self) -> Vec<usize> {
        vec![TOY_WIDTH]
    }

    fn invert(&self, activation: &Array2<f32>) -> TrainResult<Array2<f32>> {
        Ok(activation.clone())
    }
}

/// Column returning a scripted sequence of training losses and recording the
/// ids of every example it trains on.
pub(crate) struct ScriptedColumn {
    script: Vec<f32>,
    next: usize,
    fallback: f32,
    seen: Vec<ExampleId>,
}

impl ScriptedColumn {
    /// Always reports the same training loss.
    pub(crate) fn constant(loss: f32) -> Self {
        Self {
            script: Vec::new(),
            next: 0,
            fallback: loss,
            seen: Vec::new(),
        }
    }

    /// Reports the scripted losses in order, then repeats the last entry.
    pub(crate) fn with_losses(script: Vec<f32>) -> Self {
        let fallback = script.last().copied().unwrap_or(0.0);
        Self {
            script,
            next: 0,
            fallback,
            seen: Vec::new(),
        }
    }

    /// Ids of every example trained on, in draw order.
    pub(crate) fn seen_ids(&self) -> &[ExampleId] {
        &self.seen
    }
}

impl Column for ScriptedColumn {
    fn add_layer(&mut self, _spec: &LayerSpec) -> TrainResult<()> {
        Ok(())
    }

    fn train_on_batch(&mut self, features: &Array2<f32>) -> TrainResult<f32> {
        self.seen.extend(ids_from_features(features));
        let loss = self
            .script
            .get(self.next)
            .copied()
            .unwrap_or(self.fallback);
        self.next += 1;
        Ok(loss)
    }

    fn per_example_loss(&self, features: &Array2<f32>) -> TrainResult<Array1<f32>> {
        Ok(Array1::zeros(features.nrows()))
    }

    fn forward(&self, features: &Array2<f32>) -> TrainResult<Array2<f32>> {
        Ok(features.clone())
    }

    fn reconstruct(&self, features: &Array2<f32>) -> TrainResult<(Array2<f32>, Array2<f32>)> {
        Ok((features.clone(), features.clone()))
    }

    fn output_shape(&self) -> Vec<usize> {
        vec![TOY_WIDTH]
    }

    fn invert(&self, activation: &Array2<f32>) -> TrainResult<Array2<f32>> {
        Ok(activation.clone())
    }
}

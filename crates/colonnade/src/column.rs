// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::config::LayerSpec;
use crate::error::TrainResult;
use ndarray::{Array1, Array2};

/// Independently trainable encoder unit competing to specialise on a subset
/// of the data.
///
/// A column owns its parameters outright; nothing outside the column mutates
/// them, and no two columns share state. Batches arrive as row-major
/// `[batch, feature_width]` feature matrices straight from a provider.
pub trait Column {
    /// Grows the column by one layer. Depth only ever increases, and the
    /// driver applies the same spec to every column so depths stay equal.
    fn add_layer(&mut self, spec: &LayerSpec) -> TrainResult<()>;

    /// Runs one optimisation step on the batch and returns the scalar loss.
    fn train_on_batch(&mut self, features: &Array2<f32>) -> TrainResult<f32>;

    /// Reconstruction loss per example, without touching any parameters.
    fn per_example_loss(&self, features: &Array2<f32>) -> TrainResult<Array1<f32>>;

    /// Encodes the batch up to the top of the stack.
    fn forward(&self, features: &Array2<f32>) -> TrainResult<Array2<f32>>;

    /// Returns the batch alongside its reconstruction through the full stack.
    fn reconstruct(&self, features: &Array2<f32>) -> TrainResult<(Array2<f32>, Array2<f32>)>;

    /// Shape of the top activation, e.g. `[channels, height, width]` for a
    /// convolutional top or `[units]` for a dense one.
    fn output_shape(&self) -> Vec<usize>;

    /// Decodes top activations back into synthetic inputs.
    fn invert(&self, activation: &Array2<f32>) -> TrainResult<Array2<f32>>;
}

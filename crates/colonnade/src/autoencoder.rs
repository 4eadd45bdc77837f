// SPDX-License-Identifier: AGPL-3.0-or-later

//! Default column: a greedily trained stack of tied-weight sigmoid
//! autoencoder layers. Each `add_layer` freezes everything below the new
//! layer; `train_on_batch` optimises only the topmost trainable layer on the
//! activations the frozen stack produces, which is the classic stacked
//! autoencoder pretraining scheme the routing driver alternates with.

use crate::column::Column;
use crate::config::{LayerKind, LayerSpec};
use crate::error::{ColonnadeError, TrainResult};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Shape of an activation flowing between layers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ActivationShape {
    Spatial { c: usize, h: usize, w: usize },
    Flat { width: usize },
}

impl ActivationShape {
    fn width(&self) -> usize {
        match *self {
            ActivationShape::Spatial { c, h, w } => c * h * w,
            ActivationShape::Flat { width } => width,
        }
    }

    fn dims(&self) -> Vec<usize> {
        match *self {
            ActivationShape::Spatial { c, h, w } => vec![c, h, w],
            ActivationShape::Flat { width } => vec![width],
        }
    }
}

fn sigmoid(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| 1.0 / (1.0 + (-v).exp()))
}

enum LayerState {
    Corruption { level: f32 },
    Dense(DenseLayer),
    Conv(ConvLayer),
}

impl LayerState {
    fn trainable(&self) -> bool {
        !matches!(self, LayerState::Corruption { .. })
    }

    fn output_shape(&self, input: ActivationShape) -> ActivationShape {
        match self {
            LayerState::Corruption { .. } => input,
            LayerState::Dense(layer) => ActivationShape::Flat {
                width: layer.out_dim,
            },
            LayerState::Conv(layer) => ActivationShape::Spatial {
                c: layer.out_channels,
                h: layer.oh,
                w: layer.ow,
            },
        }
    }

    fn encode(&self, x: &Array2<f32>) -> Array2<f32> {
        match self {
            LayerState::Corruption { .. } => x.clone(),
            LayerState::Dense(layer) => layer.encode(x),
            LayerState::Conv(layer) => layer.encode(x),
        }
    }

    fn encode_train(&self, x: &Array2<f32>, rng: &mut StdRng) -> Array2<f32> {
        match self {
            LayerState::Corruption { level } => {
                x.mapv(|v| if rng.gen::<f32>() < *level { 0.0 } else { v })
            }
            _ => self.encode(x),
        }
    }

    fn decode(&self, h: &Array2<f32>) -> Array2<f32> {
        match self {
            LayerState::Corruption { .. } => h.clone(),
            LayerState::Dense(layer) => layer.decode(h),
            LayerState::Conv(layer) => layer.decode(h),
        }
    }

    fn train(&mut self, x: &Array2<f32>) -> f32 {
        match self {
            LayerState::Corruption { .. } => 0.0,
            LayerState::Dense(layer) => layer.train(x),
            LayerState::Conv(layer) => layer.train(x),
        }
    }
}

/// Tied-weight dense sigmoid autoencoder layer.
struct DenseLayer {
    weight: Array2<f32>,
    hidden_bias: Array1<f32>,
    visible_bias: Array1<f32>,
    learning_rate: f32,
    out_dim: usize,
}

impl DenseLayer {
    fn new(in_dim: usize, out_dim: usize, learning_rate: f32, rng: &mut StdRng) -> Self {
        let bound = 1.0 / (in_dim as f32).sqrt();
        let weight =
            Array2::from_shape_fn((in_dim, out_dim), |_| rng.gen_range(-bound..bound));
        Self {
            weight,
            hidden_bias: Array1::zeros(out_dim),
            visible_bias: Array1::zeros(in_dim),
            learning_rate,
            out_dim,
        }
    }

    fn encode(&self, x: &Array2<f32>) -> Array2<f32> {
        sigmoid(&(x.dot(&self.weight) + &self.hidden_bias))
    }

    fn decode(&self, h: &Array2<f32>) -> Array2<f32> {
        sigmoid(&(h.dot(&self.weight.t()) + &self.visible_bias))
    }

    fn train(&mut self, x: &Array2<f32>) -> f32 {
        let batch = x.nrows() as f32;
        let hidden = self.encode(x);
        let recon = self.decode(&hidden);
        let err = &recon - x;
        let loss = err.mapv(|v| v * v).mean().unwrap_or(0.0);

        let scale = 1.0 / batch;
        let delta_out = &err * &recon.mapv(|v| v * (1.0 - v)) * scale;
        let delta_hidden = delta_out.dot(&self.weight) * hidden.mapv(|v| v * (1.0 - v));

        // Tied weights pick up gradient from both the encode and decode paths.
        let grad_weight = x.t().dot(&delta_hidden) + delta_out.t().dot(&hidden);
        let grad_hidden_bias = delta_hidden.sum_axis(Axis(0));
        let grad_visible_bias = delta_out.sum_axis(Axis(0));

        self.weight = &self.weight - &(grad_weight * self.learning_rate);
        self.hidden_bias = &self.hidden_bias - &(grad_hidden_bias * self.learning_rate);
        self.visible_bias = &self.visible_bias - &(grad_visible_bias * self.learning_rate);
        loss
    }
}

/// Tied-weight convolutional sigmoid autoencoder layer. Convolution runs as
/// an im2col matmul; the decoder is the matching col2im overlap-add, so the
/// gradient of the reconstruction path is again an im2col.
struct ConvLayer {
    weight: Array2<f32>,
    hidden_bias: Array1<f32>,
    visible_bias: Array1<f32>,
    learning_rate: f32,
    kernel: usize,
    stride: usize,
    in_channels: usize,
    in_h: usize,
    in_w: usize,
    out_channels: usize,
    oh: usize,
    ow: usize,
}

impl ConvLayer {
    fn new(
        input: (usize, usize, usize),
        kernel: usize,
        stride: usize,
        out_channels: usize,
        learning_rate: f32,
        rng: &mut StdRng,
    ) -> TrainResult<Self> {
        let (in_channels, in_h, in_w) = input;
        if in_h < kernel || in_w < kernel {
            return Err(ColonnadeError::InvalidLayerStack(format!(
                "kernel {kernel} does not fit a {in_h}x{in_w} input"
            )));
        }
        let oh = (in_h - kernel) / stride + 1;
        let ow = (in_w - kernel) / stride + 1;
        let patch = kernel * kernel * in_channels;
        let bound = 1.0 / (patch as f32).sqrt();
        let weight =
            Array2::from_shape_fn((patch, out_channels), |_| rng.gen_range(-bound..bound));
        Ok(Self {
            weight,
            hidden_bias: Array1::zeros(out_channels),
            visible_bias: Array1::zeros(in_channels),
            learning_rate,
            kernel,
            stride,
            in_channels,
            in_h,
            in_w,
            out_channels,
            oh,
            ow,
        })
    }

    fn sites(&self) -> usize {
        self.oh * self.ow
    }

    /// Extracts stride-spaced patches into a `[batch * sites, k*k*c]` matrix.
    fn im2col(&self, x: &Array2<f32>) -> Array2<f32> {
        let batch = x.nrows();
        let (k, s) = (self.kernel, self.stride);
        let sites = self.sites();
        let mut out = Array2::zeros((batch * sites, k * k * self.in_channels));
        for b in 0..batch {
            for oy in 0..self.oh {
                for ox in 0..self.ow {
                    let row = b * sites + oy * self.ow + ox;
                    for ch in 0..self.in_channels {
                        for ky in 0..k {
                            for kx in 0..k {
                                let col = ch * k * k + ky * k + kx;
                                let src =
                                    ch * self.in_h * self.in_w + (oy * s + ky) * self.in_w
                                        + (ox * s + kx);
                                out[[row, col]] = x[[b, src]];
                            }
                        }
                    }
                }
            }
        }
        out
    }

    /// Overlap-adds patch rows back into `[batch, c*h*w]` images.
    fn col2im(&self, cols: &Array2<f32>, batch: usize) -> Array2<f32> {
        let (k, s) = (self.kernel, self.stride);
        let sites = self.sites();
        let mut out = Array2::zeros((batch, self.in_channels * self.in_h * self.in_w));
        for b in 0..batch {
            for oy in 0..self.oh {
                for ox in 0..self.ow {
                    let row = b * sites + oy * self.ow + ox;
                    for ch in 0..self.in_channels {
                        for ky in 0..k {
                            for kx in 0..k {
                                let col = ch * k * k + ky * k + kx;
                                let dst =
                                    ch * self.in_h * self.in_w + (oy * s + ky) * self.in_w
                                        + (ox * s + kx);
                                out[[b, dst]] += cols[[row, col]];
                            }
                        }
                    }
                }
            }
        }
        out
    }

    /// Reshapes `[batch * sites, out_channels]` hidden rows into the
    /// channel-major `[batch, out_channels * sites]` activation layout.
    fn fold_hidden(&self, hidden: &Array2<f32>, batch: usize) -> Array2<f32> {
        let sites = self.sites();
        let mut out = Array2::zeros((batch, self.out_channels * sites));
        for b in 0..batch {
            for site in 0..sites {
                for oc in 0..self.out_channels {
                    out[[b, oc * sites + site]] = hidden[[b * sites + site, oc]];
                }
            }
        }
        out
    }

    fn unfold_hidden(&self, flat: &Array2<f32>) -> Array2<f32> {
        let batch = flat.nrows();
        let sites = self.sites();
        let mut out = Array2::zeros((batch * sites, self.out_channels));
        for b in 0..batch {
            for site in 0..sites {
                for oc in 0..self.out_channels {
                    out[[b * sites + site, oc]] = flat[[b, oc * sites + site]];
                }
            }
        }
        out
    }

    fn add_visible_bias(&self, mut pre: Array2<f32>) -> Array2<f32> {
        let plane = self.in_h * self.in_w;
        for mut row in pre.rows_mut() {
            for ch in 0..self.in_channels {
                let bias = self.visible_bias[ch];
                for i in 0..plane {
                    row[ch * plane + i] += bias;
                }
            }
        }
        pre
    }

    fn encode(&self, x: &Array2<f32>) -> Array2<f32> {
        let patches = self.im2col(x);
        let hidden = sigmoid(&(patches.dot(&self.weight) + &self.hidden_bias));
        self.fold_hidden(&hidden, x.nrows())
    }

    fn decode(&self, flat: &Array2<f32>) -> Array2<f32> {
        let batch = flat.nrows();
        let hidden = self.unfold_hidden(flat);
        let patches = hidden.dot(&self.weight.t());
        let pre = self.add_visible_bias(self.col2im(&patches, batch));
        sigmoid(&pre)
    }

    fn train(&mut self, x: &Array2<f32>) -> f32 {
        let batch = x.nrows();
        let patches = self.im2col(x);
        let hidden = sigmoid(&(patches.dot(&self.weight) + &self.hidden_bias));
        let recon_patches = hidden.dot(&self.weight.t());
        let pre = self.add_visible_bias(self.col2im(&recon_patches, batch));
        let recon = sigmoid(&pre);
        let err = &recon - x;
        let loss = err.mapv(|v| v * v).mean().unwrap_or(0.0);

        let scale = 1.0 / batch as f32;
        let delta_img = &err * &recon.mapv(|v| v * (1.0 - v)) * scale;
        let grad_visible_bias = self.channel_sums(&delta_img);
        // Backprop through the overlap-add is patch extraction again.
        let delta_patches = self.im2col(&delta_img);
        let delta_hidden = delta_patches.dot(&self.weight) * hidden.mapv(|v| v * (1.0 - v));

        let grad_weight =
            patches.t().dot(&delta_hidden) + delta_patches.t().dot(&hidden);
        let grad_hidden_bias = delta_hidden.sum_axis(Axis(0));

        self.weight = &self.weight - &(grad_weight * self.learning_rate);
        self.hidden_bias = &self.hidden_bias - &(grad_hidden_bias * self.learning_rate);
        self.visible_bias = &self.visible_bias - &(grad_visible_bias * self.learning_rate);
        loss
    }

    fn channel_sums(&self, img: &Array2<f32>) -> Array1<f32> {
        let plane = self.in_h * self.in_w;
        let mut sums = Array1::zeros(self.in_channels);
        for row in img.rows() {
            for ch in 0..self.in_channels {
                let mut acc = 0.0f32;
                for i in 0..plane {
                    acc += row[ch * plane + i];
                }
                sums[ch] += acc;
            }
        }
        sums
    }
}

/// Concrete [`Column`] built from [`LayerSpec`] records.
pub struct AutoencoderColumn {
    input_shape: (usize, usize, usize),
    layers: Vec<LayerState>,
    rng: StdRng,
}

impl AutoencoderColumn {
    /// Creates an empty column over `(channels, height, width)` examples.
    pub fn new(input_shape: (usize, usize, usize), seed: u64) -> Self {
        Self {
            input_shape,
            layers: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Current depth of the stack.
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    fn shape_after(&self, depth: usize) -> ActivationShape {
        let (c, h, w) = self.input_shape;
        let mut shape = ActivationShape::Spatial { c, h, w };
        for layer in &self.layers[..depth] {
            shape = layer.output_shape(shape);
        }
        shape
    }

    fn top_shape(&self) -> ActivationShape {
        self.shape_after(self.layers.len())
    }

    fn check_input(&self, features: &Array2<f32>) -> TrainResult<()> {
        let (c, h, w) = self.input_shape;
        if features.ncols() != c * h * w {
            return Err(ColonnadeError::FeatureWidthMismatch {
                expected: c * h * w,
                got: features.ncols(),
            });
        }
        Ok(())
    }

    fn encode_eval(&self, features: &Array2<f32>) -> Array2<f32> {
        let mut acts = features.clone();
        for layer in &self.layers {
            acts = layer.encode(&acts);
        }
        acts
    }

    fn decode_stack(&self, top: &Array2<f32>) -> Array2<f32> {
        let mut acts = top.clone();
        for layer in self.layers.iter().rev() {
            acts = layer.decode(&acts);
        }
        acts
    }
}

impl Column for AutoencoderColumn {
    fn add_layer(&mut self, spec: &LayerSpec) -> TrainResult<()> {
        spec.validate()?;
        let input = self.top_shape();
        let layer = match spec.kind {
            LayerKind::Corruption { level } => LayerState::Corruption { level },
            LayerKind::Dense { units } => LayerState::Dense(DenseLayer::new(
                input.width(),
                units,
                spec.learning_rate,
                &mut self.rng,
            )),
            LayerKind::Conv {
                kernel,
                stride,
                channels,
            } => match input {
                ActivationShape::Spatial { c, h, w } => LayerState::Conv(ConvLayer::new(
                    (c, h, w),
                    kernel,
                    stride,
                    channels,
                    spec.learning_rate,
                    &mut self.rng,
                )?),
                ActivationShape::Flat { .. } => {
                    return Err(ColonnadeError::InvalidLayerStack(
                        "conv layer cannot follow a dense layer".into(),
                    ))
                }
            },
        };
        self.layers.push(layer);
        Ok(())
    }

    fn train_on_batch(&mut self, features: &Array2<f32>) -> TrainResult<f32> {
        self.check_input(features)?;
        let top = self
            .layers
            .iter()
            .rposition(LayerState::trainable)
            .ok_or(ColonnadeError::NoTrainableLayer)?;
        let mut acts = features.clone();
        for layer in &self.layers[..top] {
            acts = layer.encode_train(&acts, &mut self.rng);
        }
        Ok(self.layers[top].train(&acts))
    }

    fn per_example_loss(&self, features: &Array2<f32>) -> TrainResult<Array1<f32>> {
        self.check_input(features)?;
        let recon = self.decode_stack(&self.encode_eval(features));
        let err = &recon - features;
        Ok(err
            .mapv(|v| v * v)
            .mean_axis(Axis(1))
            .unwrap_or_else(|| Array1::zeros(features.nrows())))
    }

    fn forward(&self, features: &Array2<f32>) -> TrainResult<Array2<f32>> {
        self.check_input(features)?;
        Ok(self.encode_eval(features))
    }

    fn reconstruct(&self, features: &Array2<f32>) -> TrainResult<(Array2<f32>, Array2<f32>)> {
        self.check_input(features)?;
        let recon = self.decode_stack(&self.encode_eval(features));
        Ok((features.clone(), recon))
    }

    fn output_shape(&self) -> Vec<usize> {
        self.top_shape().dims()
    }

    fn invert(&self, activation: &Array2<f32>) -> TrainResult<Array2<f32>> {
        let expected = self.top_shape().width();
        if activation.ncols() != expected {
            return Err(ColonnadeError::ActivationWidthMismatch {
                expected,
                got: activation.ncols(),
            });
        }
        Ok(self.decode_stack(activation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PretrainSchedule;

    fn batch(rows: usize, width: usize) -> Array2<f32> {
        Array2::from_shape_fn((rows, width), |(r, c)| ((r + c) % 2) as f32)
    }

    #[test]
    fn conv_layer_tracks_output_shape() {
        let mut column = AutoencoderColumn::new((1, 6, 6), 7);
        column.add_layer(&LayerSpec::conv(3, 1, 4)).unwrap();
        assert_eq!(column.output_shape(), vec![4, 4, 4]);
        column.add_layer(&LayerSpec::conv(2, 2, 8)).unwrap();
        assert_eq!(column.output_shape(), vec![8, 2, 2]);
        column.add_layer(&LayerSpec::dense(5)).unwrap();
        assert_eq!(column.output_shape(), vec![5]);
    }

    #[test]
    fn conv_cannot_follow_dense() {
        let mut column = AutoencoderColumn::new((1, 4, 4), 7);
        column.add_layer(&LayerSpec::dense(5)).unwrap();
        assert!(matches!(
            column.add_layer(&LayerSpec::conv(2, 1, 4)),
            Err(ColonnadeError::InvalidLayerStack(_))
        ));
    }

    #[test]
    fn oversized_kernel_is_rejected() {
        let mut column = AutoencoderColumn::new((1, 4, 4), 7);
        assert!(matches!(
            column.add_layer(&LayerSpec::conv(5, 1, 4)),
            Err(ColonnadeError::InvalidLayerStack(_))
        ));
    }

    #[test]
    fn corruption_only_stack_has_no_trainable_layer() {
        let mut column = AutoencoderColumn::new((1, 2, 2), 7);
        column.add_layer(&LayerSpec::corruption(0.1)).unwrap();
        let x = batch(3, 4);
        assert!(matches!(
            column.train_on_batch(&x),
            Err(ColonnadeError::NoTrainableLayer)
        ));
    }

    #[test]
    fn dense_training_reduces_reconstruction_loss() {
        let mut column = AutoencoderColumn::new((1, 2, 2), 7);
        column
            .add_layer(&LayerSpec::dense(8).with_learning_rate(1.0))
            .unwrap();
        let x = batch(4, 4);
        let first = column.train_on_batch(&x).unwrap();
        let mut last = first;
        for _ in 0..200 {
            last = column.train_on_batch(&x).unwrap();
        }
        assert!(last < first, "loss did not improve: {first} -> {last}");
    }

    #[test]
    fn conv_training_reduces_reconstruction_loss() {
        let mut column = AutoencoderColumn::new((1, 4, 4), 7);
        column
            .add_layer(&LayerSpec::conv(2, 2, 6).with_learning_rate(0.5))
            .unwrap();
        let x = batch(4, 16);
        let first = column.train_on_batch(&x).unwrap();
        let mut last = first;
        for _ in 0..200 {
            last = column.train_on_batch(&x).unwrap();
        }
        assert!(last < first, "loss did not improve: {first} -> {last}");
    }

    #[test]
    fn per_example_loss_is_deterministic_and_row_aligned() {
        let mut column = AutoencoderColumn::new((1, 2, 2), 7);
        column.add_layer(&LayerSpec::corruption(0.5)).unwrap();
        column.add_layer(&LayerSpec::dense(3)).unwrap();
        let x = batch(5, 4);
        let a = column.per_example_loss(&x).unwrap();
        let b = column.per_example_loss(&x).unwrap();
        assert_eq!(a.len(), 5);
        assert_eq!(a, b);
    }

    #[test]
    fn invert_round_trips_top_activations() {
        let mut column = AutoencoderColumn::new((1, 3, 3), 7);
        column.add_layer(&LayerSpec::dense(4)).unwrap();
        let activation = Array2::from_shape_fn((2, 4), |(r, c)| (r * 4 + c) as f32 / 8.0);
        let synthetic = column.invert(&activation).unwrap();
        assert_eq!(synthetic.dim(), (2, 9));
        assert!(matches!(
            column.invert(&Array2::zeros((1, 7))),
            Err(ColonnadeError::ActivationWidthMismatch { .. })
        ));
    }

    #[test]
    fn reconstruct_returns_input_and_matching_shape() {
        let mut column = AutoencoderColumn::new((1, 4, 4), 7);
        column.add_layer(&LayerSpec::conv(2, 2, 3)).unwrap();
        let x = batch(2, 16);
        let (input, recon) = column.reconstruct(&x).unwrap();
        assert_eq!(input, x);
        assert_eq!(recon.dim(), x.dim());
    }

    #[test]
    fn specs_carry_schedules_untouched_by_columns() {
        let spec = LayerSpec::dense(4).with_schedule(PretrainSchedule::Fixed(3));
        let mut column = AutoencoderColumn::new((1, 2, 2), 7);
        column.add_layer(&spec).unwrap();
        assert_eq!(spec.plan.schedule, PretrainSchedule::Fixed(3));
    }
}

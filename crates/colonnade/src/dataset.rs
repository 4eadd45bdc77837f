// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::error::{ColonnadeError, TrainResult};
use ndarray::Array2;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Stable identifier of a training example; identity survives across epochs.
pub type ExampleId = u64;

/// One minibatch drawn from a provider: features are row-major
/// `[batch, feature_width]`, labels and ids run parallel to the rows.
#[derive(Clone, Debug)]
pub struct Minibatch {
    pub features: Array2<f32>,
    pub labels: Vec<usize>,
    pub ids: Vec<ExampleId>,
}

impl Minibatch {
    /// Number of examples in the batch.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns `true` when the batch holds no examples.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Read-only minibatch source shared by every column.
///
/// The final minibatch of a sweep may be smaller than `batch_size`; the
/// sequence always covers every example exactly once so the assignment pass
/// can build a total partition.
pub trait DataProvider {
    /// Lazy sequence of minibatches covering the whole dataset once.
    fn minibatches(&self) -> Box<dyn Iterator<Item = Minibatch> + '_>;

    /// Gathers the examples behind the given ids, preserving order.
    fn by_ids(&self, ids: &[ExampleId]) -> TrainResult<Minibatch>;

    /// Example shape as `(channels, height, width)`.
    fn shape(&self) -> (usize, usize, usize);

    /// All example ids, in provider order.
    fn ids(&self) -> &[ExampleId];

    /// Total number of examples.
    fn len(&self) -> usize {
        self.ids().len()
    }

    /// Returns `true` when the provider holds no examples.
    fn is_empty(&self) -> bool {
        self.ids().is_empty()
    }

    /// Configured minibatch size.
    fn batch_size(&self) -> usize;
}

/// In-memory dataset backing both the CLI driver and the tests.
#[derive(Clone, Debug)]
pub struct InMemoryDataset {
    features: Array2<f32>,
    labels: Vec<usize>,
    ids: Vec<ExampleId>,
    index: HashMap<ExampleId, usize>,
    shape: (usize, usize, usize),
    batch_size: usize,
}

impl InMemoryDataset {
    /// Wraps preloaded features and labels. Ids are assigned in row order.
    pub fn new(
        features: Array2<f32>,
        labels: Vec<usize>,
        shape: (usize, usize, usize),
        batch_size: usize,
    ) -> TrainResult<Self> {
        let rows = features.nrows();
        if rows == 0 {
            return Err(ColonnadeError::EmptyDataset);
        }
        let (c, h, w) = shape;
        if features.ncols() != c * h * w {
            return Err(ColonnadeError::FeatureWidthMismatch {
                expected: c * h * w,
                got: features.ncols(),
            });
        }
        if labels.len() != rows {
            return Err(ColonnadeError::FeatureWidthMismatch {
                expected: rows,
                got: labels.len(),
            });
        }
        let ids: Vec<ExampleId> = (0..rows as ExampleId).collect();
        let index = ids.iter().map(|&id| (id, id as usize)).collect();
        Ok(Self {
            features,
            labels,
            ids,
            index,
            shape,
            batch_size: batch_size.max(1),
        })
    }

    /// Loads an IDX image/label file pair (the MNIST on-disk format).
    pub fn from_idx(
        images: &Path,
        labels: &Path,
        batch_size: usize,
    ) -> TrainResult<Self> {
        let (features, shape) = read_idx_images(images)?;
        let parsed = read_idx_labels(labels)?;
        if parsed.len() != features.nrows() {
            return Err(ColonnadeError::MalformedIdx {
                path: labels.to_path_buf(),
                reason: format!(
                    "label count {} does not match image count {}",
                    parsed.len(),
                    features.nrows()
                ),
            });
        }
        Self::new(features, parsed, shape, batch_size)
    }

    /// Label of a single example, used by the diagnostics report.
    pub fn label_of(&self, id: ExampleId) -> TrainResult<usize> {
        let row = *self
            .index
            .get(&id)
            .ok_or(ColonnadeError::UnknownExample(id))?;
        Ok(self.labels[row])
    }
}

impl DataProvider for InMemoryDataset {
    fn minibatches(&self) -> Box<dyn Iterator<Item = Minibatch> + '_> {
        let batch = self.batch_size;
        let total = self.ids.len();
        let mut start = 0usize;
        Box::new(std::iter::from_fn(move || {
            if start >= total {
                return None;
            }
            let end = (start + batch).min(total);
            let features = self
                .features
                .slice(ndarray::s![start..end, ..])
                .to_owned();
            let out = Minibatch {
                features,
                labels: self.labels[start..end].to_vec(),
                ids: self.ids[start..end].to_vec(),
            };
            start = end;
            Some(out)
        }))
    }

    fn by_ids(&self, ids: &[ExampleId]) -> TrainResult<Minibatch> {
        let mut features = Array2::zeros((ids.len(), self.features.ncols()));
        let mut labels = Vec::with_capacity(ids.len());
        for (slot, &id) in ids.iter().enumerate() {
            let row = *self
                .index
                .get(&id)
                .ok_or(ColonnadeError::UnknownExample(id))?;
            features.row_mut(slot).assign(&self.features.row(row));
            labels.push(self.labels[row]);
        }
        Ok(Minibatch {
            features,
            labels,
            ids: ids.to_vec(),
        })
    }

    fn shape(&self) -> (usize, usize, usize) {
        self.shape
    }

    fn ids(&self) -> &[ExampleId] {
        &self.ids
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

const IDX_IMAGES_MAGIC: u32 = 0x0000_0803;
const IDX_LABELS_MAGIC: u32 = 0x0000_0801;

fn read_file(path: &Path) -> TrainResult<Vec<u8>> {
    let mut buf = Vec::new();
    File::open(path)
        .and_then(|mut file| file.read_to_end(&mut buf))
        .map_err(|err| ColonnadeError::io(path, err))?;
    Ok(buf)
}

fn read_u32(bytes: &[u8], offset: usize, path: &Path) -> TrainResult<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| ColonnadeError::MalformedIdx {
            path: path.to_path_buf(),
            reason: format!("truncated header at offset {offset}"),
        })
}

fn read_idx_images(path: &Path) -> TrainResult<(Array2<f32>, (usize, usize, usize))> {
    let bytes = read_file(path)?;
    let magic = read_u32(&bytes, 0, path)?;
    if magic != IDX_IMAGES_MAGIC {
        return Err(ColonnadeError::MalformedIdx {
            path: path.to_path_buf(),
            reason: format!("bad magic {magic:#x}, expected {IDX_IMAGES_MAGIC:#x}"),
        });
    }
    let count = read_u32(&bytes, 4, path)? as usize;
    let rows = read_u32(&bytes, 8, path)? as usize;
    let cols = read_u32(&bytes, 12, path)? as usize;
    // Header fields are untrusted; a hostile file must not overflow here.
    let (width, expected) = rows
        .checked_mul(cols)
        .and_then(|width| count.checked_mul(width).map(|total| (width, total)))
        .ok_or_else(|| ColonnadeError::MalformedIdx {
            path: path.to_path_buf(),
            reason: format!("header dimensions {count}x{rows}x{cols} overflow"),
        })?;
    let payload = &bytes[16..];
    if payload.len() != expected {
        return Err(ColonnadeError::MalformedIdx {
            path: path.to_path_buf(),
            reason: format!(
                "payload holds {} bytes but header promises {expected}",
                payload.len()
            ),
        });
    }
    let data: Vec<f32> = payload.iter().map(|&b| f32::from(b) / 255.0).collect();
    let features = Array2::from_shape_vec((count, width), data).map_err(|err| {
        ColonnadeError::MalformedIdx {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    })?;
    Ok((features, (1, rows, cols)))
}

fn read_idx_labels(path: &Path) -> TrainResult<Vec<usize>> {
    let bytes = read_file(path)?;
    let magic = read_u32(&bytes, 0, path)?;
    if magic != IDX_LABELS_MAGIC {
        return Err(ColonnadeError::MalformedIdx {
            path: path.to_path_buf(),
            reason: format!("bad magic {magic:#x}, expected {IDX_LABELS_MAGIC:#x}"),
        });
    }
    let count = read_u32(&bytes, 4, path)? as usize;
    let payload = &bytes[8..];
    if payload.len() != count {
        return Err(ColonnadeError::MalformedIdx {
            path: path.to_path_buf(),
            reason: format!("payload holds {} labels but header promises {count}", payload.len()),
        });
    }
    Ok(payload.iter().map(|&b| b as usize).collect())
}

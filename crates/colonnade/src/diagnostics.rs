// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::assignment::AssignmentMap;
use crate::column::Column;
use crate::dataset::{DataProvider, ExampleId};
use crate::error::{ColonnadeError, TrainResult};
use ndarray::Array2;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Shannon entropy (natural log) of a label histogram.
///
/// A single-label column scores 0; an even two-way split scores `ln 2`.
pub fn label_entropy(counts: &[usize]) -> f32 {
    let total: usize = counts.iter().sum();
    if total == 0 {
        return 0.0;
    }
    counts
        .iter()
        .filter(|&&count| count != 0)
        .map(|&count| {
            let p = count as f32 / total as f32;
            -p * p.ln()
        })
        .sum()
}

/// Per-column label histograms and their entropies for one routing round.
#[derive(Clone, Debug, PartialEq)]
pub struct EntropyReport {
    pub histograms: Vec<Vec<usize>>,
    pub entropies: Vec<f32>,
}

impl EntropyReport {
    /// Builds the report by fetching the labels behind every column's member
    /// list, chunked at the provider's batch size to bound memory.
    pub fn build<P>(map: &AssignmentMap, provider: &P, num_labels: usize) -> TrainResult<Self>
    where
        P: DataProvider + ?Sized,
    {
        let mut histograms = vec![vec![0usize; num_labels]; map.columns()];
        for col in 0..map.columns() {
            for chunk in map.stats().members(col).chunks(provider.batch_size()) {
                let mb = provider.by_ids(chunk)?;
                for &label in &mb.labels {
                    if label < num_labels {
                        histograms[col][label] += 1;
                    }
                }
            }
        }
        let entropies = histograms.iter().map(|h| label_entropy(h)).collect();
        Ok(Self {
            histograms,
            entropies,
        })
    }

    /// Renders the report as a human-readable column dump.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (col, histogram) in self.histograms.iter().enumerate() {
            let _ = writeln!(out, "==============={col}======================");
            let _ = writeln!(out, "{histogram:?}");
            let _ = writeln!(out, "Entropy: {}", self.entropies[col]);
        }
        out
    }
}

/// Why exemplar collection for a column stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExemplarOutcome {
    /// The cap was reached with members left over.
    CapReached,
    /// The member list ran out before the cap; never an error.
    ExhaustedEarly { collected: usize },
}

/// Collects up to `cap` assigned example ids for a column.
pub fn collect_exemplars(
    map: &AssignmentMap,
    column: usize,
    cap: usize,
) -> (Vec<ExampleId>, ExemplarOutcome) {
    let members = map.stats().members(column);
    if members.len() < cap {
        (
            members.to_vec(),
            ExemplarOutcome::ExhaustedEarly {
                collected: members.len(),
            },
        )
    } else {
        (members[..cap].to_vec(), ExemplarOutcome::CapReached)
    }
}

/// Arranges feature rows into a near-square grid of grayscale tiles with a
/// one-pixel separator. Multi-channel examples are averaged down to one
/// plane before tiling.
pub fn tile_images(
    features: &Array2<f32>,
    shape: (usize, usize, usize),
    normalize: bool,
) -> TrainResult<Array2<f32>> {
    let (c, h, w) = shape;
    if features.ncols() != c * h * w {
        return Err(ColonnadeError::FeatureWidthMismatch {
            expected: c * h * w,
            got: features.ncols(),
        });
    }
    let count = features.nrows();
    let grid = (count as f32).sqrt().ceil().max(1.0) as usize;
    let grid_rows = count.div_ceil(grid.max(1));
    let sheet_h = grid_rows * (h + 1) + 1;
    let sheet_w = grid * (w + 1) + 1;
    let mut sheet = Array2::zeros((sheet_h, sheet_w));

    let (low, high) = if normalize {
        let mut low = f32::INFINITY;
        let mut high = f32::NEG_INFINITY;
        for &v in features.iter() {
            low = low.min(v);
            high = high.max(v);
        }
        if high - low < f32::EPSILON {
            (0.0, 1.0)
        } else {
            (low, high)
        }
    } else {
        (0.0, 1.0)
    };

    let plane = h * w;
    for (index, row) in features.rows().into_iter().enumerate() {
        let ty = (index / grid) * (h + 1) + 1;
        let tx = (index % grid) * (w + 1) + 1;
        for y in 0..h {
            for x in 0..w {
                let mut value = 0.0f32;
                for ch in 0..c {
                    value += row[ch * plane + y * w + x];
                }
                value /= c as f32;
                sheet[[ty + y, tx + x]] = ((value - low) / (high - low)).clamp(0.0, 1.0);
            }
        }
    }
    Ok(sheet)
}

/// Writes a grayscale sheet as a binary PGM file.
pub fn write_pgm(path: &Path, image: &Array2<f32>) -> TrainResult<()> {
    let file = File::create(path).map_err(|err| ColonnadeError::io(path, err))?;
    let mut out = BufWriter::new(file);
    let (h, w) = image.dim();
    write!(out, "P5\n{w} {h}\n255\n").map_err(|err| ColonnadeError::io(path, err))?;
    let bytes: Vec<u8> = image
        .iter()
        .map(|&v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect();
    out.write_all(&bytes)
        .map_err(|err| ColonnadeError::io(path, err))?;
    Ok(())
}

/// Saves up to `cap` exemplars of one column as a tiled image.
pub fn save_exemplars<P>(
    map: &AssignmentMap,
    provider: &P,
    column: usize,
    cap: usize,
    path: &Path,
) -> TrainResult<ExemplarOutcome>
where
    P: DataProvider + ?Sized,
{
    let (ids, outcome) = collect_exemplars(map, column, cap);
    if let ExemplarOutcome::ExhaustedEarly { collected } = outcome {
        info!(column, collected, cap, "exemplar pool exhausted early");
    }
    if ids.is_empty() {
        return Ok(outcome);
    }
    let mb = provider.by_ids(&ids)?;
    let sheet = tile_images(&mb.features, provider.shape(), false)?;
    write_pgm(path, &sheet)?;
    Ok(outcome)
}

/// Saves the first minibatch with its reconstructions interleaved row by row.
pub fn save_reconstructions<C, P>(column: &C, provider: &P, path: &Path) -> TrainResult<()>
where
    C: Column,
    P: DataProvider + ?Sized,
{
    let Some(mb) = provider.minibatches().next() else {
        return Err(ColonnadeError::EmptyDataset);
    };
    let (input, recon) = column.reconstruct(&mb.features)?;
    let mut interleaved = Array2::zeros((input.nrows() * 2, input.ncols()));
    for (index, (original, rebuilt)) in input
        .rows()
        .into_iter()
        .zip(recon.rows().into_iter())
        .enumerate()
    {
        interleaved.row_mut(index * 2).assign(&original);
        interleaved.row_mut(index * 2 + 1).assign(&rebuilt);
    }
    let sheet = tile_images(&interleaved, provider.shape(), false)?;
    write_pgm(path, &sheet)
}

/// Saves the first minibatch's top activation maps as a tiled image, one
/// channel-averaged tile per example. Flat tops carry no spatial layout and
/// are skipped; returns whether a sheet was written.
pub fn save_top_activations<C, P>(column: &C, provider: &P, path: &Path) -> TrainResult<bool>
where
    C: Column,
    P: DataProvider + ?Sized,
{
    let top = column.output_shape();
    let [c, h, w] = match top.as_slice() {
        [c, h, w] => [*c, *h, *w],
        _ => return Ok(false),
    };
    let Some(mb) = provider.minibatches().next() else {
        return Err(ColonnadeError::EmptyDataset);
    };
    let acts = column.forward(&mb.features)?;
    let sheet = tile_images(&acts, (c, h, w), true)?;
    write_pgm(path, &sheet)?;
    Ok(true)
}

/// Saves one synthetic input per top-level unit, obtained by inverting a
/// one-hot activation (centred spatially for convolutional tops).
pub fn save_feature_tiles<C, P>(column: &C, provider: &P, path: &Path) -> TrainResult<()>
where
    C: Column,
    P: DataProvider + ?Sized,
{
    let top = column.output_shape();
    let (units, width, hot_offset) = match top.as_slice() {
        [channels, h, w] => {
            let sites = h * w;
            (*channels, channels * sites, (h / 2) * w + w / 2)
        }
        [units] => (*units, *units, 0),
        _ => {
            return Err(ColonnadeError::InvalidLayerStack(format!(
                "unexpected top shape {top:?}"
            )))
        }
    };
    let mut activations = Array2::zeros((units, width));
    for unit in 0..units {
        let slot = if top.len() == 3 {
            let sites = width / units;
            unit * sites + hot_offset
        } else {
            unit
        };
        activations[[unit, slot]] = 1.0;
    }
    let synthetic = column.invert(&activations)?;
    let sheet = tile_images(&synthetic, provider.shape(), true)?;
    write_pgm(path, &sheet)
}

/// Writes the entropy report and the column-to-ids mapping as a text file.
pub fn write_column_report(
    path: &Path,
    report: &EntropyReport,
    map: &AssignmentMap,
) -> TrainResult<()> {
    let file = File::create(path).map_err(|err| ColonnadeError::io(path, err))?;
    let mut out = BufWriter::new(file);
    out.write_all(report.render().as_bytes())
        .map_err(|err| ColonnadeError::io(path, err))?;
    for col in 0..map.columns() {
        writeln!(out, "column {col}: {:?}", map.stats().members(col))
            .map_err(|err| ColonnadeError::io(path, err))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::{labeled_provider, toy_provider, NearestCenterColumn};

    #[test]
    fn single_label_column_has_zero_entropy() {
        assert_eq!(label_entropy(&[7, 0, 0]), 0.0);
    }

    #[test]
    fn even_two_way_split_has_ln_two_entropy() {
        let entropy = label_entropy(&[5, 5]);
        assert!((entropy - 2.0f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn empty_histogram_has_zero_entropy() {
        assert_eq!(label_entropy(&[0, 0]), 0.0);
    }

    #[test]
    fn entropy_report_counts_labels_per_column() {
        // Ids 0..3 carry label 0, ids 4..7 label 1.
        let provider = labeled_provider(&[0, 0, 0, 0, 1, 1, 1, 1], 3);
        let map = AssignmentMap::from_pairs(
            2,
            &(0..8u64).map(|id| (id, usize::from(id >= 4))).collect::<Vec<_>>(),
        );
        let report = EntropyReport::build(&map, &provider, 2).unwrap();
        assert_eq!(report.histograms[0], vec![4, 0]);
        assert_eq!(report.histograms[1], vec![0, 4]);
        assert_eq!(report.entropies, vec![0.0, 0.0]);
        let rendered = report.render();
        assert!(rendered.contains("Entropy: 0"));
    }

    #[test]
    fn exemplar_collection_stops_at_the_cap() {
        let map = AssignmentMap::from_pairs(
            1,
            &(0..100u64).map(|id| (id, 0)).collect::<Vec<_>>(),
        );
        let (ids, outcome) = collect_exemplars(&map, 0, 64);
        assert_eq!(ids.len(), 64);
        assert_eq!(outcome, ExemplarOutcome::CapReached);
    }

    #[test]
    fn exemplar_collection_survives_early_exhaustion() {
        let map = AssignmentMap::from_pairs(
            2,
            &(0..10u64).map(|id| (id, 0)).collect::<Vec<_>>(),
        );
        let (ids, outcome) = collect_exemplars(&map, 0, 64);
        assert_eq!(ids.len(), 10);
        assert_eq!(outcome, ExemplarOutcome::ExhaustedEarly { collected: 10 });
        // A fully starved column yields nothing, still without error.
        let (empty, outcome) = collect_exemplars(&map, 1, 64);
        assert!(empty.is_empty());
        assert_eq!(outcome, ExemplarOutcome::ExhaustedEarly { collected: 0 });
    }

    #[test]
    fn tiles_form_a_near_square_grid() {
        let features = Array2::from_elem((5, 4), 0.5);
        let sheet = tile_images(&features, (1, 2, 2), false).unwrap();
        // 5 tiles pack into a 3x2 grid of 2x2 tiles with separators.
        assert_eq!(sheet.dim(), (2 * 3 + 1, 3 * 3 + 1));
        assert_eq!(sheet[[1, 1]], 0.5);
        assert_eq!(sheet[[0, 0]], 0.0);
    }

    #[test]
    fn tile_shape_mismatch_is_rejected() {
        let features = Array2::zeros((2, 5));
        assert!(matches!(
            tile_images(&features, (1, 2, 2), false),
            Err(ColonnadeError::FeatureWidthMismatch { .. })
        ));
    }

    #[test]
    fn top_activation_tiles_are_written_for_spatial_tops() {
        use crate::autoencoder::AutoencoderColumn;
        use crate::config::LayerSpec;
        use crate::dataset::InMemoryDataset;

        let dir = std::env::temp_dir().join("colonnade-top-tiles-test");
        std::fs::create_dir_all(&dir).unwrap();
        let features = Array2::from_shape_fn((6, 16), |(r, c)| ((r + c) % 3) as f32 / 2.0);
        let provider =
            InMemoryDataset::new(features, vec![0; 6], (1, 4, 4), 4).unwrap();

        let mut column = AutoencoderColumn::new((1, 4, 4), 11);
        column.add_layer(&LayerSpec::conv(2, 2, 3)).unwrap();
        let path = dir.join("top_conv.pgm");
        assert!(save_top_activations(&column, &provider, &path).unwrap());
        assert!(path.exists());

        // A flat top has no spatial layout to tile.
        let flat = NearestCenterColumn::new(0.0);
        let skipped = dir.join("top_flat.pgm");
        assert!(!save_top_activations(&flat, &toy_provider(4, 4), &skipped).unwrap());
        assert!(!skipped.exists());
    }

    #[test]
    fn pgm_and_report_files_land_on_disk() {
        let dir = std::env::temp_dir().join("colonnade-diagnostics-test");
        std::fs::create_dir_all(&dir).unwrap();
        let provider = toy_provider(8, 4);
        let map = AssignmentMap::from_pairs(
            2,
            &(0..8u64).map(|id| (id, usize::from(id >= 4))).collect::<Vec<_>>(),
        );

        let exemplar_path = dir.join("col0_exemplars.pgm");
        save_exemplars(&map, &provider, 0, 64, &exemplar_path).unwrap();
        assert!(exemplar_path.exists());

        let column = NearestCenterColumn::new(0.0);
        let recon_path = dir.join("recon.pgm");
        save_reconstructions(&column, &provider, &recon_path).unwrap();
        assert!(recon_path.exists());

        let report = EntropyReport::build(&map, &provider, 3).unwrap();
        let report_path = dir.join("col2key.txt");
        write_column_report(&report_path, &report, &map).unwrap();
        let text = std::fs::read_to_string(&report_path).unwrap();
        assert!(text.contains("Entropy:"));
        assert!(text.contains("column 0:"));
    }
}

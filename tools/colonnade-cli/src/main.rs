// SPDX-License-Identifier: AGPL-3.0-or-later

use clap::{Parser, ValueHint};
use colonnade::config::{load_layers, PatienceMode, PretrainSchedule};
use colonnade::{DataProvider, InMemoryDataset, LayerSpec, TrainingConfig, TrainingSession};
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Standard file names inside an MNIST-style dataset directory.
const DEFAULT_IMAGES: &str = "train-images-idx3-ubyte";
const DEFAULT_LABELS: &str = "train-labels-idx1-ubyte";

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Trains competing autoencoder columns with dynamic example routing"
)]
struct Cli {
    /// Directory holding IDX image and label files (MNIST layout)
    #[arg(value_hint = ValueHint::DirPath)]
    data_dir: PathBuf,

    /// Image file name inside the data directory
    #[arg(long, default_value = DEFAULT_IMAGES)]
    images: String,

    /// Label file name inside the data directory
    #[arg(long, default_value = DEFAULT_LABELS)]
    labels: String,

    /// Number of competing columns
    #[arg(long, default_value_t = 4)]
    columns: usize,

    /// Minibatch size
    #[arg(long, default_value_t = 256)]
    batch_size: usize,

    /// Balanced-training epochs between consecutive map rebuilds
    #[arg(long, default_value_t = 1)]
    steps_per_round: usize,

    /// Number of distinct labels in the dataset
    #[arg(long, default_value_t = 10)]
    num_labels: usize,

    /// Seed for weight initialisation and corruption masks
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// JSON file describing the layer stack; a built-in stack is used if absent
    #[arg(long, value_hint = ValueHint::FilePath)]
    layers: Option<PathBuf>,

    /// Directory receiving diagnostic tiles and reports
    #[arg(long, value_hint = ValueHint::DirPath)]
    out_dir: Option<PathBuf>,

    /// Stop pretraining only after every column stalls, instead of sharing
    /// one counter driven by the best-improving column
    #[arg(long)]
    per_column_patience: bool,

    /// Safety cap on open-ended pretraining epochs
    #[arg(long, default_value_t = 1000)]
    pretrain_epoch_cap: usize,
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing();

    let images = cli.data_dir.join(&cli.images);
    let labels = cli.data_dir.join(&cli.labels);
    let dataset = InMemoryDataset::from_idx(&images, &labels, cli.batch_size)?;
    info!(
        examples = dataset.len(),
        shape = ?dataset.shape(),
        "dataset loaded"
    );

    let layers = match &cli.layers {
        Some(path) => load_layers(path)?,
        None => default_stack(),
    };
    info!(depth = layers.len(), "layer stack resolved");

    let mut config = TrainingConfig::default()
        .with_columns(cli.columns)
        .with_steps_per_round(cli.steps_per_round)
        .with_seed(cli.seed);
    config.num_labels = cli.num_labels;
    config.pretrain_epoch_cap = cli.pretrain_epoch_cap;
    if cli.per_column_patience {
        config.patience_mode = PatienceMode::PerColumn;
    }
    if let Some(dir) = &cli.out_dir {
        config = config.with_out_dir(dir);
    }

    let mut session = TrainingSession::with_autoencoders(dataset, config)?;
    let report = session.run(&layers)?;
    for outcome in &report.layers {
        info!(
            layer = outcome.layer,
            rounds = outcome.rounds,
            counts = ?outcome.final_counts,
            entropies = ?outcome.entropies,
            "layer complete"
        );
    }
    Ok(())
}

/// Denoising stack mirroring the classic MNIST column experiment: masked
/// input, a strided conv feature layer, then a narrow dense code.
fn default_stack() -> Vec<LayerSpec> {
    vec![
        LayerSpec::corruption(0.15),
        LayerSpec::conv(5, 2, 8)
            .with_schedule(PretrainSchedule::UntilPatience)
            .with_patience(5, 1e-5)
            .with_convergence_threshold(0.99),
        LayerSpec::dense(16)
            .with_schedule(PretrainSchedule::Fixed(20))
            .with_convergence_threshold(0.99),
    ]
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let ansi = std::io::stdout().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(ansi)
        .init();
}

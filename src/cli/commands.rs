// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Defines the three subcommands, `train`, `project` and
// `classify`, and all their configurable flags.
//
// The defaults here mirror TrainConfig::default(), so running
// `csf train` with no flags is the same run as the default
// configuration.
//
// Reference: Rust Book §12 (Building a CLI Program)

use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::application::classify_use_case::{ClassifyConfig, Experiment};
use crate::application::project_use_case::ProjectConfig;
use crate::application::train_use_case::{BackendKind, TrainConfig};
use crate::data::splitter::SplitFractions;
use crate::domain::layers::LayerLossWeights;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train an encoder with the multi-layer contrastive objective
    Train(TrainArgs),

    /// Project one representation layer of a trained run to 2-D
    Project(ProjectArgs),

    /// Fine-tune a trained encoder as a classifier with fewer bands or scenes
    Classify(ClassifyArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendArg {
    /// GPU through wgpu
    Wgpu,
    /// CPU through ndarray
    Ndarray,
}

impl From<BackendArg> for BackendKind {
    fn from(b: BackendArg) -> Self {
        match b {
            BackendArg::Wgpu => BackendKind::Wgpu,
            BackendArg::Ndarray => BackendKind::NdArray,
        }
    }
}

/// All arguments for the `train` command.
#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Directory of .f32 tiles, one subdirectory per class; synthetic scenes when omitted
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Number of synthetic scenes to generate without --data-dir
    #[arg(long, default_value_t = 256)]
    pub synthetic_scenes: usize,

    /// Number of synthetic scene classes
    #[arg(long, default_value_t = 4)]
    pub synthetic_labels: usize,

    /// Side length of the stored tiles
    #[arg(long, default_value_t = 48)]
    pub data_tilesize: usize,

    /// Band names, in the order they are stored
    #[arg(long, value_delimiter = ',', default_value = "red,green,blue")]
    pub bands: Vec<String>,

    /// Side length of the crops fed to the encoder
    #[arg(long, default_value_t = 32)]
    pub model_tilesize: usize,

    /// Channel width of the first encoder stage
    #[arg(long, default_value_t = 16)]
    pub encoder_width: usize,

    #[arg(long, default_value_t = 16)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 1e-4)]
    pub learning_rate: f64,

    /// Ramp the learning rate up linearly over this many steps
    #[arg(long)]
    pub learning_rate_warmup_batches: Option<u64>,

    /// Probability of dropping each band of each scene
    #[arg(long, default_value_t = 0.0)]
    pub band_dropout_rate: f64,

    /// Ramp the band dropout rate up linearly over this many steps
    #[arg(long)]
    pub band_dropout_rate_warmup_batches: Option<u64>,

    /// Comma-separated layer:weight pairs
    #[arg(long, default_value = "conv5_block3_out:1")]
    pub layer_loss_weights: LayerLossWeights,

    #[arg(long, default_value_t = 0.0)]
    pub brightness_delta: f64,

    #[arg(long, default_value_t = 0.0)]
    pub contrast_delta: f64,

    /// Divides similarities before the softmax; must exceed 0.01
    #[arg(long, default_value_t = 0.1)]
    pub softmax_temperature: f64,

    /// Maximum global gradient norm
    #[arg(long, default_value_t = 1.0)]
    pub gradient_clipnorm: f64,

    /// Where checkpoints, summaries and train_config.json go
    #[arg(long, default_value = "runs/csf")]
    pub out_dir: PathBuf,

    /// Stop once this many steps have run in total
    #[arg(long, default_value_t = 10_000)]
    pub train_batches: u64,

    /// Start from this checkpoint when out_dir has none
    #[arg(long)]
    pub initial_checkpoint: Option<PathBuf>,

    #[arg(long, default_value_t = 500)]
    pub checkpoint_frequency: u64,

    /// Steps between summary flushes; 0 disables summaries
    #[arg(long, default_value_t = 100)]
    pub summary_frequency: u64,

    #[arg(long, default_value_t = 100)]
    pub max_checkpoints: usize,

    /// Keep one checkpoint out of every this many hours forever
    #[arg(long)]
    pub keep_checkpoint_every_n_hours: Option<f64>,

    /// Band names rendered as RGB images, three at a time
    #[arg(long, value_delimiter = ',')]
    pub visualize_bands: Vec<String>,

    #[arg(long, default_value_t = 0)]
    pub random_seed: u64,

    #[arg(long, value_enum, default_value_t = BackendArg::Wgpu)]
    pub backend: BackendArg,
}

/// Convert CLI TrainArgs into the application-layer TrainConfig.
/// The application layer never sees clap types.
impl From<TrainArgs> for TrainConfig {
    fn from(a: TrainArgs) -> Self {
        TrainConfig {
            data_dir:         a.data_dir,
            synthetic_scenes: a.synthetic_scenes,
            synthetic_labels: a.synthetic_labels,
            data_tilesize:    a.data_tilesize,
            bands:            a.bands,

            model_tilesize: a.model_tilesize,
            encoder_width:  a.encoder_width,
            batch_size:     a.batch_size,

            learning_rate:                    a.learning_rate,
            learning_rate_warmup_batches:     a.learning_rate_warmup_batches,
            band_dropout_rate:                a.band_dropout_rate,
            band_dropout_rate_warmup_batches: a.band_dropout_rate_warmup_batches,
            layer_loss_weights:               a.layer_loss_weights,
            brightness_delta:                 a.brightness_delta,
            contrast_delta:                   a.contrast_delta,
            softmax_temperature:              a.softmax_temperature,
            gradient_clipnorm:                a.gradient_clipnorm,

            out_dir:                       a.out_dir,
            train_batches:                 a.train_batches,
            initial_checkpoint:            a.initial_checkpoint,
            checkpoint_frequency:          a.checkpoint_frequency,
            summary_frequency:             a.summary_frequency,
            max_checkpoints:               a.max_checkpoints,
            keep_checkpoint_every_n_hours: a.keep_checkpoint_every_n_hours,
            visualize_bands:               a.visualize_bands,
            random_seed:                   a.random_seed,
            backend:                       a.backend.into(),
        }
    }
}

/// All arguments for the `project` command
#[derive(Args, Debug)]
pub struct ProjectArgs {
    /// Output directory of a training run
    #[arg(long, default_value = "runs/csf")]
    pub run_dir: PathBuf,

    /// Checkpoint to load; the latest one in run_dir when omitted
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    /// Representation layer to project
    #[arg(long, default_value = "conv5_block3_out")]
    pub layer: String,

    /// Number of scenes to encode, rounded down to whole batches
    #[arg(long, default_value_t = 256)]
    pub n_points: usize,

    /// Defaults to the run's batch size
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Where the CSVs and the encoding cache go; run_dir when omitted
    #[arg(long)]
    pub out_dir: Option<PathBuf>,

    /// Encode the scenes again even when out_dir holds a cache
    #[arg(long)]
    pub reencode: bool,

    /// t-SNE perplexity; must be below the number of points
    #[arg(long, default_value_t = 30.0)]
    pub perplexity: f64,

    #[arg(long, default_value_t = 2000)]
    pub tsne_iterations: usize,

    /// Principal components kept before t-SNE; 0 runs t-SNE on the raw layer
    #[arg(long, default_value_t = 200)]
    pub pca_preprocess_dims: usize,

    #[arg(long, value_enum, default_value_t = BackendArg::Wgpu)]
    pub backend: BackendArg,
}

impl From<ProjectArgs> for ProjectConfig {
    fn from(a: ProjectArgs) -> Self {
        ProjectConfig {
            run_dir:    a.run_dir,
            checkpoint: a.checkpoint,
            layer:      a.layer,
            n_points:   a.n_points,
            batch_size: a.batch_size,
            out_dir:    a.out_dir,
            reencode:   a.reencode,

            perplexity:          a.perplexity,
            tsne_iterations:     a.tsne_iterations,
            pca_preprocess_dims: (a.pca_preprocess_dims > 0).then_some(a.pca_preprocess_dims),

            backend: a.backend.into(),
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentArg {
    /// Drop bands from the last to the first
    Inputs,
    /// Train on fewer and fewer scenes
    Dataset,
    Both,
}

impl From<ExperimentArg> for Experiment {
    fn from(e: ExperimentArg) -> Self {
        match e {
            ExperimentArg::Inputs => Experiment::DegradingInputs,
            ExperimentArg::Dataset => Experiment::DegradingDataset,
            ExperimentArg::Both => Experiment::Both,
        }
    }
}

/// All arguments for the `classify` command
#[derive(Args, Debug)]
pub struct ClassifyArgs {
    /// Output directory of a training run
    #[arg(long, default_value = "runs/csf")]
    pub run_dir: PathBuf,

    /// Checkpoint to fine-tune; the latest one in run_dir when omitted
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    /// Where weights and classification_results.csv go; run_dir when omitted
    #[arg(long)]
    pub out_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ExperimentArg::Both)]
    pub experiment: ExperimentArg,

    #[arg(long, default_value_t = 64)]
    pub epochs: usize,

    #[arg(long, default_value_t = 8)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 1e-5)]
    pub learning_rate: f64,

    /// Learning rate multiplier of the final dense layer
    #[arg(long, default_value_t = 10.0)]
    pub dense_lr_multiplier: f64,

    /// Maximum norm of each gradient tensor
    #[arg(long, default_value_t = 1.0)]
    pub gradient_clipnorm: f64,

    #[arg(long, default_value_t = 0.8)]
    pub train_fraction: f64,

    #[arg(long, default_value_t = 0.1)]
    pub test_fraction: f64,

    #[arg(long, default_value_t = 0.1)]
    pub val_fraction: f64,

    /// Scene counts of the degrading dataset experiment
    #[arg(long, value_delimiter = ',', default_value = "8000,6000,4000,2000,1000,500,250")]
    pub sample_counts: Vec<usize>,

    /// Seeds the split and the shuffling of training scenes
    #[arg(long, default_value_t = 0)]
    pub random_seed: u64,

    #[arg(long, value_enum, default_value_t = BackendArg::Wgpu)]
    pub backend: BackendArg,
}

impl From<ClassifyArgs> for ClassifyConfig {
    fn from(a: ClassifyArgs) -> Self {
        ClassifyConfig {
            run_dir:    a.run_dir,
            checkpoint: a.checkpoint,
            out_dir:    a.out_dir,
            experiment: a.experiment.into(),

            epochs:              a.epochs,
            batch_size:          a.batch_size,
            learning_rate:       a.learning_rate,
            dense_lr_multiplier: a.dense_lr_multiplier,
            gradient_clipnorm:   a.gradient_clipnorm,

            fractions: SplitFractions {
                train: a.train_fraction,
                test:  a.test_fraction,
                val:   a.val_fraction,
            },
            sample_counts: a.sample_counts,
            random_seed:   a.random_seed,
            backend:       a.backend.into(),
        }
    }
}

// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates a contrastive training run in order:
//
//   Step 1: Validate the configuration      (Layer 3 - domain)
//   Step 2: Load or generate scenes         (Layer 4 - data)
//   Step 3: Open the checkpoint store       (Layer 6 - infra)
//   Step 4: Build encoder + Adam, restore   (Layer 5 - ml)
//   Step 5: Build the training step         (Layer 5 - ml)
//   Step 6: Run the training loop           (Layer 5 - ml)
//
// Reference: Rust Book §13 (Iterators and Closures)
//            Burn Book §5 (Training)

use anyhow::{ensure, Result};
use burn::{
    backend::{wgpu::WgpuDevice, Autodiff, NdArray, Wgpu},
    optim::AdamConfig,
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};
use std::{
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
};

use crate::data::{
    dataset::SceneDataset, loader::TileDirLoader, stream::SceneLoader,
    synthetic::SyntheticScenes,
};
use crate::domain::{
    error::ConfigError,
    layers::LayerLossWeights,
    scene::SceneShape,
    schedule::Schedule,
    traits::SceneSource,
};
use crate::infra::{
    checkpoint::{CheckpointStore, RetentionPolicy},
    metrics::SummaryWriter,
    visualize::band_triples,
};
use crate::ml::{
    encoder::{ContrastiveEncoder, EncoderConfig},
    loss::LayerLossAggregator,
    step::TrainStep,
    trainer::{LoopSettings, RunReport, Trainer, TrainingState},
    views::ViewConfig,
};

/// Which burn backend runs the tensors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Wgpu,
    NdArray,
}

// ─── Training Configuration ──────────────────────────────────────────────────
// Every setting of a run. Saved as train_config.json in the
// output directory, where `project` reads it back to rebuild the
// encoder and the data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    // ── Data ──
    /// Directory of .f32 tiles; None trains on synthetic scenes
    pub data_dir:         Option<PathBuf>,
    pub synthetic_scenes: usize,
    pub synthetic_labels: usize,
    pub data_tilesize:    usize,
    pub bands:            Vec<String>,

    // ── Model ──
    pub model_tilesize: usize,
    pub encoder_width:  usize,
    pub batch_size:     usize,

    // ── Objective and optimiser ──
    pub learning_rate:                    f64,
    pub learning_rate_warmup_batches:     Option<u64>,
    pub band_dropout_rate:                f64,
    pub band_dropout_rate_warmup_batches: Option<u64>,
    pub layer_loss_weights:               LayerLossWeights,
    pub brightness_delta:                 f64,
    pub contrast_delta:                   f64,
    pub softmax_temperature:              f64,
    pub gradient_clipnorm:                f64,

    // ── Run bookkeeping ──
    pub out_dir:                       PathBuf,
    pub train_batches:                 u64,
    pub initial_checkpoint:            Option<PathBuf>,
    pub checkpoint_frequency:          u64,
    pub summary_frequency:             u64,
    pub max_checkpoints:               usize,
    pub keep_checkpoint_every_n_hours: Option<f64>,
    pub visualize_bands:               Vec<String>,
    pub random_seed:                   u64,
    pub backend:                       BackendKind,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            data_dir:         None,
            synthetic_scenes: 256,
            synthetic_labels: 4,
            data_tilesize:    48,
            bands:            vec!["red".into(), "green".into(), "blue".into()],

            model_tilesize: 32,
            encoder_width:  16,
            batch_size:     16,

            learning_rate:                    1e-4,
            learning_rate_warmup_batches:     None,
            band_dropout_rate:                0.0,
            band_dropout_rate_warmup_batches: None,
            layer_loss_weights:               LayerLossWeights::default(),
            brightness_delta:                 0.0,
            contrast_delta:                   0.0,
            softmax_temperature:              0.1,
            gradient_clipnorm:                1.0,

            out_dir:                       PathBuf::from("runs/csf"),
            train_batches:                 10_000,
            initial_checkpoint:            None,
            checkpoint_frequency:          500,
            summary_frequency:             100,
            max_checkpoints:               100,
            keep_checkpoint_every_n_hours: None,
            visualize_bands:               Vec::new(),
            random_seed:                   0,
            backend:                       BackendKind::Wgpu,
        }
    }
}

impl TrainConfig {
    /// Reject every value the training loop cannot use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("batch_size", self.batch_size),
            ("model_tilesize", self.model_tilesize),
            ("data_tilesize", self.data_tilesize),
            ("bands", self.bands.len()),
            ("encoder_width", self.encoder_width),
            ("checkpoint_frequency", self.checkpoint_frequency as usize),
            ("max_checkpoints", self.max_checkpoints),
        ];
        if let Some(&(name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::NotPositive(name));
        }
        if self.data_dir.is_none() {
            if self.synthetic_scenes == 0 {
                return Err(ConfigError::NotPositive("synthetic_scenes"));
            }
            if self.synthetic_labels == 0 {
                return Err(ConfigError::NotPositive("synthetic_labels"));
            }
        }

        if self.model_tilesize > self.data_tilesize {
            return Err(ConfigError::TileSize { model: self.model_tilesize, data: self.data_tilesize });
        }

        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::LearningRate(self.learning_rate));
        }
        if !(0.0..1.0).contains(&self.band_dropout_rate) {
            return Err(ConfigError::DropoutRate(self.band_dropout_rate));
        }
        for (name, value) in [
            ("brightness_delta", self.brightness_delta),
            ("contrast_delta", self.contrast_delta),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Jitter { name, value });
            }
        }
        if !(self.softmax_temperature > 0.01) {
            return Err(ConfigError::TemperatureTooLow(self.softmax_temperature));
        }
        if !(self.gradient_clipnorm.is_finite() && self.gradient_clipnorm > 0.0) {
            return Err(ConfigError::ClipNorm(self.gradient_clipnorm));
        }
        if let Some(hours) = self.keep_checkpoint_every_n_hours {
            if !(hours.is_finite() && hours > 0.0) {
                return Err(ConfigError::RetentionInterval(hours));
            }
        }
        if self.layer_loss_weights.is_empty() {
            return Err(ConfigError::NoLayerWeights);
        }

        band_triples(&self.bands, &self.visualize_bands)?;
        Ok(())
    }

    pub fn learning_rate_schedule(&self) -> Schedule {
        Schedule::new(self.learning_rate, self.learning_rate_warmup_batches)
    }

    pub fn dropout_schedule(&self) -> Schedule {
        Schedule::new(self.band_dropout_rate, self.band_dropout_rate_warmup_batches)
    }

    pub fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig::new(self.bands.len()).with_width(self.encoder_width)
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_to_keep:     self.max_checkpoints,
            keep_every_secs: self.keep_checkpoint_every_n_hours.map(|h| (h * 3600.0).round() as u64),
        }
    }

    /// Scenes from `data_dir`, or the synthetic set when there is none
    pub fn load_scenes(&self) -> Result<SceneDataset> {
        let source: Box<dyn SceneSource> = match &self.data_dir {
            Some(dir) => Box::new(TileDirLoader::new(dir, self.data_tilesize, self.bands.len())),
            None => {
                tracing::info!("No data directory given, generating {} synthetic scenes", self.synthetic_scenes);
                let shape = SceneShape {
                    tile_size: self.data_tilesize,
                    n_bands:   self.bands.len(),
                    n_labels:  self.synthetic_labels,
                };
                Box::new(SyntheticScenes::new(shape, self.synthetic_scenes, self.random_seed))
            }
        };
        source.load_all()
    }
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
pub struct TrainUseCase {
    config:    TrainConfig,
    interrupt: Arc<AtomicBool>,
}

impl TrainUseCase {
    /// `interrupt` is polled between steps; setting it ends the run early
    pub fn new(config: TrainConfig, interrupt: Arc<AtomicBool>) -> Self {
        Self { config, interrupt }
    }

    pub fn execute(&self) -> Result<RunReport> {
        // ── Step 1: Validate ──────────────────────────────────────────────────
        self.config.validate()?;

        match self.config.backend {
            BackendKind::Wgpu => {
                let device = WgpuDevice::default();
                tracing::info!("Using WGPU device: {:?}", device);
                train::<Autodiff<Wgpu>>(&self.config, device, &self.interrupt)
            }
            BackendKind::NdArray => {
                tracing::info!("Using the NdArray CPU backend");
                train::<Autodiff<NdArray>>(&self.config, Default::default(), &self.interrupt)
            }
        }
    }
}

fn train<B: AutodiffBackend>(cfg: &TrainConfig, device: B::Device, interrupt: &AtomicBool) -> Result<RunReport> {
    // ── Step 2: Scenes ────────────────────────────────────────────────────────
    let dataset = cfg.load_scenes()?;
    ensure!(
        dataset.scene_count() >= cfg.batch_size,
        "Only {} scenes available, fewer than one batch of {}",
        dataset.scene_count(),
        cfg.batch_size
    );

    // ── Step 3: Checkpoint store ──────────────────────────────────────────────
    let store = CheckpointStore::new(&cfg.out_dir, cfg.retention_policy())?;
    store.save_config(cfg)?;

    // ── Step 4: Encoder and optimiser ─────────────────────────────────────────
    // Adam with ε = 1e-7, as in the Keras default the loss scale was tuned for
    let encoder = cfg.encoder_config().init::<B>(&device);
    let optim = AdamConfig::new()
        .with_epsilon(1e-7)
        .init::<B, ContrastiveEncoder<B>>();

    let settings = LoopSettings {
        train_batches:        cfg.train_batches,
        checkpoint_frequency: cfg.checkpoint_frequency,
        summary_frequency:    cfg.summary_frequency,
        learning_rate:        cfg.learning_rate_schedule(),
        dropout_rate:         cfg.dropout_schedule(),
    };
    let state = TrainingState::restore(
        &store,
        cfg.initial_checkpoint.as_deref(),
        encoder,
        optim,
        &settings,
        &device,
    )?;

    // ── Step 5: Training step ─────────────────────────────────────────────────
    let views = ViewConfig {
        model_tilesize:   cfg.model_tilesize,
        brightness_delta: cfg.brightness_delta,
        contrast_delta:   cfg.contrast_delta,
    };
    let aggregator = LayerLossAggregator::new(cfg.layer_loss_weights.clone(), cfg.softmax_temperature);
    let step_fn = TrainStep::new(
        views,
        cfg.random_seed,
        aggregator,
        cfg.gradient_clipnorm,
        band_triples(&cfg.bands, &cfg.visualize_bands)?,
    );

    // ── Step 6: Training loop ─────────────────────────────────────────────────
    let sink = SummaryWriter::new(cfg.out_dir.join("summaries"))?;
    let mut trainer = Trainer::new(settings, state, step_fn, store, Box::new(sink));

    let shape = dataset.shape();
    let loader = SceneLoader::<B>::new(dataset, shape, cfg.batch_size, Some(cfg.random_seed), &device);

    let report = trainer.run(loader.repeating(), interrupt)?;
    tracing::info!(
        "Run ended at step {} after {} steps ({:?})",
        report.final_step,
        report.steps_run,
        report.stop
    );
    Ok(report)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::trainer::StopReason;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(TrainConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let base = TrainConfig::default();

        let cases: Vec<(TrainConfig, ConfigError)> = vec![
            (
                TrainConfig { softmax_temperature: 0.01, ..base.clone() },
                ConfigError::TemperatureTooLow(0.01),
            ),
            (
                TrainConfig { band_dropout_rate: 1.0, ..base.clone() },
                ConfigError::DropoutRate(1.0),
            ),
            (
                TrainConfig { contrast_delta: 1.5, ..base.clone() },
                ConfigError::Jitter { name: "contrast_delta", value: 1.5 },
            ),
            (
                TrainConfig { model_tilesize: 64, ..base.clone() },
                ConfigError::TileSize { model: 64, data: 48 },
            ),
            (
                TrainConfig { batch_size: 0, ..base.clone() },
                ConfigError::NotPositive("batch_size"),
            ),
            (
                TrainConfig { gradient_clipnorm: 0.0, ..base.clone() },
                ConfigError::ClipNorm(0.0),
            ),
            (
                TrainConfig { keep_checkpoint_every_n_hours: Some(-1.0), ..base.clone() },
                ConfigError::RetentionInterval(-1.0),
            ),
        ];

        for (cfg, expected) in cases {
            assert_eq!(cfg.validate(), Err(expected));
        }

        let bad_bands = TrainConfig { visualize_bands: vec!["red".into(), "nir".into(), "blue".into()], ..base };
        assert!(matches!(bad_bands.validate(), Err(ConfigError::VisualizeBands(_))));
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let cfg = TrainConfig {
            layer_loss_weights: "conv3_block3_out:0.5,conv5_block3_out:1".parse().unwrap(),
            backend: BackendKind::NdArray,
            ..TrainConfig::default()
        };
        let json = serde_json::to_string_pretty(&cfg).unwrap();
        assert!(json.contains("\"ndarray\""));
        assert_eq!(serde_json::from_str::<TrainConfig>(&json).unwrap(), cfg);
    }

    #[test]
    fn test_retention_policy_converts_hours() {
        let cfg = TrainConfig { keep_checkpoint_every_n_hours: Some(1.5), ..TrainConfig::default() };
        assert_eq!(cfg.retention_policy().keep_every_secs, Some(5400));
    }

    #[test]
    fn test_short_synthetic_run_on_cpu() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = TrainConfig {
            synthetic_scenes: 6,
            data_tilesize: 20,
            model_tilesize: 16,
            encoder_width: 2,
            batch_size: 2,
            train_batches: 1,
            checkpoint_frequency: 1,
            summary_frequency: 1,
            band_dropout_rate: 0.2,
            brightness_delta: 0.1,
            visualize_bands: vec!["red".into(), "green".into(), "blue".into()],
            out_dir: tmp.path().to_path_buf(),
            backend: BackendKind::NdArray,
            ..TrainConfig::default()
        };

        let report = TrainUseCase::new(cfg, Arc::new(AtomicBool::new(false))).execute().unwrap();
        assert_eq!(report.stop, StopReason::Finished);
        assert_eq!(report.final_step, 1);
        assert!(tmp.path().join("train_config.json").exists());
        assert!(tmp.path().join("ckpt-1/state.json").exists());
        assert!(tmp.path().join("summaries/images/step_0/view_1_red_green_blue.png").exists());
    }
}

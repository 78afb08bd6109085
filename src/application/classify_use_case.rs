// ============================================================
// Layer 2 — ClassifyUseCase
// ============================================================
// Fine-tunes a trained encoder as a scene classifier, over and
// over with less to work with:
//
//   degrading inputs:  all scenes, bands N, N-1, …, 1
//   degrading dataset: all bands, n_keep scenes for each sample count
//
//   Step 1: Read train_config.json, resolve the checkpoint
//   Step 2: Load the run's scenes and split them once (seeded)
//   Step 3: For every planned run: fresh encoder from the
//           checkpoint, classifier head, fit, evaluate on test
//   Step 4: Rewrite classification_results.csv after every run
//
// Every run draws its train, test and validation scenes from the
// same split, so no test or validation scene is ever trained on,
// in any run of either experiment.
//
// Sample counts larger than the dataset, or that leave a
// partition without one whole batch, are skipped with a warning.

use anyhow::{Context, Result};
use burn::{
    backend::{wgpu::WgpuDevice, Autodiff, NdArray, Wgpu},
    data::dataset::Dataset,
    tensor::backend::AutodiffBackend,
};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::application::train_use_case::BackendKind;
use crate::data::splitter::{SceneSplit, SplitFractions};
use crate::domain::error::ConfigError;
use crate::infra::checkpoint::CheckpointStore;
use crate::ml::classifier::{fit, ClassifierConfig, FitSettings};

pub const RESULTS_FILE: &str = "classification_results.csv";

/// Which experiments to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Experiment {
    DegradingInputs,
    DegradingDataset,
    Both,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifyConfig {
    /// Output directory of the training run
    pub run_dir:    PathBuf,
    /// Checkpoint to start from; the latest one when None
    pub checkpoint: Option<PathBuf>,
    /// Where weights and results go; the run directory when None
    pub out_dir:    Option<PathBuf>,
    pub experiment: Experiment,

    pub epochs:              usize,
    pub batch_size:          usize,
    pub learning_rate:       f64,
    pub dense_lr_multiplier: f64,
    pub gradient_clipnorm:   f64,

    pub fractions:     SplitFractions,
    /// Scene counts of the degrading dataset runs
    pub sample_counts: Vec<usize>,
    pub random_seed:   u64,
    pub backend:       BackendKind,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            run_dir:    PathBuf::from("runs/csf"),
            checkpoint: None,
            out_dir:    None,
            experiment: Experiment::Both,

            epochs:              64,
            batch_size:          8,
            learning_rate:       1e-5,
            dense_lr_multiplier: 10.0,
            gradient_clipnorm:   1.0,

            fractions:     SplitFractions::default(),
            sample_counts: vec![8000, 6000, 4000, 2000, 1000, 500, 250],
            random_seed:   0,
            backend:       BackendKind::default(),
        }
    }
}

impl ClassifyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.epochs == 0 {
            return Err(ConfigError::NotPositive("epochs"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::NotPositive("batch_size"));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(ConfigError::LearningRate(self.learning_rate));
        }
        if !(self.dense_lr_multiplier > 0.0 && self.dense_lr_multiplier.is_finite()) {
            return Err(ConfigError::NotPositive("dense_lr_multiplier"));
        }
        if !(self.gradient_clipnorm > 0.0 && self.gradient_clipnorm.is_finite()) {
            return Err(ConfigError::ClipNorm(self.gradient_clipnorm));
        }
        if self.sample_counts.contains(&0) {
            return Err(ConfigError::NotPositive("sample_counts"));
        }
        self.fractions.validate()
    }
}

/// One fine-tuning run of an experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedRun {
    pub experiment: &'static str,
    pub kept_bands: usize,
    pub n_scenes:   usize,
}

impl PlannedRun {
    /// Name of the run's weight file
    fn tag(&self) -> String {
        match self.experiment {
            "degrading_inputs" => format!("classification_{:02}band", self.kept_bands),
            _ => format!("classification_{:04}samples", self.n_scenes),
        }
    }
}

/// The runs of `experiment` on `n_scenes` scenes of `n_bands` bands
fn plan_runs(experiment: Experiment, n_bands: usize, n_scenes: usize, sample_counts: &[usize]) -> Vec<PlannedRun> {
    let mut runs = Vec::new();
    if matches!(experiment, Experiment::DegradingInputs | Experiment::Both) {
        runs.extend((1..=n_bands).rev().map(|kept_bands| PlannedRun {
            experiment: "degrading_inputs",
            kept_bands,
            n_scenes,
        }));
    }
    if matches!(experiment, Experiment::DegradingDataset | Experiment::Both) {
        for &count in sample_counts {
            if count > n_scenes {
                tracing::warn!("Skipping {count} samples: the dataset has only {n_scenes} scenes");
                continue;
            }
            runs.push(PlannedRun { experiment: "degrading_dataset", kept_bands: n_bands, n_scenes: count });
        }
    }
    runs
}

/// Test and validation scores of one finished run
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    pub run:                PlannedRun,
    pub best_epoch:         usize,
    pub val_accuracy:       f64,
    pub val_top2_accuracy:  f64,
    pub test_loss:          f64,
    pub test_accuracy:      f64,
    pub test_top2_accuracy: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifyReport {
    pub results:     Vec<ClassificationResult>,
    pub csv:         PathBuf,
    pub interrupted: bool,
}

pub struct ClassifyUseCase {
    config:    ClassifyConfig,
    interrupt: Arc<AtomicBool>,
}

impl ClassifyUseCase {
    /// `interrupt` is polled between steps; setting it ends the experiments early
    pub fn new(config: ClassifyConfig, interrupt: Arc<AtomicBool>) -> Self {
        Self { config, interrupt }
    }

    pub fn execute(&self) -> Result<ClassifyReport> {
        self.config.validate()?;

        match self.config.backend {
            BackendKind::Wgpu => {
                let device = WgpuDevice::default();
                tracing::info!("Using WGPU device: {:?}", device);
                classify::<Autodiff<Wgpu>>(&self.config, device, &self.interrupt)
            }
            BackendKind::NdArray => {
                tracing::info!("Using the NdArray CPU backend");
                classify::<Autodiff<NdArray>>(&self.config, Default::default(), &self.interrupt)
            }
        }
    }
}

fn classify<B: AutodiffBackend>(cfg: &ClassifyConfig, device: B::Device, interrupt: &AtomicBool) -> Result<ClassifyReport> {
    // ── Step 1: Run configuration ─────────────────────────────────────────────
    let store = CheckpointStore::open(&cfg.run_dir);
    let train_cfg = store.load_config()?;
    let checkpoint = store.checkpoint_or_latest(cfg.checkpoint.as_deref())?;
    let encoder_config = train_cfg.encoder_config();

    let out_dir = cfg.out_dir.as_deref().unwrap_or(&cfg.run_dir);
    std::fs::create_dir_all(out_dir).with_context(|| format!("Cannot create '{}'", out_dir.display()))?;
    let csv = out_dir.join(RESULTS_FILE);

    // ── Step 2: One split for every run ───────────────────────────────────────
    let split = SceneSplit::new(train_cfg.load_scenes()?, cfg.fractions, cfg.random_seed)?;
    let shape = split.shape();
    tracing::info!("Split {} scenes {:?}", split.scene_count(), cfg.fractions);

    // ── Step 3: Runs ──────────────────────────────────────────────────────────
    let mut results = Vec::new();
    let mut interrupted = false;

    for run in plan_runs(cfg.experiment, shape.n_bands, split.scene_count(), &cfg.sample_counts) {
        if interrupt.load(Ordering::SeqCst) {
            interrupted = true;
            break;
        }
        let partitions = split.subset(run.n_scenes);
        let smallest = [partitions.train.len(), partitions.test.len(), partitions.val.len()]
            .into_iter()
            .min()
            .unwrap_or(0);
        if smallest < cfg.batch_size {
            tracing::warn!(
                "Skipping {} with {} scenes: a partition has fewer than {} scenes",
                run.experiment,
                run.n_scenes,
                cfg.batch_size
            );
            continue;
        }

        tracing::info!("{}: {} bands, {} scenes", run.experiment, run.kept_bands, run.n_scenes);
        let encoder = CheckpointStore::load_encoder(&checkpoint, encoder_config.init::<B>(&device), &device)?;
        let model = ClassifierConfig::new(shape.n_labels).init(&encoder_config, encoder, &device)?;
        let settings = FitSettings {
            epochs:              cfg.epochs,
            batch_size:          cfg.batch_size,
            learning_rate:       cfg.learning_rate,
            dense_lr_multiplier: cfg.dense_lr_multiplier,
            gradient_clipnorm:   cfg.gradient_clipnorm,
            kept_bands:          run.kept_bands,
            random_seed:         cfg.random_seed,
            weights_path:        Some(out_dir.join(run.tag())),
        };

        let report = match fit(model, &partitions, shape, &settings, &device, interrupt) {
            Ok(report) => report,
            Err(e) if interrupt.load(Ordering::SeqCst) => {
                tracing::warn!("Run interrupted before it finished an epoch: {e:#}");
                interrupted = true;
                break;
            }
            Err(e) => return Err(e),
        };

        results.push(ClassificationResult {
            run,
            best_epoch:         report.best_epoch,
            val_accuracy:       report.val.accuracy,
            val_top2_accuracy:  report.val.top2_accuracy,
            test_loss:          report.test.loss,
            test_accuracy:      report.test.accuracy,
            test_top2_accuracy: report.test.top2_accuracy,
        });

        // ── Step 4: Results so far ────────────────────────────────────────────
        write_results(&csv, &results)?;

        if report.interrupted {
            interrupted = true;
            break;
        }
    }

    Ok(ClassifyReport { results, csv, interrupted })
}

fn write_results(path: &Path, results: &[ClassificationResult]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Cannot create '{}'", path.display()))?;
    let mut w = BufWriter::new(file);

    writeln!(
        w,
        "experiment,bands,scenes,best_epoch,val_accuracy,val_top2_accuracy,test_loss,test_accuracy,test_top2_accuracy"
    )?;
    for r in results {
        writeln!(
            w,
            "{},{},{},{},{:.6},{:.6},{:.6},{:.6},{:.6}",
            r.run.experiment,
            r.run.kept_bands,
            r.run.n_scenes,
            r.best_epoch,
            r.val_accuracy,
            r.val_top2_accuracy,
            r.test_loss,
            r.test_accuracy,
            r.test_top2_accuracy,
        )?;
    }
    w.flush()?;
    Ok(())
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::train_use_case::{TrainConfig, TrainUseCase};

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(ClassifyConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let base = ClassifyConfig::default();
        let cases = vec![
            (ClassifyConfig { epochs: 0, ..base.clone() }, ConfigError::NotPositive("epochs")),
            (ClassifyConfig { learning_rate: -1.0, ..base.clone() }, ConfigError::LearningRate(-1.0)),
            (ClassifyConfig { gradient_clipnorm: 0.0, ..base.clone() }, ConfigError::ClipNorm(0.0)),
            (ClassifyConfig { sample_counts: vec![100, 0], ..base.clone() }, ConfigError::NotPositive("sample_counts")),
        ];
        for (cfg, expected) in cases {
            assert_eq!(cfg.validate(), Err(expected));
        }

        let fractions = SplitFractions { train: 0.9, test: 0.2, val: 0.1 };
        assert!(matches!(
            ClassifyConfig { fractions, ..base }.validate(),
            Err(ConfigError::SplitFractions(_))
        ));
    }

    #[test]
    fn test_plan_drops_bands_then_scenes() {
        let runs = plan_runs(Experiment::Both, 3, 500, &[1000, 400, 100]);
        let summary: Vec<_> = runs.iter().map(|r| (r.experiment, r.kept_bands, r.n_scenes)).collect();
        assert_eq!(
            summary,
            vec![
                ("degrading_inputs", 3, 500),
                ("degrading_inputs", 2, 500),
                ("degrading_inputs", 1, 500),
                ("degrading_dataset", 3, 400),
                ("degrading_dataset", 3, 100),
            ]
        );
        assert_eq!(runs[1].tag(), "classification_02band");
        assert_eq!(runs[4].tag(), "classification_0100samples");

        assert_eq!(plan_runs(Experiment::DegradingInputs, 2, 10, &[5]).len(), 2);
        assert_eq!(plan_runs(Experiment::DegradingDataset, 2, 10, &[5]).len(), 1);
    }

    #[test]
    fn test_classifies_a_trained_run() {
        let tmp = tempfile::tempdir().unwrap();
        let train = TrainConfig {
            synthetic_scenes: 16,
            data_tilesize: 16,
            model_tilesize: 16,
            encoder_width: 2,
            batch_size: 2,
            train_batches: 1,
            summary_frequency: 0,
            out_dir: tmp.path().to_path_buf(),
            backend: BackendKind::NdArray,
            ..TrainConfig::default()
        };
        TrainUseCase::new(train, Arc::new(AtomicBool::new(false))).execute().unwrap();

        let out = tmp.path().join("classification");
        let cfg = ClassifyConfig {
            run_dir: tmp.path().to_path_buf(),
            out_dir: Some(out.clone()),
            epochs: 1,
            batch_size: 2,
            learning_rate: 1e-3,
            fractions: SplitFractions { train: 0.5, test: 0.25, val: 0.25 },
            // 6 scenes leave a 1-scene test partition and are skipped
            sample_counts: vec![1000, 12, 6],
            backend: BackendKind::NdArray,
            ..ClassifyConfig::default()
        };
        let report = ClassifyUseCase::new(cfg, Arc::new(AtomicBool::new(false))).execute().unwrap();

        let runs: Vec<_> = report.results.iter().map(|r| (r.run.kept_bands, r.run.n_scenes)).collect();
        assert_eq!(runs, vec![(3, 16), (2, 16), (1, 16), (3, 12)]);
        assert!(!report.interrupted);
        assert!(report.results.iter().all(|r| (0.0..=1.0).contains(&r.test_accuracy)));

        assert_eq!(report.csv, out.join(RESULTS_FILE));
        let csv = std::fs::read_to_string(&report.csv).unwrap();
        assert_eq!(csv.lines().count(), 1 + 4);
        assert!(csv.lines().nth(4).unwrap().starts_with("degrading_dataset,3,12,1,"));
        assert!(out.join("classification_01band.mpk.gz").exists());
        assert!(out.join("classification_0012samples.mpk.gz").exists());
    }

    #[test]
    fn test_interrupted_before_start_runs_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let train = TrainConfig {
            synthetic_scenes: 8,
            data_tilesize: 16,
            model_tilesize: 16,
            encoder_width: 2,
            batch_size: 2,
            train_batches: 1,
            summary_frequency: 0,
            out_dir: tmp.path().to_path_buf(),
            backend: BackendKind::NdArray,
            ..TrainConfig::default()
        };
        TrainUseCase::new(train, Arc::new(AtomicBool::new(false))).execute().unwrap();

        let cfg = ClassifyConfig { run_dir: tmp.path().to_path_buf(), backend: BackendKind::NdArray, ..ClassifyConfig::default() };
        let report = ClassifyUseCase::new(cfg, Arc::new(AtomicBool::new(true))).execute().unwrap();
        assert!(report.interrupted);
        assert!(report.results.is_empty());
    }
}

// ============================================================
// Layer 5 — Scene Classifier
// ============================================================
// Supervised fine-tuning of a trained encoder, used by the
// classification experiments.
//
//   images [N, H, W, bands]
//     │ mask bands beyond the first k
//     ▼
//   encoder ─► conv4_block5_out ─► 1×1 conv, 64  ─► global max ─┐
//           └► conv5_block3_out ─► 1×1 conv, 128 ─► global max ─┴► concat ─► dense ─► logits
//
// The whole model trains, encoder included. Adam clips every
// gradient tensor to norm 1 on its own; the dense layer's
// learning rate is multiplied (×10 by default), the rest use the
// base rate.
//
// A run is an epoch loop over whole batches of the train
// partition. After each epoch the validation partition is scored;
// the epoch with the best validation accuracy is kept (and saved
// when a path is given) and is the one scored on the test
// partition at the end.
//
// Key Burn 0.20 insight:
//   - GradientsParams::from_module takes the dense gradients out
//     of the backward pass; from_grads collects the rest, so two
//     optimizer steps at two learning rates update disjoint
//     parameters
//   - Evaluation runs on model.valid(), the InnerBackend copy
//
// Reference: Burn Book §5, Kingma & Ba (2015) Adam

use anyhow::{anyhow, bail, ensure, Context, Result};
use burn::{
    module::AutodiffModule,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        Linear, LinearConfig,
    },
    optim::{grad_clipping::GradientClippingConfig, AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkGzFileRecorder},
    tensor::backend::AutodiffBackend,
};
use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use crate::data::{splitter::Partitions, stream::SceneLoader};
use crate::domain::scene::SceneShape;
use crate::infra::metrics::MeanMetric;
use crate::ml::encoder::{ContrastiveEncoder, EncoderConfig};
use crate::ml::step::host_values;

const MID_LAYER: &str = "conv4_block5_out";
const DEEP_LAYER: &str = "conv5_block3_out";

#[derive(Config, Debug)]
pub struct ClassifierConfig {
    pub n_labels: usize,
    /// 1×1 filters on conv4_block5_out
    #[config(default = 64)]
    pub mid_filters: usize,
    /// 1×1 filters on conv5_block3_out
    #[config(default = 128)]
    pub deep_filters: usize,
}

impl ClassifierConfig {
    /// Put a head on `encoder`, built from `encoder_config`
    pub fn init<B: Backend>(
        &self,
        encoder_config: &EncoderConfig,
        encoder:        ContrastiveEncoder<B>,
        device:         &B::Device,
    ) -> Result<SceneClassifier<B>> {
        let channels = |layer| {
            encoder_config
                .channels(layer)
                .ok_or_else(|| anyhow!("encoder has no layer '{layer}'"))
        };
        let head = |inputs: usize, outputs: usize| -> Conv2d<B> {
            Conv2dConfig::new([inputs, outputs], [1, 1]).init(device)
        };

        Ok(SceneClassifier {
            encoder,
            mid_head:  head(channels(MID_LAYER)?, self.mid_filters),
            deep_head: head(channels(DEEP_LAYER)?, self.deep_filters),
            dense:     LinearConfig::new(self.mid_filters + self.deep_filters, self.n_labels).init(device),
        })
    }
}

#[derive(Module, Debug)]
pub struct SceneClassifier<B: Backend> {
    pub encoder:   ContrastiveEncoder<B>,
    pub mid_head:  Conv2d<B>,
    pub deep_head: Conv2d<B>,
    pub dense:     Linear<B>,
}

impl<B: Backend> SceneClassifier<B> {
    /// images [N, H, W, bands] → class logits [N, n_labels]
    pub fn forward(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        let reps = self.encoder.forward(images);
        let layer = |name: &str| {
            reps.get(name).cloned().ok_or_else(|| anyhow!("encoder produced no '{name}'"))
        };

        let mid = global_max_pool(self.mid_head.forward(layer(MID_LAYER)?));
        let deep = global_max_pool(self.deep_head.forward(layer(DEEP_LAYER)?));
        Ok(self.dense.forward(Tensor::cat(vec![mid, deep], 1)))
    }
}

/// [N, C, H, W] → [N, C]
fn global_max_pool<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 2> {
    let [n, c, h, w] = x.dims();
    x.reshape([n, c, h * w]).max_dim(2).reshape([n, c])
}

/// Keep the first `kept` bands, zero the others and scale the kept
/// ones by bands / kept, as band dropout does during training.
fn mask_bands<B: Backend>(images: Tensor<B, 4>, kept: usize) -> Tensor<B, 4> {
    let n_bands = images.dims()[3];
    if kept == 0 || kept >= n_bands {
        return images;
    }
    let scale = n_bands as f32 / kept as f32;
    let mask: Vec<f32> = (0..n_bands).map(|b| if b < kept { scale } else { 0.0 }).collect();
    let mask = Tensor::<B, 1>::from_data(TensorData::new(mask, [n_bands]), &images.device())
        .reshape([1, 1, 1, n_bands]);
    images * mask
}

fn class_targets<B: Backend>(label_ids: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let ids: Vec<i64> = label_ids.iter().map(|&l| l as i64).collect();
    Tensor::from_data(TensorData::new(ids, [label_ids.len()]), device)
}

/// Scenes whose label ranks first, and within the top two, of their logits
fn rank_hits(logits: &[f32], n_labels: usize, labels: &[usize]) -> (usize, usize) {
    let mut top_1 = 0;
    let mut top_2 = 0;
    for (row, &label) in logits.chunks_exact(n_labels).zip(labels) {
        let higher = row.iter().filter(|&&v| v > row[label]).count();
        top_1 += usize::from(higher == 0);
        top_2 += usize::from(higher < 2);
    }
    (top_1, top_2)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalMetrics {
    pub loss:          f64,
    pub accuracy:      f64,
    pub top2_accuracy: f64,
}

/// Mean loss and accuracies over one pass of `loader`
fn evaluate<B: Backend>(
    model:  &SceneClassifier<B>,
    loader: &SceneLoader<B>,
    kept:   usize,
) -> Result<EvalMetrics> {
    let mut loss = MeanMetric::default();
    let (mut scenes, mut top_1, mut top_2) = (0, 0, 0);

    for batch in loader.pass() {
        let device = batch.images.device();
        let logits = model.forward(mask_bands(batch.images, kept))?;
        let [_, n_labels] = logits.dims();
        let targets = class_targets::<B>(&batch.label_ids, &device);

        let ce = CrossEntropyLossConfig::new().init(&device);
        loss.update(ce.forward(logits.clone(), targets).into_scalar().elem::<f64>());

        let (hits_1, hits_2) = rank_hits(&host_values(logits)?, n_labels, &batch.label_ids);
        top_1 += hits_1;
        top_2 += hits_2;
        scenes += batch.label_ids.len();
    }

    ensure!(scenes > 0, "no whole batch to evaluate");
    Ok(EvalMetrics {
        loss:          loss.result().unwrap_or(f64::NAN),
        accuracy:      top_1 as f64 / scenes as f64,
        top2_accuracy: top_2 as f64 / scenes as f64,
    })
}

/// Optimiser and loop settings of one classification run
#[derive(Debug, Clone, PartialEq)]
pub struct FitSettings {
    pub epochs:              usize,
    pub batch_size:          usize,
    pub learning_rate:       f64,
    pub dense_lr_multiplier: f64,
    /// Per-tensor gradient norm limit
    pub gradient_clipnorm:   f64,
    /// Bands fed to the encoder, counted from the first
    pub kept_bands:          usize,
    pub random_seed:         u64,
    /// Best weights go here, with the recorder's extension added
    pub weights_path:        Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    pub epochs_run:  usize,
    /// 1-based epoch with the best validation accuracy
    pub best_epoch:  usize,
    pub val:         EvalMetrics,
    pub test:        EvalMetrics,
    pub interrupted: bool,
}

struct Best<B: Backend> {
    epoch: usize,
    val:   EvalMetrics,
    model: SceneClassifier<B>,
}

/// Train `model` on the train partition, keep the best epoch by
/// validation accuracy and score it on the test partition.
pub fn fit<B: AutodiffBackend>(
    mut model:  SceneClassifier<B>,
    partitions: &Partitions,
    shape:      SceneShape,
    settings:   &FitSettings,
    device:     &B::Device,
    interrupt:  &AtomicBool,
) -> Result<FitReport> {
    let bs = settings.batch_size;
    let train = SceneLoader::<B>::new(partitions.train.clone(), shape, bs, Some(settings.random_seed), device);
    let val = SceneLoader::<B::InnerBackend>::new(partitions.val.clone(), shape, bs, None, device);
    let test = SceneLoader::<B::InnerBackend>::new(partitions.test.clone(), shape, bs, None, device);
    for (name, loader) in [("validation", &val), ("test", &test)] {
        ensure!(loader.batches_per_pass() > 0, "{name} partition holds less than one batch of {bs}");
    }
    ensure!(train.batches_per_pass() > 0, "train partition holds less than one batch of {bs}");

    let mut optim = AdamConfig::new()
        .with_epsilon(1e-7)
        .with_grad_clipping(Some(GradientClippingConfig::Norm(settings.gradient_clipnorm as f32)))
        .init::<B, SceneClassifier<B>>();
    let ce = CrossEntropyLossConfig::new().init(device);
    let dense_lr = settings.learning_rate * settings.dense_lr_multiplier;

    let mut best: Option<Best<B::InnerBackend>> = None;
    let mut epochs_run = 0;
    let mut interrupted = false;

    // ── Epoch loop ────────────────────────────────────────────────────────────
    for epoch in 1..=settings.epochs {
        let mut train_loss = MeanMetric::default();

        for batch in train.pass() {
            if interrupt.load(Ordering::SeqCst) {
                interrupted = true;
                break;
            }
            let logits = model.forward(mask_bands(batch.images, settings.kept_bands))?;
            let loss = ce.forward(logits, class_targets::<B>(&batch.label_ids, device));

            let value = loss.clone().into_scalar().elem::<f64>();
            if !value.is_finite() {
                bail!("Classification loss became {value} in epoch {epoch}");
            }
            train_loss.update(value);

            let mut grads = loss.backward();
            let dense_grads = GradientsParams::from_module(&mut grads, &model.dense);
            let other_grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(dense_lr, model, dense_grads);
            model = optim.step(settings.learning_rate, model, other_grads);
        }
        if interrupted {
            tracing::warn!("Interrupted during epoch {epoch}, keeping the best finished epoch");
            break;
        }
        epochs_run = epoch;

        // ── Validation ────────────────────────────────────────────────────────
        let valid = model.valid();
        let metrics = evaluate(&valid, &val, settings.kept_bands)?;
        tracing::info!(
            "Epoch {:>3}/{} | train_loss={:.4} | val_loss={:.4} | val_acc={:.1}% | val_top2={:.1}%",
            epoch,
            settings.epochs,
            train_loss.result().unwrap_or(f64::NAN),
            metrics.loss,
            metrics.accuracy * 100.0,
            metrics.top2_accuracy * 100.0,
        );

        if best.as_ref().is_none_or(|b| metrics.accuracy > b.val.accuracy) {
            if let Some(path) = &settings.weights_path {
                save_weights(&valid, path)?;
            }
            best = Some(Best { epoch, val: metrics, model: valid });
        }
    }

    let Some(best) = best else {
        bail!("No epoch finished, nothing to evaluate");
    };

    // ── Test ──────────────────────────────────────────────────────────────────
    let test_metrics = evaluate(&best.model, &test, settings.kept_bands)?;
    tracing::info!(
        "Best epoch {} | test_loss={:.4} | test_acc={:.1}% | test_top2={:.1}%",
        best.epoch,
        test_metrics.loss,
        test_metrics.accuracy * 100.0,
        test_metrics.top2_accuracy * 100.0,
    );

    Ok(FitReport { epochs_run, best_epoch: best.epoch, val: best.val, test: test_metrics, interrupted })
}

fn save_weights<B: Backend>(model: &SceneClassifier<B>, path: &Path) -> Result<()> {
    let recorder = NamedMpkGzFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(path, &recorder)
        .with_context(|| format!("Cannot save classifier weights to '{}'", path.display()))?;
    tracing::debug!("Saved classifier weights to '{}'", path.display());
    Ok(())
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{splitter::{SceneSplit, SplitFractions}, synthetic::SyntheticScenes};
    use crate::domain::traits::SceneSource;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray>;

    const SHAPE: SceneShape = SceneShape { tile_size: 16, n_bands: 3, n_labels: 3 };

    fn classifier(device: &<TestBackend as Backend>::Device) -> SceneClassifier<TestBackend> {
        let encoder_config = EncoderConfig::new(3).with_width(2);
        let encoder = encoder_config.init(device);
        ClassifierConfig::new(3).init(&encoder_config, encoder, device).unwrap()
    }

    fn settings(epochs: usize) -> FitSettings {
        FitSettings {
            epochs,
            batch_size: 2,
            learning_rate: 1e-3,
            dense_lr_multiplier: 10.0,
            gradient_clipnorm: 1.0,
            kept_bands: 3,
            random_seed: 0,
            weights_path: None,
        }
    }

    fn partitions(n: usize) -> Partitions {
        let dataset = SyntheticScenes::new(SHAPE, n, 1).load_all().unwrap();
        SceneSplit::new(dataset, SplitFractions { train: 0.5, test: 0.25, val: 0.25 }, 3).unwrap().subset(n)
    }

    #[test]
    fn test_logits_have_one_column_per_label() {
        let device = Default::default();
        let images = Tensor::<TestBackend, 4>::zeros([2, 16, 16, 3], &device);
        assert_eq!(classifier(&device).forward(images).unwrap().dims(), [2, 3]);
    }

    #[test]
    fn test_masked_bands_are_zeroed_and_kept_bands_rescaled() {
        let device = Default::default();
        let images = Tensor::<NdArray, 4>::ones([1, 1, 2, 4], &device);
        let values = host_values(mask_bands(images, 1)).unwrap();
        assert_eq!(values, vec![4.0, 0.0, 0.0, 0.0, 4.0, 0.0, 0.0, 0.0]);

        let all = host_values(mask_bands(Tensor::<NdArray, 4>::ones([1, 1, 1, 2], &device), 2)).unwrap();
        assert_eq!(all, vec![1.0, 1.0]);
    }

    #[test]
    fn test_rank_hits() {
        let logits = [0.1, 0.7, 0.2, /* */ 0.5, 0.3, 0.2, /* */ 0.1, 0.2, 0.7];
        // scene 0 label 1 ranks first, scene 1 label 1 second, scene 2 label 0 last
        assert_eq!(rank_hits(&logits, 3, &[1, 1, 0]), (1, 2));
    }

    #[test]
    fn test_dense_gradients_are_split_from_the_rest() {
        let device = Default::default();
        let model = classifier(&device);
        let images = Tensor::<TestBackend, 4>::ones([2, 16, 16, 3], &device);
        let loss = CrossEntropyLossConfig::new()
            .init(&device)
            .forward(model.forward(images).unwrap(), class_targets::<TestBackend>(&[0, 2], &device));

        let mut grads = loss.backward();
        let dense = GradientsParams::from_module(&mut grads, &model.dense);
        let rest = GradientsParams::from_grads(grads, &model);

        assert!(dense.get::<NdArray, 2>(model.dense.weight.id).is_some());
        assert!(rest.get::<NdArray, 2>(model.dense.weight.id).is_none());
        assert!(rest.get::<NdArray, 4>(model.mid_head.weight.id).is_some());
    }

    #[test]
    fn test_fit_scores_the_best_epoch_and_saves_it() {
        let tmp = tempfile::tempdir().unwrap();
        let device = Default::default();
        let settings = FitSettings { weights_path: Some(tmp.path().join("best")), ..settings(2) };

        let report =
            fit(classifier(&device), &partitions(16), SHAPE, &settings, &device, &AtomicBool::new(false)).unwrap();

        assert_eq!(report.epochs_run, 2);
        assert!((1..=2).contains(&report.best_epoch));
        assert!(!report.interrupted);
        for m in [report.val, report.test] {
            assert!((0.0..=1.0).contains(&m.accuracy));
            assert!(m.top2_accuracy >= m.accuracy);
            assert!(m.loss.is_finite());
        }
        assert!(tmp.path().join("best.mpk.gz").exists());
    }

    #[test]
    fn test_interrupt_before_any_epoch_is_an_error() {
        let device = Default::default();
        let result = fit(classifier(&device), &partitions(16), SHAPE, &settings(3), &device, &AtomicBool::new(true));
        assert!(result.is_err());
    }

    #[test]
    fn test_partition_smaller_than_a_batch_is_rejected() {
        let device = Default::default();
        // 6 scenes: 1 validation scene, batch size 2
        let result = fit(classifier(&device), &partitions(6), SHAPE, &settings(1), &device, &AtomicBool::new(false));
        assert!(result.is_err());
    }
}

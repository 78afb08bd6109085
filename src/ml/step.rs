// ============================================================
// Layer 5 — Training Step
// ============================================================
// One optimisation step on one batch:
//
//   batch ──► view 1 (seed 1) ──► encoder ──► reps 1 ─┐
//     │                                               ├─► Σ wₗ·lossₗ
//     └────► view 2 (seed 2) ──► encoder ──► reps 2 ─┘        │
//                                                             ▼
//                       Adam(lr) ◄── clip by global norm ◄── ∇
//
// Both views go through the same encoder, so gradients from the
// two branches accumulate on the same parameters.
//
// In SummaryMode::Record the step also pulls tensors back to the
// host and writes view images, histograms and similarity
// matrices. That only reads values; the update is identical in
// both modes.

use anyhow::{anyhow, bail, Result};
use burn::{
    optim::{GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};

use crate::domain::traits::{HistogramSummary, SummarySink};
use crate::infra::visualize::{self, BandTriple};
use crate::ml::encoder::{ContrastiveEncoder, ParamRef, Representations};
use crate::ml::loss::{AggregateLoss, LayerLossAggregator};
use crate::ml::views::{ViewConfig, ViewGenerator, VIEW_SEEDS};

const HISTOGRAM_BUCKETS: usize = 30;

/// Whether a step writes its detailed summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryMode {
    Record,
    Skip,
}

/// Host-side metrics of one layer
#[derive(Debug, Clone, PartialEq)]
pub struct LayerMetrics {
    pub layer:    String,
    pub loss:     f64,
    pub accuracy: f64,
}

/// What one step reports back to the training loop
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Weighted total loss
    pub loss:          f64,
    pub layers:        Vec<LayerMetrics>,
    /// Global gradient norm before clipping
    pub gradient_norm: f64,
}

pub struct TrainStep {
    views:           [ViewGenerator; 2],
    aggregator:      LayerLossAggregator,
    clip_norm:       f64,
    visualize_bands: Vec<BandTriple>,
}

impl TrainStep {
    pub fn new(
        view_config:     ViewConfig,
        random_seed:     u64,
        aggregator:      LayerLossAggregator,
        clip_norm:       f64,
        visualize_bands: Vec<BandTriple>,
    ) -> Self {
        let views = VIEW_SEEDS.map(|seed| ViewGenerator::new(view_config, random_seed, seed));
        Self { views, aggregator, clip_norm, visualize_bands }
    }

    pub fn aggregator(&self) -> &LayerLossAggregator {
        &self.aggregator
    }

    /// Run one step and return the updated encoder.
    ///
    /// Fails without touching the encoder if the loss is NaN or infinite.
    #[allow(clippy::too_many_arguments)]
    pub fn run<B, O>(
        &mut self,
        encoder:       &ContrastiveEncoder<B>,
        optim:         &mut O,
        images:        Tensor<B, 4>,
        step:          i64,
        learning_rate: f64,
        dropout_rate:  f64,
        mode:          SummaryMode,
        sink:          &mut dyn SummarySink,
    ) -> Result<(ContrastiveEncoder<B>, StepOutcome)>
    where
        B: AutodiffBackend,
        O: Optimizer<ContrastiveEncoder<B>, B>,
    {
        let [view_1, view_2] = [0, 1].map(|i| {
            self.views[i].make_view(images.clone(), step, dropout_rate)
        });

        let reps_1 = encoder.forward(view_1.clone());
        let reps_2 = encoder.forward(view_2.clone());
        let aggregate = self.aggregator.aggregate(&reps_1, &reps_2)?;

        let loss = aggregate.total.clone().into_scalar().elem::<f64>();
        if !loss.is_finite() {
            bail!("Loss became {loss} at step {step}");
        }

        let layers = layer_metrics(&aggregate);

        if mode == SummaryMode::Record {
            self.record(step, [&view_1, &view_2], &reps_1, &aggregate, sink)?;
        }

        let grads = aggregate.total.backward();
        let mut grads = GradientsParams::from_grads(grads, encoder);
        let gradient_norm = clip_by_global_norm::<B>(&mut grads, &encoder.param_refs(), self.clip_norm);

        let encoder = optim.step(learning_rate, encoder.clone(), grads);

        Ok((encoder, StepOutcome { loss, layers, gradient_norm }))
    }

    /// View images, representation and similarity histograms, similarity matrices
    fn record<B: Backend>(
        &self,
        step:      i64,
        views:     [&Tensor<B, 4>; 2],
        reps:      &Representations<B>,
        aggregate: &AggregateLoss<B>,
        sink:      &mut dyn SummarySink,
    ) -> Result<()> {
        for (view, generator) in views.into_iter().zip(&self.views) {
            let [_, side, _, bands] = view.dims();
            let first = host_values(view.clone().slice([0..1, 0..side, 0..side, 0..bands]))?;
            for triple in &self.visualize_bands {
                let image = visualize::rgb_image(&first, side, bands, triple);
                sink.write_image(step, &format!("view_{}/{}", generator.seed(), triple.name), &image)?;
            }
        }

        for layer in &aggregate.layers {
            if let Some(rep) = reps.get(&layer.layer) {
                let values = host_values(rep.clone())?;
                let histogram = HistogramSummary::from_values(&values, HISTOGRAM_BUCKETS);
                sink.write_histogram(step, &format!("{}/representation", layer.layer), &histogram)?;
            }

            let n = layer.output.similarities.dims()[0];
            let sims = host_values(layer.output.similarities.clone())?;
            let histogram = HistogramSummary::from_values(&sims, HISTOGRAM_BUCKETS);
            sink.write_histogram(step, &format!("{}/similarities", layer.layer), &histogram)?;
            sink.write_image(
                step,
                &format!("{}/similarity_matrix", layer.layer),
                &visualize::similarity_image(&sims, n),
            )?;
        }
        Ok(())
    }
}

fn layer_metrics<B: Backend>(aggregate: &AggregateLoss<B>) -> Vec<LayerMetrics> {
    aggregate
        .layers
        .iter()
        .map(|l| LayerMetrics {
            layer:    l.layer.clone(),
            loss:     l.output.loss.clone().into_scalar().elem::<f64>(),
            accuracy: l.output.accuracy.clone().into_scalar().elem::<f64>(),
        })
        .collect()
}

pub(crate) fn host_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("Cannot read tensor values: {e:?}"))
}

/// Scale all gradients so their joint L2 norm is at most `max_norm`.
/// Returns the norm before scaling.
pub fn clip_by_global_norm<B: AutodiffBackend>(
    grads:    &mut GradientsParams,
    params:   &[ParamRef],
    max_norm: f64,
) -> f64 {
    let squared: f64 = params
        .iter()
        .map(|p| match *p {
            ParamRef::Kernel(id) => squared_norm(grads.get::<B::InnerBackend, 4>(id)),
            ParamRef::Bias(id) => squared_norm(grads.get::<B::InnerBackend, 1>(id)),
        })
        .sum();
    let norm = squared.sqrt();

    if norm > max_norm && norm.is_finite() {
        let scale = max_norm / norm;
        for p in params {
            match *p {
                ParamRef::Kernel(id) => rescale::<B::InnerBackend, 4>(grads, id, scale),
                ParamRef::Bias(id) => rescale::<B::InnerBackend, 1>(grads, id, scale),
            }
        }
    }
    norm
}

fn squared_norm<B: Backend, const D: usize>(grad: Option<Tensor<B, D>>) -> f64 {
    grad.map(|g| g.powf_scalar(2.0).sum().into_scalar().elem::<f64>())
        .unwrap_or(0.0)
}

fn rescale<B: Backend, const D: usize>(
    grads: &mut GradientsParams,
    id:    burn::module::ParamId,
    scale: f64,
) {
    if let Some(g) = grads.remove::<B, D>(id) {
        grads.register::<B, D>(id, g.mul_scalar(scale));
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::layers::LayerLossWeights;
    use crate::domain::traits::SummaryImage;
    use crate::ml::encoder::EncoderConfig;
    use burn::{
        backend::{Autodiff, NdArray},
        optim::AdamConfig,
        tensor::TensorData,
    };

    type TestBackend = Autodiff<NdArray>;

    /// Counts what a step writes
    #[derive(Default)]
    struct CountingSink {
        images:     Vec<String>,
        histograms: Vec<String>,
    }

    impl SummarySink for CountingSink {
        fn write_scalar(&mut self, _: i64, _: &str, _: f64) -> Result<()> {
            Ok(())
        }
        fn write_histogram(&mut self, _: i64, tag: &str, _: &HistogramSummary) -> Result<()> {
            self.histograms.push(tag.to_string());
            Ok(())
        }
        fn write_image(&mut self, _: i64, tag: &str, _: &SummaryImage) -> Result<()> {
            self.images.push(tag.to_string());
            Ok(())
        }
        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn batch(n: usize, side: usize, bands: usize) -> Tensor<TestBackend, 4> {
        let values: Vec<f32> = (0..n * side * side * bands)
            .map(|i| ((i as f32) * 0.37).sin())
            .collect();
        Tensor::from_data(TensorData::new(values, [n, side, side, bands]), &Default::default())
    }

    fn train_step(visualize: Vec<BandTriple>) -> TrainStep {
        let views = ViewConfig { model_tilesize: 16, brightness_delta: 0.1, contrast_delta: 0.1 };
        let weights = LayerLossWeights::parse("conv4_block5_out:0.5,conv5_block3_out:1.0").unwrap();
        TrainStep::new(views, 0, LayerLossAggregator::new(weights, 0.1), 1.0, visualize)
    }

    #[test]
    fn test_step_updates_encoder_and_reports_layers() {
        let device = Default::default();
        let encoder = EncoderConfig::new(3).with_width(2).init::<TestBackend>(&device);
        let mut optim = AdamConfig::new().with_epsilon(1e-7).init::<TestBackend, ContrastiveEncoder<TestBackend>>();
        let before = host_values(encoder.stem.weight.val()).unwrap();

        let mut step = train_step(vec![]);
        let mut sink = CountingSink::default();
        let (updated, outcome) = step
            .run(&encoder, &mut optim, batch(4, 20, 3), 0, 1e-2, 0.0, SummaryMode::Skip, &mut sink)
            .unwrap();

        assert!(outcome.loss.is_finite() && outcome.loss > 0.0);
        assert_eq!(outcome.layers.len(), 2);
        assert_eq!(outcome.layers[1].layer, "conv5_block3_out");
        assert!((0.0..=1.0).contains(&outcome.layers[0].accuracy));
        assert!(sink.images.is_empty() && sink.histograms.is_empty());

        let after = host_values(updated.stem.weight.val()).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_record_mode_writes_summaries() {
        let device = Default::default();
        let encoder = EncoderConfig::new(3).with_width(2).init::<TestBackend>(&device);
        let mut optim = AdamConfig::new().init::<TestBackend, ContrastiveEncoder<TestBackend>>();

        let rgb = BandTriple { name: "rgb".into(), indices: [2, 1, 0] };
        let mut step = train_step(vec![rgb]);
        let mut sink = CountingSink::default();
        step.run(&encoder, &mut optim, batch(3, 16, 3), 5, 1e-3, 0.1, SummaryMode::Record, &mut sink)
            .unwrap();

        assert!(sink.images.contains(&"view_1/rgb".to_string()));
        assert!(sink.images.contains(&"view_2/rgb".to_string()));
        assert!(sink.images.contains(&"conv5_block3_out/similarity_matrix".to_string()));
        assert_eq!(sink.histograms.len(), 4);
    }

    #[test]
    fn test_recording_does_not_change_the_update() {
        let device = Default::default();
        let encoder = EncoderConfig::new(3).with_width(2).init::<TestBackend>(&device);
        let rgb = BandTriple { name: "rgb".into(), indices: [0, 1, 2] };

        let run = |mode: SummaryMode| {
            let mut optim = AdamConfig::new()
                .with_epsilon(1e-7)
                .init::<TestBackend, ContrastiveEncoder<TestBackend>>();
            let mut step = train_step(vec![rgb.clone()]);
            let mut sink = CountingSink::default();
            let (updated, outcome) = step
                .run(&encoder.clone(), &mut optim, batch(4, 20, 3), 3, 1e-2, 0.25, mode, &mut sink)
                .unwrap();
            (outcome, host_values(updated.stem.weight.val()).unwrap())
        };

        let (recorded, recorded_weights) = run(SummaryMode::Record);
        let (skipped, skipped_weights) = run(SummaryMode::Skip);

        assert_eq!(recorded.loss, skipped.loss);
        assert_eq!(recorded.layers, skipped.layers);
        assert_eq!(recorded.gradient_norm, skipped.gradient_norm);
        assert_eq!(recorded_weights, skipped_weights);
    }

    #[test]
    fn test_clipping_bounds_global_norm() {
        let device = Default::default();
        let encoder = EncoderConfig::new(3).with_width(2).init::<TestBackend>(&device);
        let reps = encoder.forward(batch(2, 16, 3));
        let loss = reps.get("conv1_relu").unwrap().clone().sum().mul_scalar(100.0);

        let mut grads = GradientsParams::from_grads(loss.backward(), &encoder);
        let params = encoder.param_refs();
        let before = clip_by_global_norm::<TestBackend>(&mut grads, &params, 0.5);
        assert!(before > 0.5);

        let after = clip_by_global_norm::<TestBackend>(&mut grads, &params, f64::MAX);
        assert!((after - 0.5).abs() < 1e-3, "norm after clipping: {after}");
    }
}

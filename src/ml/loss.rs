// ============================================================
// Layer 5 — Contrastive Loss
// ============================================================
// Noise-contrastive loss between two views of the same batch.
//
//   r1, r2: [N, ...] representations of view 1 and view 2
//   S = (flat(r1) · flat(r2)ᵀ) / τ                  [N, N]
//
// Row i of S scores scene i of view 1 against every scene of
// view 2; the matching scene is on the diagonal.
//
//   forward  = -mean_i log_softmax(S, rows)[i, i]
//   backward = -mean_j log_softmax(S, cols)[j, j]
//   loss     = forward + backward
//
// With N scenes per batch, chance level is 2·ln(N); a perfect
// encoder drives the loss towards 0.
//
// Accuracy is the fraction of rows whose largest entry is the
// diagonal one.
//
// Reference: Oord et al. (2018) Representation Learning with
//            Contrastive Predictive Coding

use anyhow::{anyhow, Result};
use burn::{
    prelude::*,
    tensor::{activation::log_softmax, TensorData},
};

use crate::domain::layers::LayerLossWeights;
use crate::ml::encoder::Representations;

/// Loss terms and diagnostics of one layer
#[derive(Debug, Clone)]
pub struct ContrastiveOutput<B: Backend> {
    /// forward + backward — shape: [1]
    pub loss:         Tensor<B, 1>,
    pub forward:      Tensor<B, 1>,
    pub backward:     Tensor<B, 1>,
    /// Fraction of rows matched correctly — shape: [1]
    pub accuracy:     Tensor<B, 1>,
    /// Temperature-scaled similarity matrix — shape: [N, N]
    pub similarities: Tensor<B, 2>,
}

pub fn contrastive_loss<B: Backend>(
    repr_1:      Tensor<B, 4>,
    repr_2:      Tensor<B, 4>,
    temperature: f64,
) -> ContrastiveOutput<B> {
    let n = repr_1.dims()[0];
    let device = repr_1.device();

    let flat_1: Tensor<B, 2> = repr_1.flatten(1, 3);
    let flat_2: Tensor<B, 2> = repr_2.flatten(1, 3);

    let similarities = flat_1.matmul(flat_2.transpose()).div_scalar(temperature);

    let eye = identity::<B>(n, &device);
    let forward = diagonal_mean(log_softmax(similarities.clone(), 1), eye.clone()).neg();
    let backward = diagonal_mean(log_softmax(similarities.clone(), 0), eye).neg();

    let targets = Tensor::<B, 1, Int>::arange(0..n as i64, &device);
    let accuracy = similarities
        .clone()
        .argmax(1)
        .flatten::<1>(0, 1)
        .equal(targets)
        .float()
        .mean();

    ContrastiveOutput {
        loss: forward.clone() + backward.clone(),
        forward,
        backward,
        accuracy,
        similarities,
    }
}

fn identity<B: Backend>(n: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut values = vec![0.0f32; n * n];
    for i in 0..n {
        values[i * n + i] = 1.0;
    }
    Tensor::from_data(TensorData::new(values, [n, n]), device)
}

fn diagonal_mean<B: Backend>(matrix: Tensor<B, 2>, eye: Tensor<B, 2>) -> Tensor<B, 1> {
    let n = matrix.dims()[0];
    (matrix * eye).sum().div_scalar(n as f64)
}

// ─── Multi-layer aggregation ──────────────────────────────────────────────────

/// The loss of one layer and the weight it enters the total with
#[derive(Debug, Clone)]
pub struct LayerLoss<B: Backend> {
    pub layer:  String,
    pub weight: f64,
    pub output: ContrastiveOutput<B>,
}

#[derive(Debug, Clone)]
pub struct AggregateLoss<B: Backend> {
    /// Σ weight · loss over every configured layer — shape: [1]
    pub total:  Tensor<B, 1>,
    /// Per-layer results in configuration order
    pub layers: Vec<LayerLoss<B>>,
}

/// Applies the contrastive loss at every weighted layer.
#[derive(Debug, Clone)]
pub struct LayerLossAggregator {
    weights:     LayerLossWeights,
    temperature: f64,
}

impl LayerLossAggregator {
    pub fn new(weights: LayerLossWeights, temperature: f64) -> Self {
        Self { weights, temperature }
    }

    pub fn weights(&self) -> &LayerLossWeights {
        &self.weights
    }

    pub fn aggregate<B: Backend>(
        &self,
        view_1: &Representations<B>,
        view_2: &Representations<B>,
    ) -> Result<AggregateLoss<B>> {
        let mut total: Option<Tensor<B, 1>> = None;
        let mut layers = Vec::with_capacity(self.weights.len());

        for entry in self.weights.iter() {
            let (r1, r2) = view_1
                .get(&entry.layer)
                .zip(view_2.get(&entry.layer))
                .ok_or_else(|| anyhow!("Encoder produced no '{}' representation", entry.layer))?;

            let output = contrastive_loss(r1.clone(), r2.clone(), self.temperature);
            let weighted = output.loss.clone().mul_scalar(entry.weight);
            total = Some(match total {
                Some(sum) => sum + weighted,
                None => weighted,
            });

            layers.push(LayerLoss { layer: entry.layer.clone(), weight: entry.weight, output });
        }

        let total = total.ok_or_else(|| anyhow!("No layers to compute the loss on"))?;
        Ok(AggregateLoss { total, layers })
    }
}

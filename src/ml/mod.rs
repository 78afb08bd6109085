// ============================================================
// Layer 5 — ML Layer (Burn)
// ============================================================
// All tensor code of the crate lives here.
//
// What's in this layer:
//
//   encoder.rs   — residual CNN exposing activations at five
//                  named depths (conv1_relu … conv5_block3_out)
//
//   views.rs     — seeded augmentation: crop, brightness and
//                  contrast jitter, band dropout
//
//   loss.rs      — symmetric contrastive loss for one layer and
//                  the weighted sum over several layers
//
//   step.rs      — one optimisation step: two views, shared
//                  encoder, loss, global-norm clipping, Adam
//
//   trainer.rs   — the resumable training loop with checkpoint
//                  and summary cadences
//
//   projector.rs — encodes scenes with a trained encoder and
//                  projects a layer with exact PCA
//
//   tsne.rs      — exact t-SNE of encoded scenes to 2-D
//
//   classifier.rs — classification head on the encoder and the
//                  epoch loop that fine-tunes it
//
// Reference: Burn Book §3 (Building Blocks)
//            Burn Book §5 (Training)
//            He et al. (2016) Deep Residual Learning

/// Residual encoder with named representation layers
pub mod encoder;

/// Augmented views of a batch
pub mod views;

/// Contrastive loss and multi-layer aggregation
pub mod loss;

/// Single training step with gradient clipping
pub mod step;

/// Training loop, resume and checkpoint cadence
pub mod trainer;

/// PCA projection of learned representations
pub mod projector;

/// t-SNE embedding of learned representations
pub mod tsne;

/// Supervised fine-tuning for the classification experiments
pub mod classifier;

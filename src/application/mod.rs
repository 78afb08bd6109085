// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// This layer orchestrates all the other layers to accomplish
// one goal: training an encoder, projecting what a trained
// encoder has learned, or fine-tuning it as a classifier.
//
// Rules for this layer:
//   - No tensor math or model code here
//   - No printing here (that's Layer 1)
//   - Only workflow coordination
//
// Reference: Clean Architecture pattern
//            Rust Book §7 (Module System)

// The contrastive training workflow and its configuration
pub mod train_use_case;

// PCA and t-SNE projections of a trained run's representations
pub mod project_use_case;

// Degrading inputs and degrading dataset classification experiments
pub mod classify_use_case;

// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Everything that touches the file system on behalf of the
// training loop:
//
//   checkpoint.rs — Numbered checkpoint directories
//                   (ckpt-<step>/) holding the encoder record,
//                   the Adam state and the loop counters.
//                   Writes go to a temporary directory that is
//                   renamed into place, then old checkpoints
//                   are pruned by the retention policy.
//                   Also saves/loads the run's TrainConfig.
//
//   metrics.rs    — Running means between summary flushes and
//                   the on-disk summary writer (scalars and
//                   histograms as CSV, images as PNG).
//
//   visualize.rs  — Turns band triples and similarity
//                   matrices into 8-bit images.
//
//   encoding_cache.rs — Encoded scenes of the projection
//                   experiment, reused by later projections.
//
// Reference: Rust Book §9 (Error Handling with anyhow)
//            Burn Book §5 (Checkpointing)

/// Checkpoint saving, loading and retention
pub mod checkpoint;

/// Summary accumulation and writing
pub mod metrics;

/// Image rendering for summaries
pub mod visualize;

/// Encoded scenes stored next to projection outputs
pub mod encoding_cache;

// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// Everything from scenes on disk (or generated) to device
// tensors:
//
//   TileDirLoader / SyntheticScenes   → SceneDataset
//       │
//       ├─► SceneSplit     → train / test / val partitions
//       ▼
//   SceneLoader   → Burn DataLoader, whole batches, shuffled, repeating
//       │  uses
//   SceneBatcher  → SceneBatch { images [N,H,W,C], labels [N,L] }
//       │
//       ▼
//   training loop / projection and classification experiments
//
// Augmentation is not part of this layer: views are built
// on-device by ml::views, inside the training step.

/// Loads raw .f32 tiles from a class-per-directory tree
pub mod loader;

/// Deterministic synthetic scenes for smoke runs and tests
pub mod synthetic;

/// Implements Burn's Dataset trait for scenes
pub mod dataset;

/// DataLoader-backed batch stream with optional shuffle and repeat
pub mod stream;

/// Seeded train/test/val partition shared by the classification experiments
pub mod splitter;

/// Stacks scenes into tensor batches
pub mod batcher;

// ============================================================
// Layer 3 — Scene Domain Type
// ============================================================
// A scene is one square tile of co-registered imagery with any
// number of spectral bands, stored height × width × bands
// (HWC order) as f32 intensities normalised to [-1, 1].
//
// The label is only used by downstream experiments; the
// unsupervised core carries it along untouched.

use serde::{Deserialize, Serialize};

/// One multi-band image tile with its class label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    /// Pixel values in HWC order, length = tile_size² × n_bands
    pub pixels: Vec<f32>,

    /// Index of the scene's class, in [0, n_labels)
    pub label: usize,
}

impl Scene {
    pub fn new(pixels: Vec<f32>, label: usize) -> Self {
        Self { pixels, label }
    }
}

/// Shape shared by every scene of a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneShape {
    pub tile_size: usize,
    pub n_bands:   usize,
    pub n_labels:  usize,
}

impl SceneShape {
    /// Number of f32 values in one scene
    pub fn pixel_count(&self) -> usize {
        self.tile_size * self.tile_size * self.n_bands
    }
}

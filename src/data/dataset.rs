use anyhow::{ensure, Result};
use burn::data::dataset::Dataset;
use std::sync::Arc;

use crate::domain::scene::{Scene, SceneShape};

/// An in-memory collection of equally shaped scenes.
///
/// Cloning shares the scenes, so loaders and splits can each own
/// a handle.
#[derive(Clone)]
pub struct SceneDataset {
    shape:  SceneShape,
    scenes: Arc<Vec<Scene>>,
}

impl SceneDataset {
    /// Build a dataset, checking that every scene has the declared shape
    pub fn new(shape: SceneShape, scenes: Vec<Scene>) -> Result<Self> {
        let expected = shape.pixel_count();
        for (i, s) in scenes.iter().enumerate() {
            ensure!(
                s.pixels.len() == expected,
                "scene {i} has {} values, expected {expected} ({}×{}×{})",
                s.pixels.len(), shape.tile_size, shape.tile_size, shape.n_bands
            );
            ensure!(
                s.label < shape.n_labels,
                "scene {i} has label {} but the dataset has {} labels",
                s.label, shape.n_labels
            );
        }
        Ok(Self { shape, scenes: Arc::new(scenes) })
    }

    pub fn shape(&self) -> SceneShape {
        self.shape
    }

    pub fn scene_count(&self) -> usize {
        self.scenes.len()
    }
}

impl Dataset<Scene> for SceneDataset {
    fn get(&self, index: usize) -> Option<Scene> {
        self.scenes.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.scenes.len()
    }
}

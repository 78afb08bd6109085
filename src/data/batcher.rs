// ============================================================
// Layer 4 — Scene Batcher
// ============================================================
// Implements Burn's Batcher trait: stacks a Vec<Scene> into
// device tensors.
//
//   Input:  N scenes, each tile × tile × bands values (HWC)
//   Output: images [N, tile, tile, bands]
//           labels [N, n_labels]   (one-hot)
//
// Scenes are already HWC, so concatenating their pixel vectors
// gives the NHWC layout directly.
//
// The device is supplied by the DataLoader on every call, so
// one batcher serves every backend and device.

use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{backend::Backend, Tensor, TensorData},
};
use std::marker::PhantomData;

use crate::domain::scene::{Scene, SceneShape};

/// A batch of scenes ready for augmentation and the encoder.
#[derive(Debug, Clone)]
pub struct SceneBatch<B: Backend> {
    /// Pixel intensities — shape: [batch, tile, tile, bands]
    pub images: Tensor<B, 4>,

    /// One-hot labels — shape: [batch, n_labels]
    pub labels: Tensor<B, 2>,

    /// Class index of every scene, on the host
    pub label_ids: Vec<usize>,
}

/// Knows the scene shape; the target device comes with each call.
#[derive(Clone, Debug)]
pub struct SceneBatcher<B: Backend> {
    shape:    SceneShape,
    _backend: PhantomData<B>,
}

impl<B: Backend> SceneBatcher<B> {
    pub fn new(shape: SceneShape) -> Self {
        Self { shape, _backend: PhantomData }
    }
}

impl<B: Backend> Batcher<B, Scene, SceneBatch<B>> for SceneBatcher<B> {
    /// Stack `items` into one batch on `device`.
    ///
    /// # Panics
    /// Panics if `items` is empty; the DataLoader never yields an
    /// empty batch.
    fn batch(&self, items: Vec<Scene>, device: &B::Device) -> SceneBatch<B> {
        assert!(!items.is_empty(), "cannot batch zero scenes");

        let batch_size = items.len();
        let SceneShape { tile_size, n_bands, n_labels } = self.shape;

        let pixels: Vec<f32> = items.iter().flat_map(|s| s.pixels.iter().copied()).collect();
        let label_ids: Vec<usize> = items.iter().map(|s| s.label).collect();

        let mut one_hot = vec![0.0f32; batch_size * n_labels];
        for (i, &label) in label_ids.iter().enumerate() {
            one_hot[i * n_labels + label] = 1.0;
        }

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(pixels, [batch_size, tile_size, tile_size, n_bands]),
            device,
        );
        let labels = Tensor::<B, 2>::from_data(
            TensorData::new(one_hot, [batch_size, n_labels]),
            device,
        );

        SceneBatch { images, labels, label_ids }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn test_batch_shapes_and_one_hot() {
        let shape = SceneShape { tile_size: 2, n_bands: 3, n_labels: 4 };
        let batcher = SceneBatcher::<NdArray>::new(shape);
        let items = vec![
            Scene::new((0..12).map(|v| v as f32).collect(), 3),
            Scene::new(vec![0.0; 12], 1),
        ];

        let batch = batcher.batch(items, &Default::default());
        assert_eq!(batch.images.dims(), [2, 2, 2, 3]);
        assert_eq!(batch.labels.dims(), [2, 4]);
        assert_eq!(batch.label_ids, vec![3, 1]);

        let labels = batch.labels.into_data().to_vec::<f32>().unwrap();
        assert_eq!(labels, vec![0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0]);

        // Pixel (y=1, x=0, band=2) of the first scene is index (1*2+0)*3+2 = 8
        let images = batch.images.into_data().to_vec::<f32>().unwrap();
        assert_eq!(images[8], 8.0);
    }
}

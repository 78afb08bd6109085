// ============================================================
// Layer 4 — Scene Loader
// ============================================================
// Wraps Burn's DataLoader into the batch streams the training
// loop and the experiments consume:
//
//   dataset ─► truncate to whole batches ─► DataLoader ─► SceneBatch
//                                              │
//   pass():      one iteration of the loader   │
//   repeating(): loader.iter() chained forever ┘
//
// The dataset is cut to a whole number of batches before the
// loader sees it, so every batch has exactly batch_size scenes
// and the contrastive similarity matrix always has the same
// shape.
//
// With a seed, the scenes are shuffled once before the cut (so
// the dropped remainder is a random subset) and the DataLoader
// reshuffles at the start of every pass. The same seed gives
// the same sequence of batches.

use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::{
            transform::{PartialDataset, ShuffledDataset},
            Dataset,
        },
    },
    tensor::backend::Backend,
};
use std::sync::Arc;

use crate::data::batcher::{SceneBatch, SceneBatcher};
use crate::domain::scene::{Scene, SceneShape};

/// Fixed-size scene batches drawn from a Burn DataLoader.
pub struct SceneLoader<B: Backend> {
    loader:           Arc<dyn DataLoader<B, SceneBatch<B>>>,
    batches_per_pass: usize,
}

impl<B: Backend> SceneLoader<B> {
    /// Build a loader over `dataset`, shuffled every pass when
    /// `shuffle` holds a seed, in dataset order otherwise.
    pub fn new<D>(
        dataset:    D,
        shape:      SceneShape,
        batch_size: usize,
        shuffle:    Option<u64>,
        device:     &B::Device,
    ) -> Self
    where
        D: Dataset<Scene> + 'static,
    {
        let batch_size = batch_size.max(1);
        let batches_per_pass = dataset.len() / batch_size;
        let whole = batches_per_pass * batch_size;

        let builder = DataLoaderBuilder::<B, Scene, SceneBatch<B>>::new(SceneBatcher::<B>::new(shape))
            .batch_size(batch_size)
            .set_device(device.clone());

        let loader = match shuffle {
            Some(seed) => {
                let shuffled = ShuffledDataset::<D, Scene>::new(dataset, seed);
                builder.shuffle(seed).build(PartialDataset::<_, Scene>::new(shuffled, 0, whole))
            }
            None => builder.build(PartialDataset::<_, Scene>::new(dataset, 0, whole)),
        };

        Self { loader, batches_per_pass }
    }

    /// Number of batches in one pass
    pub fn batches_per_pass(&self) -> usize {
        self.batches_per_pass
    }

    /// One pass over the dataset
    pub fn pass(&self) -> impl Iterator<Item = SceneBatch<B>> + '_ {
        self.loader.iter()
    }

    /// Pass after pass, forever; empty when not even one batch fits.
    pub fn repeating(&self) -> impl Iterator<Item = SceneBatch<B>> + '_ {
        let live = self.batches_per_pass > 0;
        std::iter::repeat_with(move || self.loader.iter())
            .take_while(move |_| live)
            .flatten()
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::SceneDataset;
    use burn::backend::NdArray;

    fn shape(n: usize) -> SceneShape {
        SceneShape { tile_size: 1, n_bands: 1, n_labels: n }
    }

    fn dataset(n: usize) -> SceneDataset {
        let scenes = (0..n).map(|i| Scene::new(vec![i as f32], i)).collect();
        SceneDataset::new(shape(n), scenes).unwrap()
    }

    fn loader(n: usize, batch_size: usize, shuffle: Option<u64>) -> SceneLoader<NdArray> {
        SceneLoader::new(dataset(n), shape(n), batch_size, shuffle, &Default::default())
    }

    #[test]
    fn test_drops_remainder() {
        let loader = loader(7, 3, None);
        let batches: Vec<_> = loader.pass().collect();
        assert_eq!(loader.batches_per_pass(), 2);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.images.dims()[0] == 3));
        assert_eq!(batches[1].label_ids, vec![3, 4, 5]);
    }

    #[test]
    fn test_repeat_never_ends() {
        let n = loader(4, 2, Some(1)).repeating().take(11).count();
        assert_eq!(n, 11);
    }

    #[test]
    fn test_too_small_dataset_yields_nothing() {
        let loader = loader(2, 3, None);
        assert_eq!(loader.pass().count(), 0);
        assert_eq!(loader.repeating().count(), 0);
    }

    #[test]
    fn test_shuffle_is_seeded_and_complete() {
        let labels = |seed| -> Vec<usize> {
            loader(10, 5, Some(seed)).pass().flat_map(|b| b.label_ids).collect()
        };

        let a = labels(3);
        assert_eq!(a, labels(3));

        let mut sorted = a.clone();
        sorted.sort();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_each_pass_is_reshuffled() {
        let loader = loader(32, 32, Some(5));
        let mut passes = loader.repeating().take(3).map(|b| b.label_ids);
        let first = passes.next().unwrap();
        assert!(passes.any(|p| p != first));
    }
}

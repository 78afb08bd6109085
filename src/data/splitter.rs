// ============================================================
// Layer 4 — Scene Split
// ============================================================
// One seeded partition of a dataset into train, test and
// validation scenes, shared by every classification run:
//
//   shuffled once (seed) ─► [ train | test | val | unused ]
//                             n·f_tr  n·f_te n·f_va
//
// Sizes are floor(n · fraction). Asking for a subset of n_keep
// scenes takes the first floor(n_keep · fraction) scenes of each
// partition, so a smaller subset is always contained in a larger
// one and no scene ever moves between partitions. The same seed
// gives the same split in every experiment.

use burn::data::dataset::{
    transform::{PartialDataset, ShuffledDataset},
    Dataset,
};
use std::sync::Arc;

use crate::data::dataset::SceneDataset;
use crate::domain::{
    error::ConfigError,
    scene::{Scene, SceneShape},
};

/// A contiguous run of the shuffled scenes
pub type ScenePartition = PartialDataset<Arc<ShuffledDataset<SceneDataset, Scene>>, Scene>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitFractions {
    pub train: f64,
    pub test:  f64,
    pub val:   f64,
}

impl Default for SplitFractions {
    fn default() -> Self {
        Self { train: 0.8, test: 0.1, val: 0.1 }
    }
}

impl SplitFractions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let all = [("train", self.train), ("test", self.test), ("val", self.val)];
        if let Some((name, f)) = all.iter().find(|(_, f)| !(0.0..=1.0).contains(f)) {
            return Err(ConfigError::SplitFractions(format!("{name} fraction {f} is outside [0, 1]")));
        }
        let total = self.train + self.test + self.val;
        if total > 1.0 + 1e-9 {
            return Err(ConfigError::SplitFractions(format!("fractions sum to {total}, more than 1")));
        }
        Ok(())
    }

    /// Partition sizes for `n` scenes: train, test, val
    fn sizes(&self, n: usize) -> [usize; 3] {
        [self.train, self.test, self.val].map(|f| (n as f64 * f).floor() as usize)
    }
}

/// The three partitions of one experiment run
pub struct Partitions {
    pub train: ScenePartition,
    pub test:  ScenePartition,
    pub val:   ScenePartition,
}

pub struct SceneSplit {
    scenes:    Arc<ShuffledDataset<SceneDataset, Scene>>,
    shape:     SceneShape,
    fractions: SplitFractions,
}

impl SceneSplit {
    pub fn new(dataset: SceneDataset, fractions: SplitFractions, seed: u64) -> Result<Self, ConfigError> {
        fractions.validate()?;
        let shape = dataset.shape();
        Ok(Self { scenes: Arc::new(ShuffledDataset::new(dataset, seed)), shape, fractions })
    }

    pub fn shape(&self) -> SceneShape {
        self.shape
    }

    /// Number of scenes the split was made from
    pub fn scene_count(&self) -> usize {
        self.scenes.len()
    }

    /// Partitions of a run limited to `n_keep` scenes, nested in
    /// the partitions of every larger run. `n_keep` is capped at
    /// the dataset size.
    pub fn subset(&self, n_keep: usize) -> Partitions {
        let n = self.scene_count();
        let [n_train, n_test, _] = self.fractions.sizes(n);
        let [k_train, k_test, k_val] = self.fractions.sizes(n_keep.min(n));

        let part = |start: usize, keep: usize| {
            PartialDataset::new(Arc::clone(&self.scenes), start, start + keep)
        };
        Partitions {
            train: part(0, k_train),
            test:  part(n_train, k_test),
            val:   part(n_train + n_test, k_val),
        }
    }
}

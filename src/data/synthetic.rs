// ============================================================
// Layer 4 — Synthetic Scenes
// ============================================================
// A deterministic stand-in for real imagery, used for smoke
// runs and tests. Each scene is a smooth field per band
// (a random tilted plane plus a random sinusoid) with a little
// per-pixel noise, clamped to [-1, 1]:
//
//   v(y, x) = a·u + b·w + c·sin(f·u + φ) + noise,
//   u = y / tile, w = x / tile
//
// Bands of one scene share the sinusoid phase, so the bands are
// correlated the way co-registered sensors are. The label is
// simply the scene index modulo the label count.
//
// The same seed always produces the same dataset.

use anyhow::Result;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::data::dataset::SceneDataset;
use crate::domain::scene::{Scene, SceneShape};
use crate::domain::traits::SceneSource;

/// Generates `n_scenes` synthetic scenes of a given shape
pub struct SyntheticScenes {
    shape:    SceneShape,
    n_scenes: usize,
    seed:     u64,
}

impl SyntheticScenes {
    pub fn new(shape: SceneShape, n_scenes: usize, seed: u64) -> Self {
        Self { shape, n_scenes, seed }
    }

    fn scene(&self, index: usize, rng: &mut StdRng) -> Scene {
        let SceneShape { tile_size, n_bands, n_labels } = self.shape;
        let phase: f32 = rng.random_range(0.0..std::f32::consts::TAU);
        let freq: f32  = rng.random_range(1.0..6.0);

        let planes: Vec<(f32, f32, f32)> = (0..n_bands)
            .map(|_| {
                (
                    rng.random_range(-0.5..0.5),
                    rng.random_range(-0.5..0.5),
                    rng.random_range(0.1..0.5),
                )
            })
            .collect();

        let mut pixels = Vec::with_capacity(self.shape.pixel_count());
        for y in 0..tile_size {
            for x in 0..tile_size {
                let u = y as f32 / tile_size as f32;
                let w = x as f32 / tile_size as f32;
                for &(a, b, c) in &planes {
                    let noise: f32 = rng.random_range(-0.05..0.05);
                    let v = a * u + b * w + c * (freq * (u + w) + phase).sin() + noise;
                    pixels.push(v.clamp(-1.0, 1.0));
                }
            }
        }

        Scene::new(pixels, index % n_labels.max(1))
    }
}

impl SceneSource for SyntheticScenes {
    fn load_all(&self) -> Result<SceneDataset> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let scenes = (0..self.n_scenes).map(|i| self.scene(i, &mut rng)).collect();
        tracing::debug!("Generated {} synthetic scenes (seed {})", self.n_scenes, self.seed);
        SceneDataset::new(self.shape, scenes)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::data::dataset::Dataset;

    fn shape() -> SceneShape {
        SceneShape { tile_size: 8, n_bands: 3, n_labels: 2 }
    }

    #[test]
    fn test_same_seed_same_scenes() {
        let a = SyntheticScenes::new(shape(), 3, 7).load_all().unwrap();
        let b = SyntheticScenes::new(shape(), 3, 7).load_all().unwrap();
        for i in 0..3 {
            assert_eq!(a.get(i), b.get(i));
        }
    }

    #[test]
    fn test_values_in_range_and_labels_cycle() {
        let ds = SyntheticScenes::new(shape(), 4, 1).load_all().unwrap();
        assert_eq!(ds.len(), 4);
        for i in 0..4 {
            let s = ds.get(i).unwrap();
            assert_eq!(s.label, i % 2);
            assert!(s.pixels.iter().all(|v| (-1.0..=1.0).contains(v)));
        }
    }
}

// ============================================================
// Layer 5 — View Generator
// ============================================================
// Builds one augmented "view" of a batch. The training step
// owns two generators, seeded 1 and 2, and feeds the same batch
// to both; the encoder must then recognise which view of one
// scene matches which view of the other.
//
// Pipeline, in order:
//
//   1. random crop to the model tile size   (one offset per batch)
//   2. brightness jitter: x + b,            b ∈ [-δb, δb]
//   3. contrast jitter:   μ + c·(x - μ),    c ∈ [1-δc, 1+δc]
//                         μ = spatial mean of each (image, band)
//   4. band dropout: each (image, band) plane is zeroed with
//      probability p, survivors are scaled by 1/(1-p)
//
// All randomness comes from the generator's own StdRng, so the
// views depend only on the seeds and the sequence of calls. The
// step is only used for trace output.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Seeds of the two views built every step
pub const VIEW_SEEDS: [u64; 2] = [1, 2];

/// Augmentation settings shared by both views
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewConfig {
    /// Side of the square crop fed to the encoder
    pub model_tilesize:   usize,
    /// Maximum absolute brightness offset, 0 disables
    pub brightness_delta: f64,
    /// Maximum relative contrast change, 0 disables
    pub contrast_delta:   f64,
}

pub struct ViewGenerator {
    config: ViewConfig,
    seed:   u64,
    rng:    StdRng,
}

impl ViewGenerator {
    /// A generator for view `view_seed` of a run seeded with `random_seed`
    pub fn new(config: ViewConfig, random_seed: u64, view_seed: u64) -> Self {
        let seed = random_seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ view_seed;
        Self { config, seed: view_seed, rng: StdRng::seed_from_u64(seed) }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// images: [batch, H, W, bands] → [batch, tile, tile, bands]
    pub fn make_view<B: Backend>(
        &mut self,
        images:       Tensor<B, 4>,
        step:         i64,
        dropout_rate: f64,
    ) -> Tensor<B, 4> {
        let mut view = self.crop(images);

        let ViewConfig { brightness_delta, contrast_delta, .. } = self.config;

        if brightness_delta > 0.0 {
            let offset = self.rng.random_range(-brightness_delta..=brightness_delta);
            view = view.add_scalar(offset);
        }

        if contrast_delta > 0.0 {
            let factor = self.rng.random_range(1.0 - contrast_delta..=1.0 + contrast_delta);
            let mean = view.clone().mean_dim(1).mean_dim(2);
            view = (view - mean.clone()).mul_scalar(factor) + mean;
        }

        if dropout_rate > 0.0 {
            view = self.drop_bands(view, dropout_rate);
        }

        tracing::trace!(step, view = self.seed, dims = ?view.dims(), "built view");
        view
    }

    fn crop<B: Backend>(&mut self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, height, width, bands] = images.dims();
        let tile = self.config.model_tilesize;

        if tile >= height && tile >= width {
            return images;
        }

        let tile_h = tile.min(height);
        let tile_w = tile.min(width);
        let y = self.rng.random_range(0..=height - tile_h);
        let x = self.rng.random_range(0..=width - tile_w);
        images.slice([0..batch, y..y + tile_h, x..x + tile_w, 0..bands])
    }

    fn drop_bands<B: Backend>(&mut self, view: Tensor<B, 4>, rate: f64) -> Tensor<B, 4> {
        let [batch, _, _, bands] = view.dims();
        let kept = (1.0 / (1.0 - rate)) as f32;

        let mask: Vec<f32> = (0..batch * bands)
            .map(|_| if self.rng.random::<f64>() < rate { 0.0 } else { kept })
            .collect();

        let mask = Tensor::<B, 4>::from_data(
            TensorData::new(mask, [batch, 1, 1, bands]),
            &view.device(),
        );
        view * mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn config(tile: usize) -> ViewConfig {
        ViewConfig { model_tilesize: tile, brightness_delta: 0.0, contrast_delta: 0.0 }
    }

    /// Value (b*1000 + y*100 + x*10 + c) at every position
    fn indexed_batch(batch: usize, side: usize, bands: usize) -> (Vec<f32>, Tensor<TestBackend, 4>) {
        let mut values = Vec::new();
        for b in 0..batch {
            for y in 0..side {
                for x in 0..side {
                    for c in 0..bands {
                        values.push((b * 1000 + y * 100 + x * 10 + c) as f32);
                    }
                }
            }
        }
        let tensor = Tensor::from_data(
            TensorData::new(values.clone(), [batch, side, side, bands]),
            &Default::default(),
        );
        (values, tensor)
    }

    fn host(t: Tensor<TestBackend, 4>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_identity_without_augmentation() {
        let (values, batch) = indexed_batch(2, 4, 3);
        let mut gen = ViewGenerator::new(config(4), 0, 1);
        let view = gen.make_view(batch, 0, 0.0);
        assert_eq!(view.dims(), [2, 4, 4, 3]);
        assert_eq!(host(view), values);
    }

    #[test]
    fn test_crop_is_a_window_of_the_input() {
        let (_, batch) = indexed_batch(2, 6, 2);
        let mut gen = ViewGenerator::new(config(4), 7, 1);
        let view = gen.make_view(batch, 0, 0.0);
        assert_eq!(view.dims(), [2, 4, 4, 2]);

        let out = host(view);
        let offset_y = ((out[0] as usize) % 1000) / 100;
        let offset_x = ((out[0] as usize) % 100) / 10;
        assert!(offset_y <= 2 && offset_x <= 2);

        let mut i = 0;
        for b in 0..2 {
            for y in 0..4 {
                for x in 0..4 {
                    for c in 0..2 {
                        let expected = b * 1000 + (y + offset_y) * 100 + (x + offset_x) * 10 + c;
                        assert_eq!(out[i], expected as f32);
                        i += 1;
                    }
                }
            }
        }
    }

    #[test]
    fn test_same_seed_same_views_different_seed_different_views() {
        let jitter = ViewConfig { model_tilesize: 4, brightness_delta: 0.5, contrast_delta: 0.3 };
        let mut a = ViewGenerator::new(jitter, 11, VIEW_SEEDS[0]);
        let mut b = ViewGenerator::new(jitter, 11, VIEW_SEEDS[0]);
        let mut c = ViewGenerator::new(jitter, 11, VIEW_SEEDS[1]);

        for step in 0..3 {
            let (_, batch) = indexed_batch(2, 6, 3);
            let va = host(a.make_view(batch.clone(), step, 0.2));
            let vb = host(b.make_view(batch.clone(), step, 0.2));
            let vc = host(c.make_view(batch, step, 0.2));
            assert_eq!(va, vb);
            assert_ne!(va, vc);
        }
    }

    #[test]
    fn test_band_dropout_zeroes_whole_bands_and_rescales() {
        let (batch, side, bands, rate) = (64, 2, 8, 0.25);
        let ones = Tensor::<TestBackend, 4>::ones([batch, side, side, bands], &Default::default());

        let mut gen = ViewGenerator::new(config(side), 3, 1);
        let out = host(gen.make_view(ones, 0, rate));

        let kept = 1.0 / (1.0 - rate as f32);
        let mut dropped = 0;
        for b in 0..batch {
            for c in 0..bands {
                let plane: Vec<f32> = (0..side * side)
                    .map(|p| out[(b * side * side + p) * bands + c])
                    .collect();
                if plane[0] == 0.0 {
                    dropped += 1;
                    assert!(plane.iter().all(|&v| v == 0.0));
                } else {
                    assert!(plane.iter().all(|&v| (v - kept).abs() < 1e-6));
                }
            }
        }

        let fraction = dropped as f64 / (batch * bands) as f64;
        assert!((fraction - rate).abs() < 0.1, "dropped fraction {fraction}");
    }

    #[test]
    fn test_contrast_keeps_band_means() {
        let cfg = ViewConfig { model_tilesize: 3, brightness_delta: 0.0, contrast_delta: 0.5 };
        let (values, batch) = indexed_batch(1, 3, 2);
        let mut gen = ViewGenerator::new(cfg, 5, 2);
        let out = host(gen.make_view(batch, 0, 0.0));

        for c in 0..2 {
            let mean_in: f32 = (0..9).map(|p| values[p * 2 + c]).sum::<f32>() / 9.0;
            let mean_out: f32 = (0..9).map(|p| out[p * 2 + c]).sum::<f32>() / 9.0;
            assert!((mean_in - mean_out).abs() < 1e-2);
        }
    }
}

// ============================================================
// Layer 5 — Representation Projector
// ============================================================
// Encodes scenes with a trained encoder and projects one
// representation layer to a few dimensions, so clusters of
// similar scenes can be plotted.
//
//   batches ─► centre crop ─► encoder ─► layer [N, C, h, w]
//                                          │ flatten
//                                          ▼
//                                   X [N, C·h·w] ─► PCA ─► [N, k]
//
// PCA is exact: the centred data is reduced to the smaller of its
// covariance (d × d) and Gram (N × N) matrices, which is then
// diagonalised with cyclic Jacobi rotations. Deep layers have
// thousands of features, so for few scenes only the N × N Gram
// matrix is ever formed.
//
// Component signs are fixed so that the largest score of every
// component is positive; the same rows always give the same
// projection.

use anyhow::{anyhow, Result};
use burn::prelude::*;

use crate::data::batcher::SceneBatch;
use crate::ml::encoder::ContrastiveEncoder;
use crate::ml::step::host_values;

const MAX_SWEEPS: usize = 64;
const TOLERANCE: f64 = 1e-22;

/// Scenes encoded at one layer, with what is needed to plot them.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedScenes {
    pub labels: Vec<usize>,
    /// One flattened representation per scene
    pub rows:   Vec<Vec<f32>>,
    /// Every scene quantised to bytes — shape: [N, tile, tile, bands]
    pub images: SceneImages,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SceneImages {
    pub tile_size: usize,
    pub n_bands:   usize,
    pub pixels:    Vec<u8>,
}

/// Map [-1, 1] intensities to bytes
fn quantise(v: f32) -> u8 {
    ((v + 1.0) * 128.0).clamp(0.0, 255.0) as u8
}

/// images: [N, H, W, C] → centre [N, tile, tile, C]
pub fn centre_crop<B: Backend>(images: Tensor<B, 4>, tile: usize) -> Tensor<B, 4> {
    let [n, h, w, c] = images.dims();
    if tile >= h && tile >= w {
        return images;
    }
    let (th, tw) = (tile.min(h), tile.min(w));
    let (y, x) = ((h - th) / 2, (w - tw) / 2);
    images.slice([0..n, y..y + th, x..x + tw, 0..c])
}

/// Flattened activations of `layer`, one row per scene
pub fn encode_layer<B: Backend>(
    encoder: &ContrastiveEncoder<B>,
    images:  Tensor<B, 4>,
    layer:   &str,
) -> Result<Vec<Vec<f32>>> {
    let reps = encoder.forward(images);
    let rep = reps
        .get(layer)
        .ok_or_else(|| anyhow!("Encoder has no layer '{layer}'"))?
        .clone();

    let [n, c, h, w] = rep.dims();
    let values = host_values(rep)?;
    let width = c * h * w;
    debug_assert_eq!(values.len(), n * width);

    Ok(values.chunks_exact(width).map(<[f32]>::to_vec).collect())
}

/// Encode every batch at `layer`, keeping labels and images.
pub fn encode_scenes<B: Backend>(
    encoder:        &ContrastiveEncoder<B>,
    batches:        impl IntoIterator<Item = SceneBatch<B>>,
    layer:          &str,
    model_tilesize: usize,
) -> Result<EncodedScenes> {
    let mut labels = Vec::new();
    let mut rows = Vec::new();
    let mut pixels = Vec::new();
    let (mut tile_size, mut n_bands) = (0, 0);

    for batch in batches {
        let [_, h, _, c] = batch.images.dims();
        (tile_size, n_bands) = (h, c);

        labels.extend(batch.label_ids);
        pixels.extend(host_values(batch.images.clone())?.into_iter().map(quantise));
        let images = centre_crop(batch.images, model_tilesize);
        rows.extend(encode_layer(encoder, images, layer)?);
    }

    tracing::info!("Encoded {} scenes, {} features each", rows.len(), rows.first().map_or(0, Vec::len));
    Ok(EncodedScenes {
        labels,
        rows,
        images: SceneImages { tile_size, n_bands, pixels },
    })
}

// ─── PCA ──────────────────────────────────────────────────────────────────────

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Eigenvalues and column eigenvectors of the symmetric m × m
/// matrix `a` (row-major), largest eigenvalue first.
fn symmetric_eigen(mut a: Vec<f64>, m: usize) -> (Vec<f64>, Vec<Vec<f64>>) {
    let mut v = vec![0.0; m * m];
    (0..m).for_each(|i| v[i * m + i] = 1.0);

    let total: f64 = a.iter().map(|x| x * x).sum();
    for _ in 0..MAX_SWEEPS {
        let off: f64 = (0..m)
            .flat_map(|p| (p + 1..m).map(move |q| (p, q)))
            .map(|(p, q)| a[p * m + q] * a[p * m + q])
            .sum();
        if off <= TOLERANCE * total.max(f64::MIN_POSITIVE) {
            break;
        }

        for p in 0..m {
            for q in p + 1..m {
                let apq = a[p * m + q];
                if apq == 0.0 {
                    continue;
                }
                let theta = (a[q * m + q] - a[p * m + p]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..m {
                    let (akp, akq) = (a[k * m + p], a[k * m + q]);
                    a[k * m + p] = c * akp - s * akq;
                    a[k * m + q] = s * akp + c * akq;
                }
                for k in 0..m {
                    let (apk, aqk) = (a[p * m + k], a[q * m + k]);
                    a[p * m + k] = c * apk - s * aqk;
                    a[q * m + k] = s * apk + c * aqk;
                }
                for k in 0..m {
                    let (vkp, vkq) = (v[k * m + p], v[k * m + q]);
                    v[k * m + p] = c * vkp - s * vkq;
                    v[k * m + q] = s * vkp + c * vkq;
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&i, &j| a[j * m + j].total_cmp(&a[i * m + i]));

    let values = order.iter().map(|&i| a[i * m + i]).collect();
    let vectors = order.iter().map(|&i| (0..m).map(|k| v[k * m + i]).collect()).collect();
    (values, vectors)
}

/// Scores of every row on its first `k` principal components.
/// Fewer than `k` components exist when k > min(rows, features).
pub fn pca(rows: &[Vec<f32>], k: usize) -> Vec<Vec<f64>> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };
    let (n, d) = (rows.len(), first.len());
    let k = k.min(n).min(d);

    let mut mean = vec![0.0f64; d];
    for row in rows {
        mean.iter_mut().zip(row).for_each(|(m, &x)| *m += x as f64 / n as f64);
    }
    let centred: Vec<Vec<f64>> = rows
        .iter()
        .map(|row| row.iter().zip(&mean).map(|(&x, m)| x as f64 - m).collect())
        .collect();

    let mut scores = vec![vec![0.0f64; k]; n];
    if d <= n {
        // Covariance XᵀX, components in feature space
        let mut cov = vec![0.0f64; d * d];
        for row in &centred {
            for i in 0..d {
                for j in i..d {
                    cov[i * d + j] += row[i] * row[j];
                }
            }
        }
        for i in 0..d {
            for j in 0..i {
                cov[i * d + j] = cov[j * d + i];
            }
        }
        let (_, vectors) = symmetric_eigen(cov, d);
        for (row, out) in centred.iter().zip(scores.iter_mut()) {
            for (c, vector) in vectors.iter().take(k).enumerate() {
                out[c] = dot(row, vector);
            }
        }
    } else {
        // Gram XXᵀ: score of row i on component c is u_ic · √λ_c
        let mut gram = vec![0.0f64; n * n];
        for i in 0..n {
            for j in i..n {
                let g = dot(&centred[i], &centred[j]);
                gram[i * n + j] = g;
                gram[j * n + i] = g;
            }
        }
        let (values, vectors) = symmetric_eigen(gram, n);
        for c in 0..k {
            let scale = values[c].max(0.0).sqrt();
            for (i, out) in scores.iter_mut().enumerate() {
                out[c] = vectors[c][i] * scale;
            }
        }
    }

    // Fix the sign: largest score of each component positive
    for c in 0..k {
        let largest = scores.iter().map(|s| s[c]).fold(0.0f64, |m, x| if x.abs() > m.abs() { x } else { m });
        if largest < 0.0 {
            scores.iter_mut().for_each(|s| s[c] = -s[c]);
        }
    }
    scores
}

/// Scores of every row on the first two principal components.
pub fn pca_2d(rows: &[Vec<f32>]) -> Vec<[f64; 2]> {
    pca(rows, 2)
        .into_iter()
        .map(|s| [s.first().copied().unwrap_or(0.0), s.get(1).copied().unwrap_or(0.0)])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::batcher::SceneBatcher;
    use crate::domain::scene::{Scene, SceneShape};
    use crate::ml::encoder::EncoderConfig;
    use burn::{backend::NdArray, data::dataloader::batcher::Batcher};

    #[test]
    fn test_collinear_points_project_onto_first_axis() {
        let rows: Vec<Vec<f32>> = (-2..=2).map(|t| vec![3.0 * t as f32, 4.0 * t as f32]).collect();
        let points = pca_2d(&rows);

        for (t, p) in (-2..=2).zip(&points) {
            assert!((p[0].abs() - 5.0 * (t as f64).abs()).abs() < 1e-6, "{p:?}");
            assert!(p[1].abs() < 1e-6);
        }
        // Positions keep their order along the line
        assert!(points.windows(2).all(|w| w[0][0] < w[1][0]) || points.windows(2).all(|w| w[0][0] > w[1][0]));
    }

    #[test]
    fn test_larger_spread_is_first_component() {
        let rows = vec![
            vec![-10.0, -1.0, 0.0],
            vec![-10.0, 1.0, 0.0],
            vec![10.0, -1.0, 0.0],
            vec![10.0, 1.0, 0.0],
        ];
        let points = pca_2d(&rows);
        for p in &points {
            assert!((p[0].abs() - 10.0).abs() < 1e-6);
            assert!((p[1].abs() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_wide_rows_match_narrow_rows() {
        // Same geometry padded with constant features: the Gram
        // path must agree with the covariance path
        let narrow: Vec<Vec<f32>> = vec![
            vec![2.0, 0.0],
            vec![-2.0, 0.5],
            vec![0.0, -1.0],
            vec![1.0, 3.0],
        ];
        let wide: Vec<Vec<f32>> = narrow
            .iter()
            .map(|r| r.iter().copied().chain(std::iter::repeat(7.0).take(10)).collect())
            .collect();

        let a = pca(&narrow, 2);
        let b = pca(&wide, 2);
        for (x, y) in a.iter().flatten().zip(b.iter().flatten()) {
            assert!((x - y).abs() < 1e-6, "{a:?} vs {b:?}");
        }
    }

    #[test]
    fn test_component_count_is_capped() {
        let rows: Vec<Vec<f32>> = (0..3).map(|i| vec![i as f32; 5]).collect();
        let scores = pca(&rows, 10);
        assert_eq!(scores.len(), 3);
        assert!(scores.iter().all(|s| s.len() == 3));
    }

    #[test]
    fn test_empty_input() {
        assert!(pca_2d(&[]).is_empty());
    }

    #[test]
    fn test_encode_scenes_keeps_labels_and_images() {
        let device = Default::default();
        let shape = SceneShape { tile_size: 20, n_bands: 2, n_labels: 3 };
        let encoder = EncoderConfig::new(2).with_width(2).init::<NdArray>(&device);
        let batcher = SceneBatcher::<NdArray>::new(shape);

        let scene = |i: usize| {
            let pixels = (0..shape.pixel_count()).map(|p| ((p * (i + 1)) as f32 * 0.01).sin()).collect();
            Scene::new(pixels, i % 3)
        };
        let batches = vec![
            batcher.batch((0..3).map(scene).collect(), &device),
            batcher.batch((3..6).map(scene).collect(), &device),
        ];

        let encoded = encode_scenes(&encoder, batches, "conv5_block3_out", 16).unwrap();
        assert_eq!(encoded.labels, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(encoded.rows.len(), 6);
        assert_eq!(encoded.images.tile_size, 20);
        assert_eq!(encoded.images.pixels.len(), 6 * shape.pixel_count());

        let points = pca_2d(&encoded.rows);
        assert_eq!(points.len(), 6);
        assert!(points.iter().all(|p| p[0].is_finite() && p[1].is_finite()));
    }

    #[test]
    fn test_quantise_range() {
        assert_eq!(quantise(-1.0), 0);
        assert_eq!(quantise(0.0), 128);
        assert_eq!(quantise(1.0), 255);
    }
}

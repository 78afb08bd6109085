// ============================================================
// Layer 5 — t-SNE Embedding
// ============================================================
// Exact t-SNE (van der Maaten & Hinton, 2008) to two dimensions.
//
//   X [N, d] ─► squared distances ─► conditional P, one Gaussian
//                                    per point, width found by
//                                    bisection to the perplexity
//            ─► symmetric joint P
//            ─► gradient descent on KL(P ‖ Q), Student-t Q
//
// Optimisation follows the usual recipe: P is exaggerated ×12
// with momentum 0.5 for the first 250 iterations, then momentum
// 0.8; per-coordinate gains adapt the step; the learning rate is
// max(N / 12 / 4, 50). The start layout is the 2-D PCA of X,
// scaled to a standard deviation of 1e-4, so runs are
// deterministic.
//
// Every pair of points is visited on every iteration: memory and
// time grow as N². Suited to the few thousand scenes the
// projection experiment encodes.

use anyhow::{ensure, Result};

const EXAGGERATION: f64 = 12.0;
const EXPLORATION_ITERATIONS: usize = 250;
const INITIAL_MOMENTUM: f64 = 0.5;
const FINAL_MOMENTUM: f64 = 0.8;
const MIN_GAIN: f64 = 0.01;
const MIN_GRAD_NORM: f64 = 1e-7;
const BISECTION_STEPS: usize = 100;
const ENTROPY_TOLERANCE: f64 = 1e-5;
const FLOOR: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TsneConfig {
    /// Effective number of neighbours of every point
    pub perplexity: f64,
    /// Total gradient steps, exploration phase included
    pub iterations: usize,
}

/// A finished embedding and its final KL divergence
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub points:        Vec<[f64; 2]>,
    pub kl_divergence: f64,
}

fn squared_distances(x: &[Vec<f64>]) -> Vec<f64> {
    let n = x.len();
    let mut d = vec![0.0; n * n];
    for i in 0..n {
        for j in i + 1..n {
            let dist: f64 = x[i].iter().zip(&x[j]).map(|(a, b)| (a - b) * (a - b)).sum();
            d[i * n + j] = dist;
            d[j * n + i] = dist;
        }
    }
    d
}

/// Row-normalised conditional probabilities p(j | i), each row at
/// the requested perplexity.
fn conditional_probabilities(distances: &[f64], n: usize, perplexity: f64) -> Vec<f64> {
    let target = perplexity.ln();
    let mut p = vec![0.0; n * n];

    for i in 0..n {
        let row = &distances[i * n..(i + 1) * n];
        let (mut beta, mut lo, mut hi) = (1.0f64, f64::NEG_INFINITY, f64::INFINITY);

        for _ in 0..BISECTION_STEPS {
            let mut sum = 0.0;
            let mut weighted = 0.0;
            for j in (0..n).filter(|&j| j != i) {
                let pj = (-row[j] * beta).exp();
                p[i * n + j] = pj;
                sum += pj;
                weighted += row[j] * pj;
            }
            let sum = sum.max(1e-8);
            let entropy = sum.ln() + beta * weighted / sum;
            for j in 0..n {
                p[i * n + j] /= sum;
            }

            let gap = entropy - target;
            if gap.abs() <= ENTROPY_TOLERANCE {
                break;
            }
            if gap > 0.0 {
                lo = beta;
                beta = if hi.is_infinite() { beta * 2.0 } else { (beta + hi) / 2.0 };
            } else {
                hi = beta;
                beta = if lo.is_infinite() { beta / 2.0 } else { (beta + lo) / 2.0 };
            }
        }
    }
    p
}

/// Joint probabilities p_ij = (p(j|i) + p(i|j)) / 2N
fn joint_probabilities(x: &[Vec<f64>], perplexity: f64) -> Vec<f64> {
    let n = x.len();
    let conditional = conditional_probabilities(&squared_distances(x), n, perplexity);

    let mut joint = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..n {
            joint[i * n + j] = conditional[i * n + j] + conditional[j * n + i];
        }
    }
    let total: f64 = joint.iter().sum::<f64>().max(f64::MIN_POSITIVE);
    joint.iter_mut().for_each(|p| *p = (*p / total).max(FLOOR));
    for i in 0..n {
        joint[i * n + i] = 0.0;
    }
    joint
}

/// KL divergence and its gradient at `y`, with P scaled by `exaggeration`
fn kl_gradient(p: &[f64], y: &[[f64; 2]], exaggeration: f64, grad: &mut [[f64; 2]]) -> f64 {
    let n = y.len();
    let mut num = vec![0.0; n * n];
    let mut total = 0.0;
    for i in 0..n {
        for j in i + 1..n {
            let dx = y[i][0] - y[j][0];
            let dy = y[i][1] - y[j][1];
            let t = 1.0 / (1.0 + dx * dx + dy * dy);
            num[i * n + j] = t;
            num[j * n + i] = t;
            total += 2.0 * t;
        }
    }
    let total = total.max(f64::MIN_POSITIVE);

    let mut kl = 0.0;
    for (i, g) in grad.iter_mut().enumerate() {
        *g = [0.0, 0.0];
        for j in (0..n).filter(|&j| j != i) {
            let pij = p[i * n + j] * exaggeration;
            let qij = (num[i * n + j] / total).max(FLOOR);
            kl += pij * (pij / qij).ln();

            let w = (pij - qij) * num[i * n + j];
            g[0] += 4.0 * w * (y[i][0] - y[j][0]);
            g[1] += 4.0 * w * (y[i][1] - y[j][1]);
        }
    }
    kl
}

/// Start layout: two principal components, scaled to std 1e-4
fn initial_layout(pcs: &[[f64; 2]]) -> Vec<[f64; 2]> {
    let n = pcs.len() as f64;
    let mean = pcs.iter().map(|p| p[0]).sum::<f64>() / n;
    let std = (pcs.iter().map(|p| (p[0] - mean).powi(2)).sum::<f64>() / n).sqrt();

    if std > 0.0 {
        let scale = 1e-4 / std;
        pcs.iter().map(|p| [p[0] * scale, p[1] * scale]).collect()
    } else {
        // Every point identical: spread them on a tiny circle
        (0..pcs.len())
            .map(|i| {
                let a = i as f64 * std::f64::consts::TAU / n;
                [1e-4 * a.cos(), 1e-4 * a.sin()]
            })
            .collect()
    }
}

/// Embed `x` in two dimensions. `start` is the 2-D PCA of `x`.
pub fn tsne_2d(x: &[Vec<f64>], start: &[[f64; 2]], config: &TsneConfig) -> Result<Embedding> {
    let n = x.len();
    ensure!(n >= 2, "t-SNE needs at least two points, got {n}");
    ensure!(start.len() == n, "start layout has {} points, expected {n}", start.len());
    ensure!(
        config.perplexity > 0.0 && config.perplexity < n as f64,
        "perplexity must lie in (0, {n}) for {n} points, got {}",
        config.perplexity
    );

    let p = joint_probabilities(x, config.perplexity);
    let learning_rate = (n as f64 / EXAGGERATION / 4.0).max(50.0);

    let mut y = initial_layout(start);
    let mut update = vec![[0.0f64; 2]; n];
    let mut gains = vec![[1.0f64; 2]; n];
    let mut grad = vec![[0.0f64; 2]; n];
    let mut kl = 0.0;

    for it in 0..config.iterations {
        let exploring = it < EXPLORATION_ITERATIONS;
        let (exaggeration, momentum) = if exploring {
            (EXAGGERATION, INITIAL_MOMENTUM)
        } else {
            (1.0, FINAL_MOMENTUM)
        };

        kl = kl_gradient(&p, &y, exaggeration, &mut grad);

        let mut norm = 0.0;
        for i in 0..n {
            for c in 0..2 {
                let g = grad[i][c];
                norm += g * g;
                gains[i][c] = if update[i][c] * g < 0.0 { gains[i][c] + 0.2 } else { gains[i][c] * 0.8 };
                gains[i][c] = gains[i][c].max(MIN_GAIN);
                update[i][c] = momentum * update[i][c] - learning_rate * gains[i][c] * g;
                y[i][c] += update[i][c];
            }
        }

        if (it + 1) % 250 == 0 {
            tracing::debug!("t-SNE iteration {}: KL divergence {kl:.4}", it + 1);
        }
        if !exploring && norm.sqrt() < MIN_GRAD_NORM {
            tracing::debug!("t-SNE converged after {} iterations", it + 1);
            break;
        }
    }

    Ok(Embedding { points: y, kl_divergence: kl })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::projector::pca_2d;

    fn two_clusters() -> Vec<Vec<f64>> {
        (0..20)
            .map(|i| {
                let centre = if i < 10 { 0.0 } else { 20.0 };
                (0..5).map(|d| centre + ((i * 7 + d * 3) % 11) as f64 * 0.1).collect()
            })
            .collect()
    }

    fn start(x: &[Vec<f64>]) -> Vec<[f64; 2]> {
        let rows: Vec<Vec<f32>> = x.iter().map(|r| r.iter().map(|&v| v as f32).collect()).collect();
        pca_2d(&rows)
    }

    fn dist(a: [f64; 2], b: [f64; 2]) -> f64 {
        ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
    }

    #[test]
    fn test_conditional_rows_hit_the_perplexity() {
        let x = two_clusters();
        let n = x.len();
        let p = conditional_probabilities(&squared_distances(&x), n, 5.0);
        for i in 0..n {
            let row = &p[i * n..(i + 1) * n];
            assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-9);
            assert_eq!(row[i], 0.0);
            let entropy: f64 = row.iter().filter(|&&v| v > 0.0).map(|v| -v * v.ln()).sum();
            assert!((entropy.exp() - 5.0).abs() < 1e-2, "row {i}: perplexity {}", entropy.exp());
        }
    }

    #[test]
    fn test_clusters_stay_apart() {
        let x = two_clusters();
        let config = TsneConfig { perplexity: 4.0, iterations: 400 };
        let embedding = tsne_2d(&x, &start(&x), &config).unwrap();
        let y = &embedding.points;

        let mut within: f64 = 0.0;
        let mut between = f64::INFINITY;
        for i in 0..20 {
            for j in i + 1..20 {
                let d = dist(y[i], y[j]);
                if (i < 10) == (j < 10) {
                    within = within.max(d);
                } else {
                    between = between.min(d);
                }
            }
        }
        assert!(within < between, "within {within}, between {between}");
        assert!(embedding.kl_divergence.is_finite());
    }

    #[test]
    fn test_same_input_same_embedding() {
        let x = two_clusters();
        let config = TsneConfig { perplexity: 3.0, iterations: 300 };
        let a = tsne_2d(&x, &start(&x), &config).unwrap();
        let b = tsne_2d(&x, &start(&x), &config).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_perplexity_must_be_below_point_count() {
        let x = two_clusters();
        let config = TsneConfig { perplexity: 20.0, iterations: 10 };
        assert!(tsne_2d(&x, &start(&x), &config).is_err());
        assert!(tsne_2d(&x[..1], &start(&x[..1]), &config).is_err());
    }
}

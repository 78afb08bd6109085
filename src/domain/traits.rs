// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// The training loop reaches the scene source and the summary
// destination only through these traits:
//
//   - TileDirLoader and SyntheticScenes implement SceneSource
//   - SummaryWriter implements SummarySink (files on disk);
//     tests can substitute an in-memory sink
//
// Reference: Rust Book §10 (Traits: Defining Shared Behaviour)

use anyhow::Result;

use crate::data::dataset::SceneDataset;

// ─── SceneSource ──────────────────────────────────────────────────────────────
/// Any component that can produce a dataset of scenes.
pub trait SceneSource {
    /// Load every available scene from this source.
    fn load_all(&self) -> Result<SceneDataset>;
}

// ─── SummarySink ──────────────────────────────────────────────────────────────
/// Basic statistics of a batch of values, recorded as one histogram row
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSummary {
    pub count:   usize,
    pub min:     f64,
    pub max:     f64,
    pub mean:    f64,
    pub std_dev: f64,
    /// Equal-width bucket counts spanning [min, max]
    pub buckets: Vec<usize>,
}

impl HistogramSummary {
    /// Summarise `values` into `n_buckets` equal-width buckets.
    /// An empty slice gives an all-zero summary.
    pub fn from_values(values: &[f32], n_buckets: usize) -> Self {
        let n_buckets = n_buckets.max(1);
        if values.is_empty() {
            return Self {
                count: 0, min: 0.0, max: 0.0, mean: 0.0, std_dev: 0.0,
                buckets: vec![0; n_buckets],
            };
        }

        let count = values.len();
        let (mut min, mut max, mut sum) = (f64::INFINITY, f64::NEG_INFINITY, 0.0f64);
        for &v in values {
            let v = v as f64;
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        let mean = sum / count as f64;
        let var = values
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / count as f64;

        let mut buckets = vec![0usize; n_buckets];
        let width = (max - min) / n_buckets as f64;
        for &v in values {
            let idx = if width > 0.0 {
                (((v as f64 - min) / width) as usize).min(n_buckets - 1)
            } else {
                0
            };
            buckets[idx] += 1;
        }

        Self { count, min, max, mean, std_dev: var.sqrt(), buckets }
    }
}

/// An 8-bit image handed to the summary sink
#[derive(Debug, Clone, PartialEq)]
pub enum SummaryImage {
    /// Row-major RGB triples
    Rgb { width: u32, height: u32, data: Vec<u8> },
    /// Row-major single-channel intensities
    Gray { width: u32, height: u32, data: Vec<u8> },
}

/// Destination for step-tagged training summaries.
pub trait SummarySink {
    fn write_scalar(&mut self, step: i64, tag: &str, value: f64) -> Result<()>;

    fn write_histogram(&mut self, step: i64, tag: &str, histogram: &HistogramSummary) -> Result<()>;

    fn write_image(&mut self, step: i64, tag: &str, image: &SummaryImage) -> Result<()>;

    /// Make everything written so far durable
    fn flush(&mut self) -> Result<()>;
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_statistics() {
        let h = HistogramSummary::from_values(&[0.0, 1.0, 2.0, 3.0], 2);
        assert_eq!(h.count, 4);
        assert_eq!(h.min, 0.0);
        assert_eq!(h.max, 3.0);
        assert!((h.mean - 1.5).abs() < 1e-12);
        assert_eq!(h.buckets, vec![2, 2]);
    }

    #[test]
    fn test_histogram_of_constant_values() {
        let h = HistogramSummary::from_values(&[4.0; 5], 3);
        assert_eq!(h.buckets, vec![5, 0, 0]);
        assert_eq!(h.std_dev, 0.0);
    }

    #[test]
    fn test_histogram_of_nothing() {
        let h = HistogramSummary::from_values(&[], 4);
        assert_eq!(h.count, 0);
        assert_eq!(h.buckets, vec![0; 4]);
    }
}

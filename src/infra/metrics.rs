// ============================================================
// Layer 6 — Summary Metrics and Writer
// ============================================================
// Two halves:
//
//   SummaryAccumulator  running means of the step outcomes since
//                       the last flush; flushing writes them to a
//                       sink and starts over
//   SummaryWriter       the on-disk SummarySink
//
// Files written under <out_dir>/summaries/:
//
//   scalars.csv      step,tag,value
//   histograms.csv   step,tag,count,min,max,mean,std_dev,buckets
//                    (buckets separated by ';')
//   images/step_<n>/<tag>.png
//
// Example scalars.csv:
//   step,tag,value
//   100,loss,5.127734
//   100,conv5_block3_out/loss,5.127734
//   100,conv5_block3_out/accuracy,0.125000
//   100,learning_rate,0.000100
//
// The CSV files are appended to, so a resumed run continues the
// same curves. Headers are written only when a file is created.
//
// Reference: Rust Book §12 (I/O and File Handling)

use anyhow::{Context, Result};
use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::domain::traits::{HistogramSummary, SummaryImage, SummarySink};
use crate::ml::step::StepOutcome;

// ─── Accumulation ─────────────────────────────────────────────────────────────

/// Running mean of a scalar
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeanMetric {
    sum:   f64,
    count: usize,
}

impl MeanMetric {
    pub fn update(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    /// Mean of every update since the last reset, None if there were none
    pub fn result(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone)]
struct LayerMeans {
    layer:    String,
    loss:     MeanMetric,
    accuracy: MeanMetric,
}

/// Averages step outcomes between two summary steps.
#[derive(Debug, Clone)]
pub struct SummaryAccumulator {
    loss:   MeanMetric,
    layers: Vec<LayerMeans>,
}

impl SummaryAccumulator {
    pub fn new<'a>(layers: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            loss:   MeanMetric::default(),
            layers: layers
                .into_iter()
                .map(|layer| LayerMeans {
                    layer:    layer.to_string(),
                    loss:     MeanMetric::default(),
                    accuracy: MeanMetric::default(),
                })
                .collect(),
        }
    }

    pub fn update(&mut self, outcome: &StepOutcome) {
        self.loss.update(outcome.loss);
        for metrics in &outcome.layers {
            if let Some(means) = self.layers.iter_mut().find(|m| m.layer == metrics.layer) {
                means.loss.update(metrics.loss);
                means.accuracy.update(metrics.accuracy);
            }
        }
    }

    pub fn mean_loss(&self) -> Option<f64> {
        self.loss.result()
    }

    /// Write every mean plus the `extra` scalars, then reset.
    pub fn flush(&mut self, sink: &mut dyn SummarySink, step: i64, extra: &[(&str, f64)]) -> Result<()> {
        if let Some(loss) = self.loss.result() {
            sink.write_scalar(step, "loss", loss)?;
        }
        for means in &self.layers {
            if let Some(loss) = means.loss.result() {
                sink.write_scalar(step, &format!("{}/loss", means.layer), loss)?;
            }
            if let Some(accuracy) = means.accuracy.result() {
                sink.write_scalar(step, &format!("{}/accuracy", means.layer), accuracy)?;
            }
        }
        for (tag, value) in extra {
            sink.write_scalar(step, tag, *value)?;
        }
        sink.flush()?;

        self.loss.reset();
        for means in &mut self.layers {
            means.loss.reset();
            means.accuracy.reset();
        }
        Ok(())
    }
}

// ─── Writer ───────────────────────────────────────────────────────────────────

/// Writes summaries as CSV rows and PNG files.
pub struct SummaryWriter {
    dir:        PathBuf,
    scalars:    BufWriter<File>,
    histograms: BufWriter<File>,
}

impl SummaryWriter {
    /// Open (or continue) the summaries under `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create summary directory '{}'", dir.display()))?;

        let scalars = open_csv(&dir.join("scalars.csv"), "step,tag,value")?;
        let histograms = open_csv(
            &dir.join("histograms.csv"),
            "step,tag,count,min,max,mean,std_dev,buckets",
        )?;

        Ok(Self { dir, scalars, histograms })
    }

}

fn open_csv(path: &Path, header: &str) -> Result<BufWriter<File>> {
    let is_new = !path.exists();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Cannot open '{}'", path.display()))?;

    let mut writer = BufWriter::new(file);
    if is_new {
        writeln!(writer, "{header}")?;
        tracing::debug!("Created summary file '{}'", path.display());
    }
    Ok(writer)
}

/// Tags contain '/', which must not create directories
fn file_safe(tag: &str) -> String {
    tag.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

impl SummarySink for SummaryWriter {
    fn write_scalar(&mut self, step: i64, tag: &str, value: f64) -> Result<()> {
        writeln!(self.scalars, "{step},{tag},{value:.6}")?;
        Ok(())
    }

    fn write_histogram(&mut self, step: i64, tag: &str, h: &HistogramSummary) -> Result<()> {
        let buckets: Vec<String> = h.buckets.iter().map(|b| b.to_string()).collect();
        writeln!(
            self.histograms,
            "{step},{tag},{},{:.6},{:.6},{:.6},{:.6},{}",
            h.count,
            h.min,
            h.max,
            h.mean,
            h.std_dev,
            buckets.join(";"),
        )?;
        Ok(())
    }

    fn write_image(&mut self, step: i64, tag: &str, image: &SummaryImage) -> Result<()> {
        let dir = self.dir.join("images").join(format!("step_{step}"));
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.png", file_safe(tag)));

        let saved = match image {
            SummaryImage::Rgb { width, height, data } => {
                image::RgbImage::from_raw(*width, *height, data.clone()).map(|img| img.save(&path))
            }
            SummaryImage::Gray { width, height, data } => {
                image::GrayImage::from_raw(*width, *height, data.clone()).map(|img| img.save(&path))
            }
        };

        match saved {
            Some(result) => {
                result.with_context(|| format!("Cannot write image '{}'", path.display()))?;
            }
            None => anyhow::bail!("Image '{tag}' has the wrong number of pixels"),
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.scalars.flush()?;
        self.histograms.flush()?;
        Ok(())
    }
}

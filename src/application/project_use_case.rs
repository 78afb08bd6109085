// ============================================================
// Layer 2 — ProjectUseCase
// ============================================================
// Projects learned representations of a finished (or running)
// training run to 2-D:
//
//   Step 1: Reuse the encoded scenes cached in the output
//           directory, if any. Otherwise:
//             read train_config.json from the run directory,
//             rebuild the encoder and load checkpoint weights,
//             load the scenes the run trained on,
//             encode n_points scenes and cache them
//   Step 2: PCA of one layer to 2-D → projection_<layer>.csv
//   Step 3: optional PCA pre-reduction, then t-SNE
//           → projection_tsne_<layer>.csv
//
// n_points is rounded down to a whole number of batches, and
// capped at the size of the dataset. A cached encoding is used
// whatever n_points asks for; --reencode replaces it.

use anyhow::{ensure, Context, Result};
use burn::{
    backend::{wgpu::WgpuDevice, NdArray, Wgpu},
    data::dataset::{transform::PartialDataset, Dataset},
    prelude::*,
};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::application::train_use_case::BackendKind;
use crate::data::stream::SceneLoader;
use crate::domain::{
    error::ConfigError,
    layers::{is_representation_layer, REPRESENTATION_LAYERS},
    scene::Scene,
};
use crate::infra::{checkpoint::CheckpointStore, encoding_cache::EncodingCache};
use crate::ml::{
    projector::{encode_scenes, pca, pca_2d, EncodedScenes},
    tsne::{tsne_2d, TsneConfig},
};

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectConfig {
    /// Output directory of the training run
    pub run_dir:    PathBuf,
    /// Checkpoint directory to load; the latest one when None
    pub checkpoint: Option<PathBuf>,
    pub layer:      String,
    pub n_points:   usize,
    /// Defaults to the batch size of the run
    pub batch_size: Option<usize>,
    /// Where the CSVs and the cache go; the run directory when None
    pub out_dir:    Option<PathBuf>,
    /// Encode again even when the output directory has a cache
    pub reencode:   bool,

    pub perplexity:          f64,
    pub tsne_iterations:     usize,
    /// Principal components kept before t-SNE; None runs t-SNE on
    /// the raw representations
    pub pca_preprocess_dims: Option<usize>,

    pub backend: BackendKind,
}

/// Paths of the written projections
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionFiles {
    pub pca:  PathBuf,
    pub tsne: PathBuf,
}

pub struct ProjectUseCase {
    config: ProjectConfig,
}

impl ProjectUseCase {
    pub fn new(config: ProjectConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> Result<ProjectionFiles> {
        let cfg = &self.config;
        if !is_representation_layer(&cfg.layer) {
            return Err(ConfigError::UnknownLayer {
                name:  cfg.layer.clone(),
                known: REPRESENTATION_LAYERS.join(", "),
            }
            .into());
        }
        if cfg.n_points == 0 {
            return Err(ConfigError::NotPositive("n_points").into());
        }
        if !(cfg.perplexity > 0.0) {
            return Err(ConfigError::NotPositive("perplexity").into());
        }
        if cfg.tsne_iterations == 0 {
            return Err(ConfigError::NotPositive("tsne_iterations").into());
        }
        if cfg.pca_preprocess_dims == Some(0) {
            return Err(ConfigError::NotPositive("pca_preprocess_dims").into());
        }

        let out_dir = cfg.out_dir.as_deref().unwrap_or(&cfg.run_dir);
        std::fs::create_dir_all(out_dir)
            .with_context(|| format!("Cannot create '{}'", out_dir.display()))?;

        // ── Step 1: Encoded scenes ────────────────────────────────────────────
        let cache = EncodingCache::new(out_dir, &cfg.layer);
        let cached = if cfg.reencode { None } else { cache.load()? };
        let encoded = match cached {
            Some(encoded) => {
                tracing::info!("Reusing {} encoded scenes from '{}'", encoded.labels.len(), out_dir.display());
                encoded
            }
            None => {
                let encoded = match cfg.backend {
                    BackendKind::Wgpu => encode::<Wgpu>(cfg, WgpuDevice::default())?,
                    BackendKind::NdArray => encode::<NdArray>(cfg, Default::default())?,
                };
                cache.save(&encoded)?;
                encoded
            }
        };

        // ── Step 2: PCA ───────────────────────────────────────────────────────
        let pcs = pca_2d(&encoded.rows);
        let pca_path = out_dir.join(format!("projection_{}.csv", cfg.layer));
        write_points(&pca_path, ["pc1", "pc2"], &encoded.labels, &pcs)?;
        tracing::info!("Wrote {} PCA points to '{}'", pcs.len(), pca_path.display());

        // ── Step 3: t-SNE ─────────────────────────────────────────────────────
        let inputs: Vec<Vec<f64>> = match cfg.pca_preprocess_dims {
            Some(dims) => {
                tracing::info!("Reducing to {dims} principal components before t-SNE");
                pca(&encoded.rows, dims)
            }
            None => encoded
                .rows
                .iter()
                .map(|r| r.iter().map(|&v| v as f64).collect())
                .collect(),
        };
        let tsne_config = TsneConfig { perplexity: cfg.perplexity, iterations: cfg.tsne_iterations };
        let embedding = tsne_2d(&inputs, &pcs, &tsne_config)?;
        tracing::info!("t-SNE finished with KL divergence {:.4}", embedding.kl_divergence);

        let tsne_path = out_dir.join(format!("projection_tsne_{}.csv", cfg.layer));
        write_points(&tsne_path, ["x", "y"], &encoded.labels, &embedding.points)?;
        tracing::info!("Wrote {} t-SNE points to '{}'", embedding.points.len(), tsne_path.display());

        Ok(ProjectionFiles { pca: pca_path, tsne: tsne_path })
    }
}

fn encode<B: Backend>(cfg: &ProjectConfig, device: B::Device) -> Result<EncodedScenes> {
    // ── Run configuration ─────────────────────────────────────────────────────
    let store = CheckpointStore::open(&cfg.run_dir);
    let train_cfg = store.load_config()?;

    // ── Encoder ───────────────────────────────────────────────────────────────
    let checkpoint = store.checkpoint_or_latest(cfg.checkpoint.as_deref())?;
    let encoder = train_cfg.encoder_config().init::<B>(&device);
    let encoder = CheckpointStore::load_encoder(&checkpoint, encoder, &device)?;
    tracing::info!("Loaded encoder from '{}'", checkpoint.display());

    // ── Scenes ────────────────────────────────────────────────────────────────
    let dataset = train_cfg.load_scenes()?;
    let shape = dataset.shape();
    let batch_size = cfg.batch_size.unwrap_or(train_cfg.batch_size).max(1);
    let n_scenes = cfg.n_points.min(dataset.len());
    ensure!(
        n_scenes >= batch_size,
        "Need at least one batch of {batch_size} scenes, have {} (n_points = {})",
        dataset.len(),
        cfg.n_points
    );

    let first = PartialDataset::<_, Scene>::new(dataset, 0, n_scenes);
    let loader = SceneLoader::<B>::new(first, shape, batch_size, None, &device);
    encode_scenes(&encoder, loader.pass(), &cfg.layer, train_cfg.model_tilesize)
}

/// Writes `index,label,<x>,<y>`, one row per scene
fn write_points(path: &Path, columns: [&str; 2], labels: &[usize], points: &[[f64; 2]]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Cannot create '{}'", path.display()))?;
    let mut w = BufWriter::new(file);

    writeln!(w, "index,label,{},{}", columns[0], columns[1])?;
    for (i, (label, p)) in labels.iter().zip(points).enumerate() {
        writeln!(w, "{i},{label},{:.6},{:.6}", p[0], p[1])?;
    }
    w.flush()?;
    Ok(())
}

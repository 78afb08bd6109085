// ============================================================
// Layer 4 — Tile Directory Loader
// ============================================================
// Loads pre-tiled imagery from a class-per-directory layout:
//
//   root/
//     forest/
//       tile_0001.f32
//       tile_0002.f32
//     water/
//       tile_0003.f32
//
// Each .f32 file holds tile × tile × bands little-endian f32
// values in HWC order, already normalised to [-1, 1]. Class
// indices follow the sorted directory names, so the same tree
// always gives the same labels. Files directly under the root
// are accepted too and all get label 0.
//
// A file with the wrong size is skipped with a warning.

use anyhow::{bail, Context, Result};
use std::{fs, path::{Path, PathBuf}};

use crate::data::dataset::SceneDataset;
use crate::domain::scene::{Scene, SceneShape};
use crate::domain::traits::SceneSource;

const TILE_EXTENSION: &str = "f32";

/// Loads every `.f32` tile under a directory.
pub struct TileDirLoader {
    dir:       PathBuf,
    tile_size: usize,
    n_bands:   usize,
}

impl TileDirLoader {
    pub fn new(dir: impl Into<PathBuf>, tile_size: usize, n_bands: usize) -> Self {
        Self { dir: dir.into(), tile_size, n_bands }
    }

    /// Sorted class directories, or the root alone when it has none
    fn class_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs: Vec<PathBuf> = fs::read_dir(&self.dir)
            .with_context(|| format!("Cannot read directory '{}'", self.dir.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        if dirs.is_empty() {
            dirs.push(self.dir.clone());
        }
        Ok(dirs)
    }
}

impl SceneSource for TileDirLoader {
    fn load_all(&self) -> Result<SceneDataset> {
        if !self.dir.exists() {
            bail!("Data directory '{}' does not exist", self.dir.display());
        }

        let classes = self.class_dirs()?;
        let expected = self.tile_size * self.tile_size * self.n_bands;
        let mut scenes = Vec::new();

        for (label, class_dir) in classes.iter().enumerate() {
            let mut files: Vec<PathBuf> = fs::read_dir(class_dir)
                .with_context(|| format!("Cannot read directory '{}'", class_dir.display()))?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(TILE_EXTENSION))
                .collect();
            files.sort();

            for path in files {
                match read_tile(&path, expected) {
                    Ok(pixels) => scenes.push(Scene::new(pixels, label)),
                    Err(e) => tracing::warn!("Skipping '{}': {}", path.display(), e),
                }
            }
        }

        if scenes.is_empty() {
            bail!("No usable .{TILE_EXTENSION} tiles found under '{}'", self.dir.display());
        }

        tracing::info!(
            "Loaded {} tiles in {} classes from '{}'",
            scenes.len(),
            classes.len(),
            self.dir.display()
        );

        let shape = SceneShape {
            tile_size: self.tile_size,
            n_bands:   self.n_bands,
            n_labels:  classes.len(),
        };
        SceneDataset::new(shape, scenes)
    }
}

/// Read one raw tile and check its length
fn read_tile(path: &Path, expected: usize) -> Result<Vec<f32>> {
    let bytes = fs::read(path).with_context(|| format!("Cannot read '{}'", path.display()))?;

    if bytes.len() != expected * 4 {
        bail!("expected {} bytes ({expected} f32 values), found {}", expected * 4, bytes.len());
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

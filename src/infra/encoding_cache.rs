// ============================================================
// Layer 6 — Encoding Cache
// ============================================================
// Keeps the encoded scenes of the projection experiment next to
// its outputs, so projections can be redone (other perplexity,
// other PCA dimensions) without loading a checkpoint or running
// the encoder again:
//
//   out_dir/
//     scenes.json                   ← labels, image shape, feature
//                                     count of every cached layer
//     images.u8                     ← N × tile × tile × bands bytes
//     representations_<layer>.f32   ← N × features little-endian f32
//
// Labels and images are shared by every layer. Caching other
// scenes forgets the layers cached for the previous ones; a
// layer missing from scenes.json, or whose file has the wrong
// length, is treated as not cached. Each file is written to a
// .tmp sibling and renamed.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use crate::ml::projector::{EncodedScenes, SceneImages};

const SCENES_FILE: &str = "scenes.json";
const IMAGES_FILE: &str = "images.u8";

#[derive(Debug, Serialize, Deserialize)]
struct SceneIndex {
    tile_size: usize,
    n_bands:   usize,
    labels:    Vec<usize>,
    /// Features per scene, by layer
    features:  BTreeMap<String, usize>,
}

/// Encoded scenes of one layer, stored in an output directory.
pub struct EncodingCache {
    dir:   PathBuf,
    layer: String,
}

impl EncodingCache {
    pub fn new(dir: impl Into<PathBuf>, layer: &str) -> Self {
        Self { dir: dir.into(), layer: layer.to_string() }
    }

    fn representations_path(&self) -> PathBuf {
        self.dir.join(format!("representations_{}.f32", self.layer))
    }

    fn read_index(&self) -> Result<Option<SceneIndex>> {
        let path = self.dir.join(SCENES_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read '{}'", path.display()))?;
        let index = serde_json::from_str(&text)
            .with_context(|| format!("Cannot parse '{}'", path.display()))?;
        Ok(Some(index))
    }

    /// The cached scenes, or None when nothing usable is stored.
    pub fn load(&self) -> Result<Option<EncodedScenes>> {
        let Some(index) = self.read_index()? else {
            return Ok(None);
        };
        let reps_path = self.representations_path();
        let (Some(&width), true) = (index.features.get(&self.layer), reps_path.exists()) else {
            return Ok(None);
        };
        let n = index.labels.len();

        let values = read_f32(&reps_path)?;
        if width == 0 || values.len() != n * width {
            tracing::warn!(
                "Ignoring '{}': expected {n} × {width} values, found {}",
                reps_path.display(),
                values.len()
            );
            return Ok(None);
        }

        let pixels = fs::read(self.dir.join(IMAGES_FILE))
            .with_context(|| format!("Cannot read '{}'", self.dir.join(IMAGES_FILE).display()))?;
        if pixels.len() != n * index.tile_size * index.tile_size * index.n_bands {
            tracing::warn!("Ignoring cached scenes: {IMAGES_FILE} does not hold {n} images");
            return Ok(None);
        }

        Ok(Some(EncodedScenes {
            labels: index.labels,
            rows:   values.chunks_exact(width).map(<[f32]>::to_vec).collect(),
            images: SceneImages { tile_size: index.tile_size, n_bands: index.n_bands, pixels },
        }))
    }

    /// Store `encoded`, replacing labels and images of any other layer.
    pub fn save(&self, encoded: &EncodedScenes) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Cannot create '{}'", self.dir.display()))?;

        let mut index = SceneIndex {
            tile_size: encoded.images.tile_size,
            n_bands:   encoded.images.n_bands,
            labels:    encoded.labels.clone(),
            features:  BTreeMap::new(),
        };
        if let Some(previous) = self.read_index()? {
            let same_scenes = previous.labels == index.labels
                && previous.tile_size == index.tile_size
                && previous.n_bands == index.n_bands;
            if same_scenes {
                index.features = previous.features;
            }
        }
        index.features.insert(self.layer.clone(), encoded.rows.first().map_or(0, Vec::len));

        let values: Vec<u8> = encoded.rows.iter().flatten().flat_map(|v| v.to_le_bytes()).collect();

        write_atomic(&self.representations_path(), &values)?;
        write_atomic(&self.dir.join(IMAGES_FILE), &encoded.images.pixels)?;
        // Written last: its presence marks a complete set
        write_atomic(&self.dir.join(SCENES_FILE), serde_json::to_string(&index)?.as_bytes())?;

        tracing::info!("Cached {} encoded scenes in '{}'", encoded.labels.len(), self.dir.display());
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).with_context(|| format!("Cannot write '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Cannot move '{}' into place", path.display()))
}

fn read_f32(path: &Path) -> Result<Vec<f32>> {
    let bytes = fs::read(path).with_context(|| format!("Cannot read '{}'", path.display()))?;
    if bytes.len() % 4 != 0 {
        bail!("'{}' is not a whole number of f32 values", path.display());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(n: usize, width: usize) -> EncodedScenes {
        EncodedScenes {
            labels: (0..n).map(|i| i % 2).collect(),
            rows:   (0..n).map(|i| (0..width).map(|j| (i * width + j) as f32 * 0.5).collect()).collect(),
            images: SceneImages { tile_size: 2, n_bands: 3, pixels: (0..n * 12).map(|v| v as u8).collect() },
        }
    }

    #[test]
    fn test_saved_scenes_are_reloaded() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = EncodingCache::new(tmp.path(), "conv5_block3_out");
        assert!(cache.load().unwrap().is_none());

        let scenes = encoded(4, 3);
        cache.save(&scenes).unwrap();
        assert_eq!(cache.load().unwrap(), Some(scenes));
        assert!(tmp.path().join("representations_conv5_block3_out.f32").exists());
    }

    #[test]
    fn test_other_layer_is_a_miss() {
        let tmp = tempfile::tempdir().unwrap();
        EncodingCache::new(tmp.path(), "conv5_block3_out").save(&encoded(4, 3)).unwrap();
        assert!(EncodingCache::new(tmp.path(), "conv1_relu").load().unwrap().is_none());
    }

    #[test]
    fn test_row_count_mismatch_is_a_miss() {
        let tmp = tempfile::tempdir().unwrap();
        EncodingCache::new(tmp.path(), "conv4_block5_out").save(&encoded(3, 2)).unwrap();
        // A later run of another layer with a different scene count
        EncodingCache::new(tmp.path(), "conv5_block3_out").save(&encoded(4, 2)).unwrap();

        assert!(EncodingCache::new(tmp.path(), "conv4_block5_out").load().unwrap().is_none());
        assert!(EncodingCache::new(tmp.path(), "conv5_block3_out").load().unwrap().is_some());
    }

    #[test]
    fn test_layers_of_the_same_scenes_coexist() {
        let tmp = tempfile::tempdir().unwrap();
        let deep = encoded(4, 3);
        let shallow = EncodedScenes { rows: vec![vec![1.0; 6]; 4], ..deep.clone() };
        EncodingCache::new(tmp.path(), "conv5_block3_out").save(&deep).unwrap();
        EncodingCache::new(tmp.path(), "conv1_relu").save(&shallow).unwrap();

        assert_eq!(EncodingCache::new(tmp.path(), "conv5_block3_out").load().unwrap(), Some(deep));
        assert_eq!(EncodingCache::new(tmp.path(), "conv1_relu").load().unwrap(), Some(shallow));
    }
}

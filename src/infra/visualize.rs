// ============================================================
// Layer 6 — Band Visualisation
// ============================================================
// Turns tensors pulled back to the host into 8-bit images for
// the summary sink.
//
//   view images:        three chosen bands → RGB,  x ∈ [-1, 1]
//                       mapped with x/2 + 0.5 and clamped
//   similarity matrix:  N × N grayscale, min-max normalised
//
// Which bands make up an image is configured by name, in
// groups of three ("red,green,blue,nir,swir1,swir2" gives two
// images per view).

use crate::domain::error::ConfigError;
use crate::domain::traits::SummaryImage;

/// Three band indices rendered as one RGB image, and its tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandTriple {
    pub name:    String,
    pub indices: [usize; 3],
}

/// Resolve band names into RGB triples of band indices.
pub fn band_triples(bands: &[String], visualize: &[String]) -> Result<Vec<BandTriple>, ConfigError> {
    if visualize.len() % 3 != 0 {
        return Err(ConfigError::VisualizeBands(format!(
            "expected groups of 3 band names, got {}",
            visualize.len()
        )));
    }

    visualize
        .chunks_exact(3)
        .map(|group| {
            let mut indices = [0usize; 3];
            for (slot, name) in indices.iter_mut().zip(group) {
                *slot = bands.iter().position(|b| b == name).ok_or_else(|| {
                    ConfigError::VisualizeBands(format!(
                        "'{name}' is not one of the bands [{}]",
                        bands.join(", ")
                    ))
                })?;
            }
            Ok(BandTriple { name: group.join("_"), indices })
        })
        .collect()
}

fn to_u8(x: f32) -> u8 {
    ((x / 2.0 + 0.5).clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Render one HWC tile (values in [-1, 1]) as RGB.
pub fn rgb_image(pixels: &[f32], side: usize, n_bands: usize, triple: &BandTriple) -> SummaryImage {
    let data = pixels
        .chunks_exact(n_bands)
        .take(side * side)
        .flat_map(|px| triple.indices.map(|b| to_u8(px[b])))
        .collect();

    SummaryImage::Rgb { width: side as u32, height: side as u32, data }
}

/// Render a row-major N × N similarity matrix as grayscale.
pub fn similarity_image(values: &[f32], n: usize) -> SummaryImage {
    let (min, max) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;

    let data = values
        .iter()
        .map(|&v| {
            if range > 0.0 {
                (((v - min) / range) * 255.0).round() as u8
            } else {
                0
            }
        })
        .collect();

    SummaryImage::Gray { width: n as u32, height: n as u32, data }
}

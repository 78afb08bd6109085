// ============================================================
// Layer 3 — Representation Layers and Loss Weights
// ============================================================
// The encoder exposes its activations at a fixed set of named
// depths. A training run picks a non-empty subset of them and
// gives each a weight:
//
//   "conv4_block5_out:0.5,conv5_block3_out:1.0"
//
// The contrastive loss is computed at every chosen layer and the
// weighted losses are summed. The order given by the user is
// kept, so metrics are always reported in the same order.
//
// Parsing happens once, when the configuration is built; a bad
// string never reaches the training loop.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::error::ConfigError;

/// Names of every representation layer the encoder exposes,
/// from shallowest to deepest.
pub const REPRESENTATION_LAYERS: [&str; 5] = [
    "conv1_relu",
    "conv2_block2_out",
    "conv3_block3_out",
    "conv4_block5_out",
    "conv5_block3_out",
];

/// Returns true if `name` is one of [`REPRESENTATION_LAYERS`]
pub fn is_representation_layer(name: &str) -> bool {
    REPRESENTATION_LAYERS.contains(&name)
}

/// One (layer, weight) pair of the aggregated loss
#[derive(Debug, Clone, PartialEq)]
pub struct LayerWeight {
    pub layer:  String,
    pub weight: f64,
}

/// Ordered, validated layer loss weights.
///
/// Serialises to and from the same `name:weight,...` string the
/// command line accepts, so a saved `train_config.json` reads
/// exactly like the flags that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LayerLossWeights {
    entries: Vec<LayerWeight>,
}

impl LayerLossWeights {
    /// Parse a comma-separated list of `name:weight` pairs
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut entries: Vec<LayerWeight> = Vec::new();

        for raw in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (name, value) = raw
                .split_once(':')
                .ok_or_else(|| ConfigError::LayerWeightSyntax(raw.to_string()))?;
            let (name, value) = (name.trim(), value.trim());

            // A second colon means the entry is not name:weight
            if name.is_empty() || value.contains(':') {
                return Err(ConfigError::LayerWeightSyntax(raw.to_string()));
            }

            if !is_representation_layer(name) {
                return Err(ConfigError::UnknownLayer {
                    name:  name.to_string(),
                    known: REPRESENTATION_LAYERS.join(", "),
                });
            }

            let weight: f64 = value
                .parse()
                .ok()
                .filter(|w: &f64| w.is_finite() && *w > 0.0)
                .ok_or_else(|| ConfigError::InvalidLayerWeight {
                    name:  name.to_string(),
                    value: value.to_string(),
                })?;

            if entries.iter().any(|e| e.layer == name) {
                return Err(ConfigError::DuplicateLayer(name.to_string()));
            }

            entries.push(LayerWeight { layer: name.to_string(), weight });
        }

        if entries.is_empty() {
            return Err(ConfigError::NoLayerWeights);
        }

        Ok(Self { entries })
    }

    pub fn iter(&self) -> impl Iterator<Item = &LayerWeight> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Layer names in configuration order
    pub fn layer_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.layer.as_str()).collect()
    }
}

/// The deepest layer alone, at weight 1
impl Default for LayerLossWeights {
    fn default() -> Self {
        Self {
            entries: vec![LayerWeight { layer: "conv5_block3_out".to_string(), weight: 1.0 }],
        }
    }
}

impl FromStr for LayerLossWeights {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for LayerLossWeights {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<LayerLossWeights> for String {
    fn from(w: LayerLossWeights) -> Self {
        w.to_string()
    }
}

impl fmt::Display for LayerLossWeights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .entries
            .iter()
            .map(|e| format!("{}:{}", e.layer, e.weight))
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

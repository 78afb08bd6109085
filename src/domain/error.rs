// ============================================================
// Layer 3 — Configuration Errors
// ============================================================
// Every way a training configuration can be rejected.
//
// These are detected eagerly, before the first batch is pulled
// from the dataset. Nothing here is ever coerced into a "close
// enough" value: a bad flag aborts the run with a message that
// names the offending value.
//
// Runtime failures (I/O, non-finite loss, recorder errors) are
// not listed here. They travel as anyhow::Error with context.

use thiserror::Error;

/// A configuration value that cannot be used for training.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// An entry of the layer loss weights is not `name:weight`
    #[error("layer loss weight '{0}' is not of the form name:weight")]
    LayerWeightSyntax(String),

    /// A layer name that the encoder does not expose
    #[error("unknown representation layer '{name}' (known layers: {known})")]
    UnknownLayer { name: String, known: String },

    /// The weight part could not be parsed, or is not a positive finite number
    #[error("invalid weight '{value}' for layer '{name}': must be a positive number")]
    InvalidLayerWeight { name: String, value: String },

    /// The same layer was listed twice
    #[error("layer '{0}' appears more than once in the layer loss weights")]
    DuplicateLayer(String),

    /// No layers at all
    #[error("at least one layer loss weight is required")]
    NoLayerWeights,

    #[error("softmax temperature must be greater than 0.01, got {0}")]
    TemperatureTooLow(f64),

    #[error("band dropout rate must lie in [0, 1), got {0}")]
    DropoutRate(f64),

    /// Brightness or contrast jitter outside [0, 1]
    #[error("{name} must lie in [0, 1], got {value}")]
    Jitter { name: &'static str, value: f64 },

    #[error("model tile size {model} is larger than the data tile size {data}")]
    TileSize { model: usize, data: usize },

    /// A size, count or cadence that must be strictly positive
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),

    #[error("learning rate must be a positive number, got {0}")]
    LearningRate(f64),

    #[error("gradient clip norm must be a positive number, got {0}")]
    ClipNorm(f64),

    #[error("keep_checkpoint_every_n_hours must be a positive number, got {0}")]
    RetentionInterval(f64),

    /// Train, test and validation fractions must each lie in [0, 1] and sum to at most 1
    #[error("invalid split fractions: {0}")]
    SplitFractions(String),

    /// Visualised bands must come in RGB triples drawn from the configured bands
    #[error("invalid visualize_bands: {0}")]
    VisualizeBands(String),
}

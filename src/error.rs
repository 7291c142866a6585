//! Error types for loading and evaluating emulators.

use thiserror::Error;

/// Result type for emulator operations
pub type Result<T> = std::result::Result<T, EmulatorError>;

/// Possible emulator errors.
#[derive(Error, Debug)]
pub enum EmulatorError {
    /// The emulator file is missing entries or has a malformed structure
    #[error("malformed emulator model: {0}")]
    Load(String),

    /// The sampling grid or sensor setup is incompatible with the emulator
    #[error("incompatible configuration: {0}")]
    Config(String),

    /// A query point lies outside the trained input box
    #[error(
        "input point is out of bounds\n keys: {names:?}\n point: {point:?}\n xmin: {min:?}\n \
         xmax: {max:?}\n oob_low: {below:?}\n oob_high: {above:?}"
    )]
    Bounds {
        /// Emulator input names, in input order
        names: Vec<String>,
        /// The rejected point
        point: Vec<f64>,
        /// Lower bounds of the trained box
        min: Vec<f64>,
        /// Upper bounds of the trained box
        max: Vec<f64>,
        /// Per-dimension flag for `point < min`
        below: Vec<bool>,
        /// Per-dimension flag for `point > max`
        above: Vec<bool>,
    },

    /// Arrays don't have the shape the model requires
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    Shape {
        /// Where the mismatch was detected
        context: String,
        /// Expected shape
        expected: Vec<usize>,
        /// Shape that was found
        actual: Vec<usize>,
    },

    /// Reading a file failed
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that was being read
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// A YAML or JSON document couldn't be parsed
    #[error("failed to parse document: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The operation was aborted early
    #[error("operation cancelled early")]
    Cancelled,

    /// The worker pool couldn't be started
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl EmulatorError {
    pub(crate) fn shape(
        context: impl Into<String>,
        expected: impl Into<Vec<usize>>,
        actual: impl Into<Vec<usize>>,
    ) -> Self {
        EmulatorError::Shape {
            context: context.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Indices of the dimensions that violated the bounds, for a [`EmulatorError::Bounds`]
    pub fn violating_dimensions(&self) -> Vec<usize> {
        match self {
            EmulatorError::Bounds { below, above, .. } => below
                .iter()
                .zip(above)
                .enumerate()
                .filter(|(_, (&lo, &hi))| lo || hi)
                .map(|(i, _)| i)
                .collect(),
            _ => Vec::new(),
        }
    }
}

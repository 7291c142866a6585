//! Coordinate transforms applied to emulator inputs and outputs.

use ndarray::ArrayViewMut1;

use crate::error::{EmulatorError, Result};

/// Per-input transform, selected by the code stored with each regression
/// block.
///
/// The codes on disk are 1-based, in the order of the variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputTransform {
    /// `x`
    Identity,
    /// `ln(x)`
    Log,
    /// `cos(x)`, with `x` in degrees
    CosDeg,
    /// `cos(90° - x)`, with `x` in degrees
    CosComplementDeg,
    /// `ln(180 - x)`
    LogSupplement,
}

impl TryFrom<i64> for InputTransform {
    type Error = EmulatorError;

    fn try_from(code: i64) -> Result<Self> {
        match code {
            1 => Ok(Self::Identity),
            2 => Ok(Self::Log),
            3 => Ok(Self::CosDeg),
            4 => Ok(Self::CosComplementDeg),
            5 => Ok(Self::LogSupplement),
            _ => Err(EmulatorError::Load(format!(
                "unknown input transform code {code}"
            ))),
        }
    }
}

impl InputTransform {
    /// Transform a single value.
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Self::Identity => x,
            Self::Log => x.ln(),
            Self::CosDeg => x.to_radians().cos(),
            Self::CosComplementDeg => (90.0 - x).to_radians().cos(),
            Self::LogSupplement => (180.0 - x).ln(),
        }
    }

    /// Transform a column of inputs in place.
    pub fn apply_inplace(self, mut column: ArrayViewMut1<'_, f64>) {
        if self != Self::Identity {
            column.mapv_inplace(|x| self.apply(x));
        }
    }
}

/// Inverse of the log-domain fit used for the downward transmittances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputTransform {
    /// Leave the output untouched
    None,
    /// `exp(x) - 0.1`
    ExpMinusOffset,
}

impl OutputTransform {
    /// Offset added before the log transform during training.
    const OFFSET: f64 = 0.1;

    /// Transform a single value.
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Self::None => x,
            Self::ExpMinusOffset => x.exp() - Self::OFFSET,
        }
    }
}

//! Back-projection of reduced predictions into sensor channels.

use ndarray::{Array1, Array2, ArrayView1, Axis};

use super::model::RegressionBlock;
use crate::error::{EmulatorError, Result};

/// Ratio between a Gaussian's full width at half maximum and its sigma.
const FWHM_TO_SIGMA: f64 = 2.355;

/// Gaussian spectral response of one channel, sampled on `wavelengths` and
/// normalized to unit sum.
///
/// Returns `None` if the response vanishes everywhere on `wavelengths`.
pub fn spectral_response_function(
    wavelengths: ArrayView1<'_, f64>,
    center: f64,
    sigma: f64,
) -> Option<Array1<f64>> {
    let norm = 1.0 / (2.0 * std::f64::consts::PI).sqrt();
    let srf = wavelengths.mapv(|wl| {
        let u = (wl - center) / sigma.abs();
        norm * (-u * u / 2.0).exp()
    });
    let total = srf.sum();
    (total > 0.0 && total.is_finite()).then(|| srf / total)
}

/// Linear operator from emulator wavelengths to sensor channels, shaped
/// (`num_channels`, `num_emulator_wavelengths`).
pub fn spectral_response_matrix(
    emulator_wl: ArrayView1<'_, f64>,
    sensor_wl: ArrayView1<'_, f64>,
    sensor_fwhm: ArrayView1<'_, f64>,
) -> Result<Array2<f64>> {
    if sensor_wl.len() != sensor_fwhm.len() {
        return Err(EmulatorError::shape(
            "sensor FWHM",
            [sensor_wl.len()],
            [sensor_fwhm.len()],
        ));
    }

    let mut matrix = Array2::zeros([sensor_wl.len(), emulator_wl.len()]);
    for ((mut row, &wl), &fwhm) in matrix.outer_iter_mut().zip(&sensor_wl).zip(&sensor_fwhm) {
        if fwhm.is_nan() || fwhm <= 0.0 {
            return Err(EmulatorError::Config(format!(
                "channel at {wl} has non-positive FWHM {fwhm}"
            )));
        }
        let srf = spectral_response_function(emulator_wl, wl, fwhm / FWHM_TO_SIGMA).ok_or_else(
            || EmulatorError::Config(format!("channel at {wl} lies outside the emulator range")),
        )?;
        row.assign(&srf);
    }
    Ok(matrix)
}

/// Precomputed output projection of one regression block onto the sensor.
#[derive(Debug, Clone)]
pub struct ProjectionAssembler {
    /// (`num_channels`, `num_components`), output std folded in
    h: Array2<f64>,
    /// Output mean per channel
    mean: Array1<f64>,
}

impl ProjectionAssembler {
    /// Combine a block's output reduction with the spectral response matrix.
    pub fn new(block: &RegressionBlock, srf: &Array2<f64>) -> Result<Self> {
        let reduction = &block.reduction;
        let num_native = reduction.yproj.vectors.ncols();
        if srf.ncols() != num_native || reduction.ymean.len() != num_native {
            return Err(EmulatorError::shape(
                format!("{} output projection", block.name),
                [srf.nrows(), num_native],
                srf.shape(),
            ));
        }

        // De-standardize along the emulator wavelengths before convolving.
        let scaled = match reduction.ystd.len() {
            1 => &reduction.yproj.vectors * reduction.ystd[0],
            n if n == num_native => {
                &reduction.yproj.vectors * &reduction.ystd.view().insert_axis(Axis(0))
            }
            n => {
                return Err(EmulatorError::shape(
                    format!("{} output std", block.name),
                    [num_native],
                    [n],
                ))
            }
        };
        let h = srf.dot(&scaled.t()) * &reduction.yproj.values.view().insert_axis(Axis(0));
        let mean = srf.dot(&reduction.ymean);

        Ok(Self { h, mean })
    }

    /// Number of sensor channels.
    pub fn num_channels(&self) -> usize {
        self.h.nrows()
    }

    /// Map a reduced prediction (`num_points`, `num_components`) to
    /// de-standardized channel values (`num_points`, `num_channels`).
    pub fn project(&self, reduced: &Array2<f64>) -> Result<Array2<f64>> {
        if reduced.ncols() != self.h.ncols() {
            return Err(EmulatorError::shape(
                "reduced prediction",
                [reduced.nrows(), self.h.ncols()],
                reduced.shape(),
            ));
        }

        let mut projected = reduced.dot(&self.h.t());
        projected += &self.mean.view().insert_axis(Axis(0));
        Ok(projected)
    }
}

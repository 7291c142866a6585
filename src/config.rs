//! Engine configuration.
//!
//! An engine is described by a small YAML document:
//!
//! ```yaml
//! emulator_file: /data/emulator.h5
//! template_file: /data/modtran_template.json
//! wavelength_file: /data/wavelengths.txt
//! num_threads: 4
//! lut_grid:
//!   AERFRAC2: [0.1, 0.5, 1.0]
//!   H2OSTR: [0.5, 1.5, 2.5]
//!   surface_elevation_km: 0.2
//! ```

use std::path::{Path, PathBuf};

use log::info;
use ndarray::Array1;
use serde::Deserialize;

use crate::emulator::{
    EmulatorModel, GeometryTemplate, KernelFlowsEngine, KeyRegistry, PredictionResult,
    SamplingGrid,
};
use crate::error::{EmulatorError, Result};

/// Wavelengths below this are taken to be in micrometres.
const MICRON_THRESHOLD: f64 = 100.0;

/// Inputs needed to build an engine.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Trained emulator (HDF5)
    pub emulator_file: PathBuf,
    /// Radiative transfer template used for geometry/surface defaults
    #[serde(default)]
    pub template_file: Option<PathBuf>,
    /// Sensor wavelength file, `[index] wavelength fwhm` per line
    #[serde(default)]
    pub wavelength_file: Option<PathBuf>,
    /// Configured sampling grid
    #[serde(default)]
    pub lut_grid: SamplingGrid,
    /// Worker threads for batch evaluation; `None` chooses automatically
    #[serde(default)]
    pub num_threads: Option<usize>,
}

impl EngineConfig {
    /// Parse a configuration document.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Read and parse a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_yaml_str(&read_to_string(path.as_ref())?)
    }

    /// The key registry, with the template's defaults applied if a template
    /// is configured.
    pub fn registry(&self) -> Result<KeyRegistry> {
        let registry = KeyRegistry::builtin();
        match &self.template_file {
            Some(path) => Ok(registry.with_template(&GeometryTemplate::from_file(path)?)),
            None => {
                info!("No template file configured, using built-in defaults");
                Ok(registry)
            }
        }
    }

    /// The sensor channels from the configured wavelength file.
    pub fn sensor(&self) -> Result<SensorGrid> {
        match &self.wavelength_file {
            Some(path) => SensorGrid::from_wavelength_file(path),
            None => Err(EmulatorError::Config(
                "no wavelength_file configured".into(),
            )),
        }
    }

    /// Build an engine around an already loaded model.
    pub fn engine_with_model(
        &self,
        model: EmulatorModel,
        sensor: &SensorGrid,
    ) -> Result<KernelFlowsEngine> {
        KernelFlowsEngine::new(
            model,
            &self.registry()?,
            self.lut_grid.clone(),
            sensor.wl.view(),
            sensor.fwhm.view(),
        )
    }

    /// Evaluate every grid point of `engine` with the configured number of
    /// worker threads.
    pub fn simulate(&self, engine: &KernelFlowsEngine) -> Result<PredictionResult> {
        engine.simulate_grid(self.num_threads)
    }

    /// Load the emulator file and build an engine for the configured sensor.
    #[cfg(feature = "hdf5")]
    pub fn build_engine(&self) -> Result<KernelFlowsEngine> {
        let sensor = self.sensor()?;
        self.engine_with_model(EmulatorModel::from_hdf5(&self.emulator_file)?, &sensor)
    }
}

/// Sensor channel centers and widths, both in nm.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorGrid {
    /// Channel center wavelengths
    pub wl: Array1<f64>,
    /// Channel full width at half maximum
    pub fwhm: Array1<f64>,
}

impl SensorGrid {
    /// Check and wrap channel centers and widths.
    pub fn new(wl: Array1<f64>, fwhm: Array1<f64>) -> Result<Self> {
        if wl.is_empty() {
            return Err(EmulatorError::Config("sensor has no channels".into()));
        }
        if wl.len() != fwhm.len() {
            return Err(EmulatorError::Config(format!(
                "{} wavelengths but {} FWHM values",
                wl.len(),
                fwhm.len()
            )));
        }
        if let Some(bad) = fwhm.iter().find(|&&f| f.is_nan() || f <= 0.0) {
            return Err(EmulatorError::Config(format!("non-positive FWHM {bad}")));
        }
        Ok(Self { wl, fwhm })
    }

    /// Parse a wavelength file.
    ///
    /// Each non-comment line has either two columns (wavelength, fwhm) or
    /// three (index, wavelength, fwhm). Micrometres are converted to nm.
    pub fn from_wavelength_str(text: &str) -> Result<Self> {
        let mut wl = Vec::new();
        let mut fwhm = Vec::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let columns = line
                .split_whitespace()
                .map(str::parse::<f64>)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| {
                    EmulatorError::Config(format!("wavelength file line {}: {e}", number + 1))
                })?;
            let (w, f) = match columns.as_slice() {
                [w, f] | [_, w, f] => (*w, *f),
                _ => {
                    return Err(EmulatorError::Config(format!(
                        "wavelength file line {} has {} columns",
                        number + 1,
                        columns.len()
                    )))
                }
            };
            wl.push(w);
            fwhm.push(f);
        }

        let mut wl = Array1::from(wl);
        let mut fwhm = Array1::from(fwhm);
        if wl.first().is_some_and(|&w| w < MICRON_THRESHOLD) {
            wl *= 1000.0;
            fwhm *= 1000.0;
        }
        Self::new(wl, fwhm)
    }

    /// Read a wavelength file.
    pub fn from_wavelength_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_wavelength_str(&read_to_string(path.as_ref())?)
    }
}

fn read_to_string(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| EmulatorError::Io {
        path: path.display().to_string(),
        source,
    })
}

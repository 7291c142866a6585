//! Python interface.
//!
//! NOTE: this module is only the interface between Rust and Python. The real
//! work happens in the other modules, and they do not use `pyo3`, its only
//! used here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::debug;
use numpy::{PyArray1, PyArray2, PyReadonlyArray1, PyReadonlyArray2, ToPyArray};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::emulator::{
    EmulatorModel, GeometryTemplate, KernelFlowsEngine, KeyRegistry, PredictionResult,
    Quantity, SamplingGrid,
};
use crate::error::EmulatorError;

/// How often a running batch checks for Python signals (e.g. Ctrl-C).
const SIGNAL_CHECK_INTERVAL: Duration = Duration::from_millis(200);

impl From<EmulatorError> for PyErr {
    fn from(e: EmulatorError) -> Self {
        match e {
            EmulatorError::Load(_) => PyValueError::new_err(e.to_string()),
            EmulatorError::Config(_) => PyValueError::new_err(e.to_string()),
            EmulatorError::Bounds { .. } => PyValueError::new_err(e.to_string()),
            EmulatorError::Shape { .. } => PyValueError::new_err(e.to_string()),
            EmulatorError::Io { .. } => PyValueError::new_err(e.to_string()),
            EmulatorError::Parse(_) => PyValueError::new_err(e.to_string()),
            EmulatorError::Cancelled => PyValueError::new_err(e.to_string()),
            EmulatorError::ThreadPool(_) => PyValueError::new_err(e.to_string()),
        }
    }
}

/// Radiative transfer emulation based on KernelFlows.
///
/// `emulator_file` is the trained model (HDF5), `template_file` an optional
/// radiative transfer template supplying geometry defaults, `lut_grid` a dict
/// from LUT variable name to grid values, and `wl`/`fwhm` the sensor channels
/// in nm, each shaped (`num_channels`, ).
#[pyclass(name = "KernelFlowsRT")]
struct PyKernelFlowsRT {
    engine: KernelFlowsEngine,
}

#[pymethods]
impl PyKernelFlowsRT {
    #[new]
    #[pyo3(signature = (emulator_file, template_file, lut_grid, wl, fwhm))]
    fn new(
        emulator_file: std::path::PathBuf,
        template_file: Option<std::path::PathBuf>,
        lut_grid: &Bound<'_, PyDict>,
        wl: PyReadonlyArray1<'_, f64>,
        fwhm: PyReadonlyArray1<'_, f64>,
    ) -> PyResult<Self> {
        let mut grid = SamplingGrid::new();
        for (key, values) in lut_grid.iter() {
            let values: Vec<f64> = match values.extract() {
                Ok(values) => values,
                Err(_) => vec![values.extract::<f64>()?],
            };
            grid.insert(key.extract::<String>()?, values);
        }

        let registry = match template_file {
            Some(path) => KeyRegistry::builtin().with_template(&GeometryTemplate::from_file(path)?),
            None => KeyRegistry::builtin(),
        };

        let model = EmulatorModel::from_hdf5(emulator_file)?;
        let engine =
            KernelFlowsEngine::new(model, &registry, grid, wl.as_array(), fwhm.as_array())?;
        Ok(Self { engine })
    }

    /// Every LUT point, shaped (`num_points`, `num_inputs`).
    #[getter]
    fn points<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray2<f64>> {
        self.engine.points().to_pyarray(py)
    }

    /// Emulator input names, in the column order of `points`.
    #[getter]
    fn emulator_names(&self) -> Vec<String> {
        self.engine.emulator_names().to_vec()
    }

    /// The reconciled sampling grid.
    #[getter]
    fn lut_grid<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        for (name, values) in self.engine.lut_grid().iter() {
            dict.set_item(name, values.to_vec())?;
        }
        Ok(dict)
    }

    /// Evaluate a batch of points, shaped (`num_points`, `num_inputs`).
    ///
    /// The number of worker threads is controlled by `num_threads`. It must be
    /// a positive integer, or `None` to automatically choose the number of
    /// threads.
    #[pyo3(signature = (points, num_threads=None))]
    fn predict<'py>(
        &self,
        py: Python<'py>,
        points: PyReadonlyArray2<'py, f64>,
        num_threads: Option<usize>,
    ) -> PyResult<Bound<'py, PyDict>> {
        let points = points.as_array().to_owned();
        let cancelled = AtomicBool::new(false);

        let result = std::thread::scope(|s| -> PyResult<PredictionResult> {
            let worker = s.spawn(|| {
                self.engine
                    .predict_cancellable(points.view(), num_threads, &cancelled)
            });

            // The work is done in the thread pool, but back here in the main
            // thread, check for early cancellation
            while !worker.is_finished() {
                if let Err(e) = py.check_signals() {
                    cancelled.store(true, Ordering::Relaxed);
                    return Err(e);
                }
                py.allow_threads(|| std::thread::sleep(SIGNAL_CHECK_INTERVAL));
            }

            match worker.join() {
                Ok(result) => Ok(result?),
                Err(panic) => std::panic::resume_unwind(panic),
            }
        })?;
        to_dict(py, &result)
    }

    /// Evaluate a single point, shaped (`num_inputs`, ).
    fn read_sim<'py>(
        &self,
        py: Python<'py>,
        point: PyReadonlyArray1<'py, f64>,
    ) -> PyResult<Bound<'py, PyDict>> {
        let result = self.engine.read_sim(point.as_array())?;
        to_dict(py, &result)
    }
}

fn to_dict<'py>(py: Python<'py>, result: &PredictionResult) -> PyResult<Bound<'py, PyDict>> {
    debug!("copying emulator output");
    let dict = PyDict::new(py);
    for quantity in Quantity::ALL {
        let array: Bound<'py, PyArray2<f64>> = result.get(quantity).to_pyarray(py);
        dict.set_item(quantity.name(), array)?;
    }
    let solar_irr: Bound<'py, PyArray1<f64>> = result.solar_irr.to_pyarray(py);
    dict.set_item("solar_irr", solar_irr)?;
    dict.set_item("wl", result.wl.to_pyarray(py))?;
    Ok(dict)
}

/// A Python module implemented in Rust.
#[pymodule]
fn kernel_flows_rt(m: &Bound<'_, PyModule>) -> PyResult<()> {
    pyo3_log::init();

    m.add_class::<PyKernelFlowsRT>()?;
    Ok(())
}

//! Radiative transfer emulation based on a trained KernelFlows model.
//!
//! Instead of running a physics simulator, the engine evaluates a pre-trained
//! statistical emulator: kernel regression in a reduced input space followed
//! by back-projection into the emulator's wavelengths and convolution with the
//! sensor's spectral response.

mod grid;
mod kernel;
mod keys;
mod model;
mod projection;
mod transform;
mod tree;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::{debug, info, warn};
use ndarray::{concatenate, s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

pub use self::grid::SamplingGrid;
pub use self::keys::{GeometryTemplate, KeyEntry, KeyRegistry};
pub use self::model::{
    Eigenpair, EmulatorModel, KernelComponent, Reduction, RegressionBlock, MAX_BLOCKS,
    RESERVED_KEYS, SCHEMA_VERSION,
};
pub use self::projection::{
    spectral_response_function, spectral_response_matrix, ProjectionAssembler,
};
pub use self::transform::{InputTransform, OutputTransform};
pub use self::tree::Node;

use crate::error::{EmulatorError, Result};

/// Quantity predicted by each regression block, in block order, along with
/// the output transform it needs.
const BLOCK_ROLES: [(Quantity, OutputTransform); MAX_BLOCKS] = [
    (Quantity::Rhoatm, OutputTransform::None),
    (Quantity::TransmDownDir, OutputTransform::ExpMinusOffset),
    (Quantity::TransmDownDif, OutputTransform::ExpMinusOffset),
    (Quantity::Sphalb, OutputTransform::None),
];

/// Quantities an engine must provide along (points, wavelength).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    /// Atmospheric path reflectance
    Rhoatm,
    /// Spherical albedo
    Sphalb,
    /// Direct downward transmittance
    TransmDownDir,
    /// Diffuse downward transmittance
    TransmDownDif,
    /// Direct upward transmittance
    TransmUpDir,
    /// Diffuse upward transmittance
    TransmUpDif,
    /// Thermal upwelling radiance
    ThermalUpwelling,
    /// Thermal downwelling radiance
    ThermalDownwelling,
}

impl Quantity {
    /// All point-dependent quantities.
    pub const ALL: [Quantity; 8] = [
        Quantity::Rhoatm,
        Quantity::Sphalb,
        Quantity::TransmDownDir,
        Quantity::TransmDownDif,
        Quantity::TransmUpDir,
        Quantity::TransmUpDif,
        Quantity::ThermalUpwelling,
        Quantity::ThermalDownwelling,
    ];

    /// Name used in LUT files.
    pub fn name(self) -> &'static str {
        match self {
            Quantity::Rhoatm => "rhoatm",
            Quantity::Sphalb => "sphalb",
            Quantity::TransmDownDir => "transm_down_dir",
            Quantity::TransmDownDif => "transm_down_dif",
            Quantity::TransmUpDir => "transm_up_dir",
            Quantity::TransmUpDif => "transm_up_dif",
            Quantity::ThermalUpwelling => "thermal_upwelling",
            Quantity::ThermalDownwelling => "thermal_downwelling",
        }
    }
}

/// Emulator output for a batch of points.
///
/// The 2d arrays are each dimensioned as (`num_points`, `num_channels`).
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
    /// Sensor wavelengths
    pub wl: Array1<f64>,
    /// Atmospheric path reflectance
    pub rhoatm: Array2<f64>,
    /// Spherical albedo
    pub sphalb: Array2<f64>,
    /// Direct downward transmittance
    pub transm_down_dir: Array2<f64>,
    /// Diffuse downward transmittance
    pub transm_down_dif: Array2<f64>,
    /// Direct upward transmittance (not emulated, always zero)
    pub transm_up_dir: Array2<f64>,
    /// Diffuse upward transmittance (not emulated, always zero)
    pub transm_up_dif: Array2<f64>,
    /// Thermal upwelling (not emulated, always zero)
    pub thermal_upwelling: Array2<f64>,
    /// Thermal downwelling (not emulated, always zero)
    pub thermal_downwelling: Array2<f64>,
    /// Solar irradiance along wavelength (not emulated, always zero)
    pub solar_irr: Array1<f64>,
}

impl PredictionResult {
    fn zeros(wl: Array1<f64>, num_points: usize) -> Self {
        let shape = [num_points, wl.len()];
        Self {
            rhoatm: Array2::zeros(shape),
            sphalb: Array2::zeros(shape),
            transm_down_dir: Array2::zeros(shape),
            transm_down_dif: Array2::zeros(shape),
            transm_up_dir: Array2::zeros(shape),
            transm_up_dif: Array2::zeros(shape),
            thermal_upwelling: Array2::zeros(shape),
            thermal_downwelling: Array2::zeros(shape),
            solar_irr: Array1::zeros(wl.len()),
            wl,
        }
    }

    /// Number of points in the batch.
    pub fn num_points(&self) -> usize {
        self.rhoatm.nrows()
    }

    /// The array for a point-dependent quantity.
    pub fn get(&self, quantity: Quantity) -> &Array2<f64> {
        match quantity {
            Quantity::Rhoatm => &self.rhoatm,
            Quantity::Sphalb => &self.sphalb,
            Quantity::TransmDownDir => &self.transm_down_dir,
            Quantity::TransmDownDif => &self.transm_down_dif,
            Quantity::TransmUpDir => &self.transm_up_dir,
            Quantity::TransmUpDif => &self.transm_up_dif,
            Quantity::ThermalUpwelling => &self.thermal_upwelling,
            Quantity::ThermalDownwelling => &self.thermal_downwelling,
        }
    }

    fn get_mut(&mut self, quantity: Quantity) -> &mut Array2<f64> {
        match quantity {
            Quantity::Rhoatm => &mut self.rhoatm,
            Quantity::Sphalb => &mut self.sphalb,
            Quantity::TransmDownDir => &mut self.transm_down_dir,
            Quantity::TransmDownDif => &mut self.transm_down_dif,
            Quantity::TransmUpDir => &mut self.transm_up_dir,
            Quantity::TransmUpDif => &mut self.transm_up_dif,
            Quantity::ThermalUpwelling => &mut self.thermal_upwelling,
            Quantity::ThermalDownwelling => &mut self.thermal_downwelling,
        }
    }

    /// Stack batch results along the point axis.
    fn concatenate(parts: &[PredictionResult]) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| EmulatorError::shape("prediction batch", [1], [0]))?;
        let mut out = Self::zeros(first.wl.clone(), 0);
        for quantity in Quantity::ALL {
            let views: Vec<_> = parts.iter().map(|p| p.get(quantity).view()).collect();
            *out.get_mut(quantity) = concatenate(Axis(0), &views).map_err(|_| {
                EmulatorError::shape(quantity.name(), [first.wl.len()], [views.len()])
            })?;
        }
        Ok(out)
    }
}

/// The emulator engine.
///
/// Owns the model, the reconciled sampling grid and the per-block output
/// projections; none of them change after construction.
#[derive(Debug)]
pub struct KernelFlowsEngine {
    model: EmulatorModel,
    names: Vec<String>,
    lut_grid: SamplingGrid,
    points: Array2<f64>,
    wl: Array1<f64>,
    assemblers: Vec<ProjectionAssembler>,
}

impl KernelFlowsEngine {
    /// Build the engine.
    ///
    /// `registry` carries any template overrides, `lut_grid` is the configured
    /// sampling grid and `wl`/`fwhm` describe the sensor channels.
    pub fn new(
        model: EmulatorModel,
        registry: &KeyRegistry,
        lut_grid: SamplingGrid,
        wl: ArrayView1<'_, f64>,
        fwhm: ArrayView1<'_, f64>,
    ) -> Result<Self> {
        if model.blocks.is_empty() || model.blocks.len() > MAX_BLOCKS {
            return Err(EmulatorError::Load(format!(
                "{} regression blocks, expected 1 to {MAX_BLOCKS}",
                model.blocks.len()
            )));
        }

        let names: Vec<String> = registry
            .resolve(&model.input_indices)?
            .into_iter()
            .map(|e| e.name.to_string())
            .collect();
        info!("emulator_names: {names:?}");

        let required: Vec<&str> = names.iter().map(String::as_str).collect();
        let lut_grid = lut_grid.reconcile(&required, registry)?;
        info!("lut_grid keynames: {:?}", lut_grid.names().collect::<Vec<_>>());
        let points = lut_grid.combinations(&required)?;

        let srf = spectral_response_matrix(model.wavelengths.view(), wl, fwhm)?;
        let assemblers = model
            .blocks
            .iter()
            .map(|block| ProjectionAssembler::new(block, &srf))
            .collect::<Result<Vec<_>>>()?;

        if model.blocks.len() < MAX_BLOCKS {
            let missing: Vec<_> = BLOCK_ROLES[model.blocks.len()..]
                .iter()
                .map(|(q, _)| q.name())
                .collect();
            warn!("emulator has no blocks for {missing:?}; they will be zero");
        }

        debug!(
            "engine ready: {} points, {} channels",
            points.nrows(),
            wl.len()
        );

        Ok(Self {
            model,
            names,
            lut_grid,
            points,
            wl: wl.to_owned(),
            assemblers,
        })
    }

    /// The loaded model.
    pub fn model(&self) -> &EmulatorModel {
        &self.model
    }

    /// Emulator input names, in input order.
    pub fn emulator_names(&self) -> &[String] {
        &self.names
    }

    /// The reconciled sampling grid.
    pub fn lut_grid(&self) -> &SamplingGrid {
        &self.lut_grid
    }

    /// Every grid point, (`num_points`, `num_inputs`), in emulator input order.
    pub fn points(&self) -> ArrayView2<'_, f64> {
        self.points.view()
    }

    /// Sensor wavelengths.
    pub fn wavelengths(&self) -> ArrayView1<'_, f64> {
        self.wl.view()
    }

    /// Reject points outside the trained box. Bounds are inclusive.
    pub fn check_bounds(&self, point: ArrayView1<'_, f64>) -> Result<()> {
        let min = &self.model.bound_min;
        let max = &self.model.bound_max;
        if point.len() != min.len() {
            return Err(EmulatorError::shape(
                "query point",
                [min.len()],
                [point.len()],
            ));
        }

        // NaN fails both comparisons, so it is flagged as out of bounds too
        let below: Vec<bool> = point.iter().zip(min).map(|(x, lo)| !(x >= lo)).collect();
        let above: Vec<bool> = point.iter().zip(max).map(|(x, hi)| !(x <= hi)).collect();
        if below.iter().chain(&above).any(|&b| b) {
            return Err(EmulatorError::Bounds {
                names: self.names.clone(),
                point: point.to_vec(),
                min: min.to_vec(),
                max: max.to_vec(),
                below,
                above,
            });
        }
        Ok(())
    }

    /// Evaluate the emulator for a batch of points, (`num_points`,
    /// `num_inputs`).
    pub fn predict(&self, points: ArrayView2<'_, f64>) -> Result<PredictionResult> {
        if points.ncols() != self.model.num_inputs() {
            return Err(EmulatorError::shape(
                "query points",
                [points.nrows(), self.model.num_inputs()],
                points.shape(),
            ));
        }
        for point in points.outer_iter() {
            self.check_bounds(point)?;
        }

        let mut result = PredictionResult::zeros(self.wl.clone(), points.nrows());
        for ((block, assembler), &(quantity, output_transform)) in self
            .model
            .blocks
            .iter()
            .zip(&self.assemblers)
            .zip(&BLOCK_ROLES)
        {
            debug!("evaluating {} ({})", block.name, quantity.name());
            let reduced = kernel::predict_block(points, block)?;
            let mut projected = assembler.project(&reduced)?;
            projected.mapv_inplace(|x| output_transform.apply(x));
            *result.get_mut(quantity) = projected;
        }
        Ok(result)
    }

    /// Evaluate a single point.
    pub fn read_sim(&self, point: ArrayView1<'_, f64>) -> Result<PredictionResult> {
        self.predict(point.insert_axis(Axis(0)))
    }

    /// Evaluate a batch of points on a thread pool.
    ///
    /// The number of worker threads is controlled by `num_threads`, or `None`
    /// to choose automatically. Each point only depends on its own
    /// coordinates, so the output matches [`KernelFlowsEngine::predict`].
    pub fn predict_parallel(
        &self,
        points: ArrayView2<'_, f64>,
        num_threads: Option<usize>,
    ) -> Result<PredictionResult> {
        self.predict_cancellable(points, num_threads, &AtomicBool::new(false))
    }

    /// Like [`KernelFlowsEngine::predict_parallel`], but stops early with
    /// [`EmulatorError::Cancelled`] once `cancelled` is set.
    pub fn predict_cancellable(
        &self,
        points: ArrayView2<'_, f64>,
        num_threads: Option<usize>,
        cancelled: &AtomicBool,
    ) -> Result<PredictionResult> {
        let num_points = points.nrows();
        if num_points == 0 {
            return self.predict(points);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads.unwrap_or(0))
            .build()?;

        let num_completed = AtomicUsize::new(0);
        let report_every = (num_points / 10).max(1);

        info!("Emulating RTM for {num_points} points");
        let parts = pool.install(|| {
            (0..num_points)
                .into_par_iter()
                .map(|index| {
                    if cancelled.load(Ordering::Relaxed) {
                        return Err(EmulatorError::Cancelled);
                    }
                    self.predict(points.slice(s![index..index + 1, ..]))
                })
                .inspect(|_| {
                    let done = num_completed.fetch_add(1, Ordering::Relaxed) + 1;
                    if done % report_every == 0 || done == num_points {
                        let progress = done as f32 / num_points as f32 * 100.;
                        info!(
                            "Completed emulation for {done}/{num_points} points ({progress:0.2}%)"
                        );
                    }
                })
                .collect::<Result<Vec<_>>>()
        })?;

        PredictionResult::concatenate(&parts)
    }

    /// Evaluate every point of the reconciled grid.
    pub fn simulate_grid(&self, num_threads: Option<usize>) -> Result<PredictionResult> {
        self.predict_parallel(self.points.view(), num_threads)
    }
}

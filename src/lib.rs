//! Radiative transfer emulation with KernelFlows models.
//!
//! The numerical work lives in [`emulator`]; [`config`] reads engine
//! configurations and sensor wavelength files. With the `python` feature, the
//! crate also builds as a Python extension module exposing the engine.

pub mod config;
pub mod emulator;
pub mod error;

#[cfg(feature = "python")]
mod python;

pub use config::{EngineConfig, SensorGrid};
pub use emulator::{
    EmulatorModel, KernelFlowsEngine, KeyRegistry, PredictionResult, Quantity, SamplingGrid,
};
pub use error::{EmulatorError, Result};

//! Canonical emulator input keys.
//!
//! The emulator file only stores small integer indices for its inputs. The
//! registry turns those into the physical variable names used by the LUT
//! grid, along with a default grid and (optionally) a scalar default.

use log::info;
use serde::Deserialize;

use crate::error::{EmulatorError, Result};

/// One registry entry.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyEntry {
    /// Emulator input index
    pub index: u32,
    /// Canonical LUT variable name
    pub name: &'static str,
    /// Sampling grid used when nothing better is known
    pub default_grid: Vec<f64>,
    /// Scalar value used to fill a grid the configuration doesn't provide
    pub default: Option<f64>,
}

/// Mapping from emulator input index to canonical key.
///
/// Built once per engine and never mutated afterwards; template overrides are
/// applied while constructing it (see [`KeyRegistry::with_template`]).
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRegistry {
    entries: Vec<KeyEntry>,
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl KeyRegistry {
    /// The built-in table.
    pub fn builtin() -> Self {
        let entry = |index, name, grid: &[f64], default| KeyEntry {
            index,
            name,
            default_grid: grid.to_vec(),
            default,
        };

        Self {
            entries: vec![
                entry(1, "AERFRAC2", &[0.08, 0.2, 0.4, 0.6, 0.8, 1.0], Some(0.08)),
                entry(
                    2,
                    "H2OSTR",
                    &[0.05, 0.75, 1.5, 2.25, 3.0, 3.75, 4.5],
                    Some(0.05),
                ),
                entry(3, "surface_elevation_km", &[0.0, 1.5, 3.0, 4.5, 6.0], None),
                entry(
                    4,
                    "observer_altitude_km",
                    &[0.5, 1., 2., 5., 10., 20., 100.],
                    None,
                ),
                entry(
                    5,
                    "solar_zenith",
                    &[0.0, 15.0, 30.0, 45.0, 60.0, 75.0],
                    None,
                ),
                entry(6, "observer_zenith", &[0.0, 10.0, 20.0, 30.0, 40.0], None),
                entry(
                    7,
                    "relative_azimuth",
                    &[0.0, 30.0, 60.0, 90.0, 120.0, 150.0, 180.0],
                    None,
                ),
                entry(8, "solar_azimuth", &[1., 91., 181., 271.], None),
                entry(9, "observer_azimuth", &[1., 91., 181., 271.], None),
            ],
        }
    }

    /// Apply the scalar defaults found in a geometry template.
    ///
    /// Fields absent from the template keep the built-in default.
    pub fn with_template(mut self, template: &GeometryTemplate) -> Self {
        let overrides = [
            ("surface_elevation_km", template.surface_elevation_km()),
            ("observer_altitude_km", template.observer_altitude_km()),
            ("solar_zenith", template.solar_zenith()),
            ("observer_zenith", template.observer_zenith()),
            ("relative_azimuth", template.relative_azimuth()),
            ("solar_azimuth", template.solar_azimuth()),
        ];

        for (name, value) in overrides {
            match (value, self.entries.iter_mut().find(|e| e.name == name)) {
                (Some(value), Some(entry)) => entry.default = Some(value),
                _ => info!("No {name} default in template"),
            }
        }
        self
    }

    /// Look up an entry by emulator index.
    pub fn get(&self, index: u32) -> Option<&KeyEntry> {
        self.entries.iter().find(|e| e.index == index)
    }

    /// Look up an entry by canonical name.
    pub fn by_name(&self, name: &str) -> Option<&KeyEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Resolve a sequence of emulator indices to their entries.
    pub fn resolve(&self, indices: &[u32]) -> Result<Vec<&KeyEntry>> {
        indices
            .iter()
            .map(|&i| {
                self.get(i).ok_or_else(|| {
                    EmulatorError::Config(format!("emulator input index {i} has no registry entry"))
                })
            })
            .collect()
    }
}

/// The subset of a radiative transfer template that carries geometry and
/// surface defaults.
///
/// Everything else in the document is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeometryTemplate {
    #[serde(rename = "MODTRAN", default)]
    cases: Vec<TemplateCase>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TemplateCase {
    #[serde(rename = "MODTRANINPUT", default)]
    input: TemplateInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TemplateInput {
    #[serde(rename = "SURFACE", default)]
    surface: SurfaceSection,
    #[serde(rename = "GEOMETRY", default)]
    geometry: GeometrySection,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SurfaceSection {
    #[serde(rename = "GNDALT")]
    gndalt: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct GeometrySection {
    #[serde(rename = "H1ALT")]
    h1alt: Option<f64>,
    #[serde(rename = "PARM1")]
    parm1: Option<f64>,
    #[serde(rename = "PARM2")]
    parm2: Option<f64>,
    #[serde(rename = "OBSZEN")]
    obszen: Option<f64>,
    #[serde(rename = "TRUEAZ")]
    trueaz: Option<f64>,
}

impl GeometryTemplate {
    /// Parse a template from YAML (JSON documents parse as well).
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Read and parse a template file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| EmulatorError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    fn first(&self) -> Option<&TemplateInput> {
        self.cases.first().map(|c| &c.input)
    }

    fn surface_elevation_km(&self) -> Option<f64> {
        self.first()?.surface.gndalt
    }

    fn observer_altitude_km(&self) -> Option<f64> {
        self.first()?.geometry.h1alt
    }

    fn solar_zenith(&self) -> Option<f64> {
        self.first()?.geometry.parm2
    }

    fn observer_zenith(&self) -> Option<f64> {
        self.first()?.geometry.obszen
    }

    fn relative_azimuth(&self) -> Option<f64> {
        self.first()?.geometry.trueaz
    }

    fn solar_azimuth(&self) -> Option<f64> {
        self.first()?.geometry.parm1
    }
}

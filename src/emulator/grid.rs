//! LUT sampling grid and its reconciliation with the emulator inputs.

use std::fmt;

use log::info;
use ndarray::Array2;
use serde::de::{self, Deserialize, Deserializer, MapAccess, Visitor};

use super::keys::KeyRegistry;
use crate::error::{EmulatorError, Result};

/// Relative perturbation used to widen a single-value grid.
const WIDEN_FRACTION: f64 = 0.01;

/// Ordered mapping from LUT variable name to grid values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SamplingGrid {
    axes: Vec<(String, Vec<f64>)>,
}

impl SamplingGrid {
    /// An empty grid.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grid values for `name`, if present.
    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.axes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Whether the grid has an entry for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set the values for `name`. Existing entries keep their position, new
    /// ones are appended.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) {
        let name = name.into();
        match self.axes.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = values,
            None => self.axes.push((name, values)),
        }
    }

    /// Builder-style [`SamplingGrid::insert`].
    pub fn with(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.insert(name, values);
        self
    }

    /// Variable names, in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.axes.iter().map(|(n, _)| n.as_str())
    }

    /// `(name, values)` pairs, in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.axes.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.axes.len()
    }

    /// Whether the grid has no variables.
    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    /// Make the grid cover every emulator input.
    ///
    /// `required` are the emulator input names in input order. A single-value
    /// grid is widened to three points, `v·0.99, v, v·1.01`, and a missing
    /// input is filled with the registry's scalar default. Fails if some
    /// input has neither a grid nor a default.
    ///
    /// Reconciling again is a no-op only when every required input already
    /// has at least two values: a default inserted here is a single value,
    /// so a second pass widens it to three points.
    pub fn reconcile(mut self, required: &[&str], registry: &KeyRegistry) -> Result<Self> {
        for &name in required {
            match self.get(name) {
                Some(values) if values.len() > 1 => {}
                Some(&[value]) => {
                    let widened = vec![
                        value * (1. - WIDEN_FRACTION),
                        value,
                        value * (1. + WIDEN_FRACTION),
                    ];
                    info!("adjusting lut grid {name} from {value} to {widened:?}");
                    self.insert(name, widened);
                }
                _ => {
                    if let Some(default) = registry.by_name(name).and_then(|e| e.default) {
                        info!("No grid point for {name}, using template: [{default}]");
                        self.insert(name, vec![default]);
                    }
                }
            }
        }

        let missing: Vec<_> = required
            .iter()
            .filter(|&&name| self.get(name).map_or(true, <[f64]>::is_empty))
            .collect();
        if !missing.is_empty() {
            return Err(EmulatorError::Config(format!(
                "the provided emulator is missing lut keys: {missing:?}"
            )));
        }

        Ok(self)
    }

    /// Cartesian product of the grids of `names`, one point per row. The last
    /// name varies fastest.
    pub fn combinations(&self, names: &[&str]) -> Result<Array2<f64>> {
        let axes = names
            .iter()
            .map(|&name| {
                self.get(name).ok_or_else(|| {
                    EmulatorError::Config(format!("no grid for emulator input {name}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let num_points: usize = axes.iter().map(|a| a.len()).product();
        let mut points = Array2::zeros([num_points, axes.len()]);
        for (p, mut row) in points.rows_mut().into_iter().enumerate() {
            let mut rest = p;
            for (j, axis) in axes.iter().enumerate().rev() {
                row[j] = axis[rest % axis.len()];
                rest /= axis.len();
            }
        }
        Ok(points)
    }
}

impl<'de> Deserialize<'de> for SamplingGrid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        /// A grid is usually a list, but a bare number is allowed too.
        #[derive(serde::Deserialize)]
        #[serde(untagged)]
        enum Values {
            One(f64),
            Many(Vec<f64>),
        }

        struct GridVisitor;

        impl<'de> Visitor<'de> for GridVisitor {
            type Value = SamplingGrid;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a mapping from variable name to grid values")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut grid = SamplingGrid::new();
                while let Some((name, values)) = map.next_entry::<String, Values>()? {
                    if grid.contains(&name) {
                        return Err(de::Error::custom(format!("duplicate grid variable {name}")));
                    }
                    let values = match values {
                        Values::One(v) => vec![v],
                        Values::Many(v) => v,
                    };
                    grid.insert(name, values);
                }
                Ok(grid)
            }
        }

        deserializer.deserialize_map(GridVisitor)
    }
}

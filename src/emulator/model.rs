//! The trained emulator: schema validation of the model tree.

use log::debug;
use ndarray::{Array1, Array2};
use smallvec::SmallVec;

use super::{
    transform::InputTransform,
    tree::{GroupRef, Node},
};
use crate::error::{EmulatorError, Result};

/// Version of the model file layout understood by [`EmulatorModel::from_tree`].
pub const SCHEMA_VERSION: u32 = 1;

/// Top-level entries that are not regression blocks.
pub const RESERVED_KEYS: [&str; 5] = ["wls", "inputdims", "xmin", "xmax", "input_transfs"];

/// Most regression blocks a model may have: one per modeled quantity.
pub const MAX_BLOCKS: usize = 4;

/// An eigenvector/eigenvalue pair from a stored dimension reduction.
#[derive(Debug, Clone)]
pub struct Eigenpair {
    /// Eigenvectors, one per row
    pub vectors: Array2<f64>,
    /// Eigenvalues, one per row of `vectors`
    pub values: Array1<f64>,
}

/// One kernel regression model, predicting a single reduced output column.
#[derive(Debug, Clone)]
pub struct KernelComponent {
    /// Reduced training inputs, (`num_train`, `num_reduced`)
    pub z_train: Array2<f64>,
    /// Length scale applied to the reduced test inputs, either one value or
    /// one per reduced dimension
    pub lambda: Array1<f64>,
    /// Kernel hyperparameters: Matérn scale, Matérn length, linear weight
    pub theta: [f64; 3],
    /// Fitted weights, one per training point
    pub weights: Array1<f64>,
}

/// Stored dimension reductions for one regression block.
#[derive(Debug, Clone)]
pub struct Reduction {
    /// Input projections, one per component
    pub xproj: Vec<Eigenpair>,
    /// Input standardization mean, one per input
    pub xmean: Array1<f64>,
    /// Input standardization std, one per input
    pub xstd: Array1<f64>,
    /// Output projection; one eigenvector (row) per component, along the
    /// emulator wavelengths
    pub yproj: Eigenpair,
    /// Output mean along the emulator wavelengths
    pub ymean: Array1<f64>,
    /// Output std, either one value or one per emulator wavelength
    pub ystd: Array1<f64>,
}

/// A regression block ("MVM"): several kernel components sharing one
/// reduction.
#[derive(Debug, Clone)]
pub struct RegressionBlock {
    /// Block name in the model file
    pub name: String,
    /// Components `M1..Mk`
    pub components: Vec<KernelComponent>,
    /// Shared reduction `G`
    pub reduction: Reduction,
    /// Transform for each input
    pub transforms: SmallVec<[InputTransform; 8]>,
}

/// A loaded emulator. Immutable once built.
#[derive(Debug, Clone)]
pub struct EmulatorModel {
    /// Emulator (native) wavelength axis
    pub wavelengths: Array1<f64>,
    /// Registry indices of the inputs, in input order
    pub input_indices: SmallVec<[u32; 8]>,
    /// Lower bound of the trained box
    pub bound_min: Array1<f64>,
    /// Upper bound of the trained box
    pub bound_max: Array1<f64>,
    /// Regression blocks `MVM1..MVMN`
    pub blocks: Vec<RegressionBlock>,
}

impl EmulatorModel {
    /// Read and validate an emulator from an HDF5 file.
    #[cfg(feature = "hdf5")]
    pub fn from_hdf5(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::from_tree(&Node::from_hdf5(path)?)
    }

    /// Validate a model tree against the schema and convert it.
    pub fn from_tree(tree: &Node) -> Result<Self> {
        let root = tree.as_root()?;

        let wavelengths = root.vector("wls")?;
        let input_indices = root
            .vector("inputdims")?
            .iter()
            .map(|&i| {
                if i >= 0. && i.fract() == 0. {
                    Ok(i as u32)
                } else {
                    Err(EmulatorError::Load(format!("invalid input index {i}")))
                }
            })
            .collect::<Result<SmallVec<[u32; 8]>>>()?;
        let num_inputs = input_indices.len();

        let bound_min = root.vector("xmin")?;
        let bound_max = root.vector("xmax")?;
        for (name, bound) in [("xmin", &bound_min), ("xmax", &bound_max)] {
            if bound.len() != num_inputs {
                return Err(EmulatorError::Load(format!(
                    "`{name}` has {} entries for {num_inputs} inputs",
                    bound.len()
                )));
            }
        }
        if bound_min.iter().zip(&bound_max).any(|(lo, hi)| lo > hi) {
            return Err(EmulatorError::Load("`xmin` exceeds `xmax`".into()));
        }

        let num_blocks = (1..).take_while(|i| root.contains(&format!("MVM{i}"))).count();
        if num_blocks == 0 {
            return Err(EmulatorError::Load("no regression blocks (`MVM1`)".into()));
        }
        if num_blocks > MAX_BLOCKS {
            return Err(EmulatorError::Load(format!(
                "{num_blocks} regression blocks, at most {MAX_BLOCKS} are supported"
            )));
        }
        for name in root.names() {
            let is_block = name
                .strip_prefix("MVM")
                .and_then(|n| n.parse::<usize>().ok())
                .is_some_and(|n| (1..=num_blocks).contains(&n));
            if !is_block && !RESERVED_KEYS.contains(&name) {
                debug!("ignoring model file entry `{name}`");
            }
        }

        let codes = root.matrix("input_transfs")?;
        if codes.shape() != [num_blocks, num_inputs] {
            return Err(EmulatorError::Load(format!(
                "`input_transfs` has shape {:?}, expected [{num_blocks}, {num_inputs}]",
                codes.shape()
            )));
        }

        let blocks = (0..num_blocks)
            .map(|b| {
                let name = format!("MVM{}", b + 1);
                let transforms = codes
                    .row(b)
                    .iter()
                    .map(|&c| {
                        if c.fract() != 0. {
                            return Err(EmulatorError::Load(format!(
                                "non-integer input transform code {c}"
                            )));
                        }
                        InputTransform::try_from(c as i64)
                    })
                    .collect::<Result<_>>()?;
                read_block(root.group(&name)?, name, transforms, num_inputs, wavelengths.len())
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "loaded emulator: {num_inputs} inputs, {} wavelengths, {num_blocks} blocks",
            wavelengths.len()
        );

        Ok(Self {
            wavelengths,
            input_indices,
            bound_min,
            bound_max,
            blocks,
        })
    }

    /// Number of inputs.
    pub fn num_inputs(&self) -> usize {
        self.input_indices.len()
    }
}

fn read_block(
    group: GroupRef<'_>,
    name: String,
    transforms: SmallVec<[InputTransform; 8]>,
    num_inputs: usize,
    num_wavelengths: usize,
) -> Result<RegressionBlock> {
    let num_components = (1..).take_while(|i| group.contains(&format!("M{i}"))).count();
    if num_components == 0 {
        return Err(EmulatorError::Load(format!(
            "`{}` has no kernel components (`M1`)",
            group.path()
        )));
    }

    let g = group.group("G")?;
    let xmean = g.vector("Xmean")?;
    let xstd = g.vector("Xstd")?;
    check_len(&g, "Xmean", xmean.len(), num_inputs)?;
    check_len(&g, "Xstd", xstd.len(), num_inputs)?;

    let yproj = read_eigenpair(&g, "Yproj")?;
    if yproj.vectors.shape() != [num_components, num_wavelengths] {
        return Err(EmulatorError::Load(format!(
            "`{}/Yproj/vectors` has shape {:?}, expected [{num_components}, {num_wavelengths}]",
            g.path(),
            yproj.vectors.shape()
        )));
    }
    let ymean = g.vector("Ymean")?;
    check_len(&g, "Ymean", ymean.len(), num_wavelengths)?;
    let ystd = g.vector("Ystd")?;
    if ystd.len() != 1 {
        check_len(&g, "Ystd", ystd.len(), num_wavelengths)?;
    }

    let mut xproj = Vec::with_capacity(num_components);
    let mut components = Vec::with_capacity(num_components);
    for i in 1..=num_components {
        let proj = read_eigenpair(&g, &format!("Xproj{i}"))?;
        if proj.vectors.ncols() != num_inputs {
            return Err(EmulatorError::Load(format!(
                "`{}/Xproj{i}/vectors` has {} columns for {num_inputs} inputs",
                g.path(),
                proj.vectors.ncols()
            )));
        }
        let component = read_component(&group.group(&format!("M{i}"))?, proj.values.len())?;
        xproj.push(proj);
        components.push(component);
    }

    Ok(RegressionBlock {
        name,
        components,
        reduction: Reduction {
            xproj,
            xmean,
            xstd,
            yproj,
            ymean,
            ystd,
        },
        transforms,
    })
}

/// Read a component. The training inputs are stored transposed, as
/// (`num_reduced`, `num_train`).
fn read_component(m: &GroupRef<'_>, num_reduced: usize) -> Result<KernelComponent> {
    let z_train = m.matrix("Z")?.reversed_axes();
    if z_train.ncols() != num_reduced {
        return Err(EmulatorError::Load(format!(
            "`{}/Z` has {} reduced dimensions, the projection has {num_reduced}",
            m.path(),
            z_train.ncols()
        )));
    }

    let lambda = m.vector("lambda")?;
    if lambda.len() != 1 {
        check_len(m, "lambda", lambda.len(), num_reduced)?;
    }

    let theta = m.vector("theta")?;
    let theta: [f64; 3] = theta.as_slice().and_then(|t| t.try_into().ok()).ok_or_else(|| {
        EmulatorError::Load(format!(
            "`{}/theta` has {} entries, expected 3",
            m.path(),
            theta.len()
        ))
    })?;

    let weights = m.vector("h")?;
    check_len(m, "h", weights.len(), z_train.nrows())?;

    Ok(KernelComponent {
        z_train,
        lambda,
        theta,
        weights,
    })
}

fn read_eigenpair(g: &GroupRef<'_>, name: &str) -> Result<Eigenpair> {
    let group = g.group(name)?;
    let vectors = group.matrix("vectors")?;
    let values = group.vector("values")?;
    check_len(&group, "values", values.len(), vectors.nrows())?;
    if values.iter().any(|&v| v == 0.) {
        return Err(EmulatorError::Load(format!(
            "`{}/values` contains a zero eigenvalue",
            group.path()
        )));
    }
    Ok(Eigenpair { vectors, values })
}

fn check_len(group: &GroupRef<'_>, name: &str, actual: usize, expected: usize) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(EmulatorError::Load(format!(
            "`{}/{name}` has {actual} entries, expected {expected}",
            group.path()
        )))
    }
}

//! Kernel regression in the reduced input space.
//!
//! Each component of a regression block is a Gaussian-process style model
//! with a Matérn 3/2 plus linear kernel. The test inputs are standardized and
//! projected onto the component's input eigenvectors, scaled by the length
//! scale, and compared against the stored reduced training inputs.

use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};

use super::model::{Eigenpair, KernelComponent, RegressionBlock};
use crate::error::{EmulatorError, Result};

/// Standardize `points` and project them into a reduced space:
/// `((x - mean) / std) · (vectors / values)ᵀ`.
pub(crate) fn reduce_points(
    points: ArrayView2<'_, f64>,
    projection: &Eigenpair,
    mean: &Array1<f64>,
    std: &Array1<f64>,
) -> Result<Array2<f64>> {
    let num_inputs = points.ncols();
    if mean.len() != num_inputs || std.len() != num_inputs {
        return Err(EmulatorError::shape(
            "input standardization",
            [num_inputs],
            [mean.len().max(std.len())],
        ));
    }
    if projection.vectors.ncols() != num_inputs {
        return Err(EmulatorError::shape(
            "input projection",
            [projection.vectors.nrows(), num_inputs],
            projection.vectors.shape(),
        ));
    }
    if projection.values.len() != projection.vectors.nrows() {
        return Err(EmulatorError::shape(
            "input eigenvalues",
            [projection.vectors.nrows()],
            [projection.values.len()],
        ));
    }

    let standardized = (&points - &mean.view().insert_axis(Axis(0))) / std;
    let h = &projection.vectors.t() / &projection.values.view().insert_axis(Axis(0));
    Ok(standardized.dot(&h))
}

/// Cross covariance between reduced test points and the component's training
/// points, shaped (`num_test`, `num_train`).
///
/// With `d` the Euclidean distance and `θ` the hyperparameters:
/// `k = θ₀ (1 + d') exp(-d') + θ₂ (train · test)`, where `d' = √3 d / θ₁`.
pub(crate) fn cross_covariance(
    z_test: ArrayView2<'_, f64>,
    component: &KernelComponent,
) -> Result<Array2<f64>> {
    let z_train = &component.z_train;
    if z_test.ncols() != z_train.ncols() {
        return Err(EmulatorError::shape(
            "reduced test inputs",
            [z_test.nrows(), z_train.ncols()],
            z_test.shape(),
        ));
    }

    let [scale, length, linear] = component.theta;
    let matern_factor = f64::sqrt(3.0) / length;

    let mut k = z_test.dot(&z_train.t());
    k.mapv_inplace(|dot| linear * dot);

    for (mut k_row, test) in k.outer_iter_mut().zip(z_test.outer_iter()) {
        Zip::from(&mut k_row)
            .and(z_train.rows())
            .for_each(|k, train| {
                let d = Zip::from(&test)
                    .and(&train)
                    .fold(0.0, |acc, a, b| acc + (a - b).powi(2))
                    .sqrt();
                let d = matern_factor * d;
                *k += scale * (1.0 + d) * (-d).exp();
            });
    }
    Ok(k)
}

/// Predict one reduced output column for already-transformed `points`.
pub(crate) fn predict_component(
    points: ArrayView2<'_, f64>,
    component: &KernelComponent,
    projection: &Eigenpair,
    mean: &Array1<f64>,
    std: &Array1<f64>,
) -> Result<Array1<f64>> {
    let mut z_test = reduce_points(points, projection, mean, std)?;

    let num_reduced = z_test.ncols();
    match component.lambda.len() {
        1 => z_test *= component.lambda[0],
        n if n == num_reduced => z_test *= &component.lambda.view().insert_axis(Axis(0)),
        n => {
            return Err(EmulatorError::shape(
                "kernel length scale",
                [num_reduced],
                [n],
            ))
        }
    }

    if component.weights.len() != component.z_train.nrows() {
        return Err(EmulatorError::shape(
            "kernel weights",
            [component.z_train.nrows()],
            [component.weights.len()],
        ));
    }

    let k = cross_covariance(z_test.view(), component)?;
    Ok(k.dot(&component.weights))
}

/// Predict all reduced output columns of a block, shaped (`num_points`,
/// `num_components`).
///
/// The block's input transforms are applied to a private copy of `points`.
pub(crate) fn predict_block(
    points: ArrayView2<'_, f64>,
    block: &RegressionBlock,
) -> Result<Array2<f64>> {
    if points.ncols() != block.transforms.len() {
        return Err(EmulatorError::shape(
            format!("{} inputs", block.name),
            [points.nrows(), block.transforms.len()],
            points.shape(),
        ));
    }

    let mut transformed = points.to_owned();
    for (column, transform) in transformed.columns_mut().into_iter().zip(&block.transforms) {
        transform.apply_inplace(column);
    }

    let reduction = &block.reduction;
    if reduction.xproj.len() != block.components.len() {
        return Err(EmulatorError::shape(
            format!("{} input projections", block.name),
            [block.components.len()],
            [reduction.xproj.len()],
        ));
    }

    let mut reduced = Array2::zeros([points.nrows(), block.components.len()]);
    for ((mut column, component), projection) in reduced
        .columns_mut()
        .into_iter()
        .zip(&block.components)
        .zip(&reduction.xproj)
    {
        let prediction = predict_component(
            transformed.view(),
            component,
            projection,
            &reduction.xmean,
            &reduction.xstd,
        )?;
        column.assign(&prediction);
    }
    Ok(reduced)
}

use std::sync::atomic::{AtomicBool, Ordering};

use approx::{assert_abs_diff_eq, assert_relative_eq};
use ndarray::{array, Array1, Array2};

use super::*;
use crate::config::{EngineConfig, SensorGrid};

const NUM_NATIVE: usize = 31;

fn native_wl() -> Array1<f64> {
    Array1::linspace(400.0, 700.0, NUM_NATIVE)
}

fn sensor() -> (Array1<f64>, Array1<f64>) {
    (array![450.0, 550.0, 650.0], array![10.0, 10.0, 10.0])
}

/// One regression block with a single component over a single input.
fn toy_block(ystd: Node) -> Node {
    let m1 = Node::group()
        .with("Z", array![[-1.0, 0.0, 1.0]])
        .with("lambda", array![1.0])
        .with("theta", array![1.0, 1.0, 0.1])
        .with("h", array![0.2, -0.1, 0.3]);

    let eigen = |vectors: Array2<f64>| {
        Node::group()
            .with("vectors", vectors)
            .with("values", array![1.0])
    };
    let g = Node::group()
        .with("Xproj1", eigen(array![[1.0]]))
        .with("Xmean", array![0.5])
        .with("Xstd", array![0.25])
        .with("Yproj", eigen(Array2::from_elem([1, NUM_NATIVE], 0.1)))
        .with("Ymean", Array1::from_elem(NUM_NATIVE, 0.05))
        .with("Ystd", ystd);

    Node::group().with("M1", m1).with("G", g)
}

fn toy_tree(num_blocks: usize, transform_code: f64) -> Node {
    let mut tree = Node::group()
        .with("wls", native_wl())
        .with("inputdims", array![2.0])
        .with("xmin", array![0.0])
        .with("xmax", array![1.0])
        .with(
            "input_transfs",
            Array2::from_elem([num_blocks, 1], transform_code),
        )
        .with("Ylabels", array![0.0]);
    for b in 1..=num_blocks {
        tree = tree.with(format!("MVM{b}"), toy_block(Node::from(0.5)));
    }
    tree
}

fn engine_for(tree: &Node, grid: SamplingGrid) -> Result<KernelFlowsEngine> {
    let (wl, fwhm) = sensor();
    KernelFlowsEngine::new(
        EmulatorModel::from_tree(tree)?,
        &KeyRegistry::builtin(),
        grid,
        wl.view(),
        fwhm.view(),
    )
}

fn toy_engine(num_blocks: usize) -> KernelFlowsEngine {
    let grid = SamplingGrid::new().with("H2OSTR", vec![0.25, 0.5, 0.75]);
    engine_for(&toy_tree(num_blocks, 1.0), grid).unwrap()
}

/// Expected rhoatm at x = 0.5 for the toy block: the reduced test point is 0,
/// so the distances to the training points are 1, 0, 1 and the linear term
/// vanishes.
fn expected_toy_value() -> f64 {
    let d = f64::sqrt(3.0);
    let a = (1.0 + d) * (-d).exp();
    let reduced = 0.2 * a - 0.1 + 0.3 * a;
    // projected: 0.1 * reduced, times Ystd, plus Ymean
    0.1 * reduced * 0.5 + 0.05
}

#[test]
fn single_block_end_to_end() {
    let engine = toy_engine(1);
    let result = engine.read_sim(array![0.5].view()).unwrap();

    assert_eq!(result.num_points(), 1);
    assert_eq!(result.wl, sensor().0);
    assert_eq!(result.solar_irr.len(), 3);
    assert!(result.solar_irr.iter().all(|&x| x == 0.0));
    for quantity in Quantity::ALL {
        assert_eq!(result.get(quantity).shape(), [1, 3], "{}", quantity.name());
    }

    for &value in result.rhoatm.iter() {
        assert!(value.is_finite());
        assert_relative_eq!(value, expected_toy_value(), epsilon = 1e-12);
    }
    for quantity in &Quantity::ALL[1..] {
        assert!(
            result.get(*quantity).iter().all(|&x| x == 0.0),
            "{} should be zero",
            quantity.name()
        );
    }
}

#[test]
fn four_blocks_fill_modeled_quantities() {
    let engine = toy_engine(4);
    let result = engine.read_sim(array![0.5].view()).unwrap();
    let raw = expected_toy_value();

    for i in 0..3 {
        assert_relative_eq!(result.rhoatm[[0, i]], raw, epsilon = 1e-12);
        assert_relative_eq!(result.sphalb[[0, i]], raw, epsilon = 1e-12);
        assert_relative_eq!(result.transm_down_dir[[0, i]], raw.exp() - 0.1, epsilon = 1e-12);
        assert_relative_eq!(result.transm_down_dif[[0, i]], raw.exp() - 0.1, epsilon = 1e-12);
    }
    for quantity in [
        Quantity::TransmUpDir,
        Quantity::TransmUpDif,
        Quantity::ThermalUpwelling,
        Quantity::ThermalDownwelling,
    ] {
        assert!(result.get(quantity).iter().all(|&x| x == 0.0));
    }
}

#[test]
fn out_of_bounds_point_is_rejected() {
    let engine = toy_engine(1);
    let err = engine.read_sim(array![1.5].view()).unwrap_err();
    match &err {
        EmulatorError::Bounds {
            names,
            point,
            below,
            above,
            ..
        } => {
            assert_eq!(names, &["H2OSTR".to_string()]);
            assert_eq!(point, &[1.5]);
            assert_eq!(below, &[false]);
            assert_eq!(above, &[true]);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(err.violating_dimensions(), vec![0]);

    assert!(matches!(
        engine.read_sim(array![-0.1].view()),
        Err(EmulatorError::Bounds { .. })
    ));
    assert!(matches!(
        engine.read_sim(array![f64::NAN].view()),
        Err(EmulatorError::Bounds { .. })
    ));
}

#[test]
fn bounds_are_inclusive() {
    let engine = toy_engine(1);
    for x in [0.0, 1.0] {
        let result = engine.read_sim(array![x].view()).unwrap();
        assert!(result.rhoatm.iter().all(|v| v.is_finite()));
    }
}

#[test]
fn batch_with_one_bad_point_fails() {
    let engine = toy_engine(1);
    assert!(matches!(
        engine.predict(array![[0.2], [0.4], [3.0]].view()),
        Err(EmulatorError::Bounds { .. })
    ));
}

#[test]
fn wrong_point_width_is_shape_error() {
    let engine = toy_engine(1);
    assert!(matches!(
        engine.predict(array![[0.2, 0.3]].view()),
        Err(EmulatorError::Shape { .. })
    ));
}

#[test]
fn grid_points_and_parallel_evaluation() {
    let engine = toy_engine(2);
    assert_eq!(engine.emulator_names(), ["H2OSTR".to_string()]);
    assert_eq!(engine.points(), array![[0.25], [0.5], [0.75]]);

    let serial = engine.predict(engine.points()).unwrap();
    let parallel = engine.simulate_grid(Some(2)).unwrap();
    assert_eq!(parallel.num_points(), 3);
    for quantity in Quantity::ALL {
        for (a, b) in serial.get(quantity).iter().zip(parallel.get(quantity)) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    // Each point only depends on itself
    let single = engine.read_sim(array![0.5].view()).unwrap();
    assert_abs_diff_eq!(single.rhoatm[[0, 1]], serial.rhoatm[[1, 1]], epsilon = 1e-12);
}

#[test]
fn single_value_grid_is_widened_by_engine() {
    let grid = SamplingGrid::new().with("H2OSTR", vec![0.5]);
    let engine = engine_for(&toy_tree(1, 1.0), grid).unwrap();
    assert_eq!(engine.points().nrows(), 3);
    assert_relative_eq!(engine.points()[[0, 0]], 0.495, epsilon = 1e-12);
    assert_relative_eq!(engine.points()[[2, 0]], 0.505, epsilon = 1e-12);
}

#[test]
fn missing_grid_uses_default() {
    let grid = SamplingGrid::new().with("AOT550", vec![0.1, 0.2]);
    let engine = engine_for(&toy_tree(1, 1.0), grid).unwrap();
    assert_eq!(engine.points(), array![[0.05]]);
    assert_eq!(engine.lut_grid().get("H2OSTR"), Some(&[0.05][..]));
    assert_eq!(engine.lut_grid().get("AOT550"), Some(&[0.1, 0.2][..]));
}

#[test]
fn log_transform_is_applied_to_a_copy() {
    let identity = engine_for(&toy_tree(1, 1.0), SamplingGrid::new()).unwrap();
    let log = engine_for(&toy_tree(1, 2.0), SamplingGrid::new()).unwrap();

    let points = array![[0.5]];
    let a = identity.predict(points.view()).unwrap();
    let b = log.predict(points.view()).unwrap();
    assert_eq!(points, array![[0.5]]);
    assert!(b.rhoatm.iter().all(|v| v.is_finite()));
    assert!((a.rhoatm[[0, 0]] - b.rhoatm[[0, 0]]).abs() > 1e-6);
}

#[test]
fn spectral_std_matches_scalar_std() {
    let mut tree = toy_tree(0, 1.0)
        .with("input_transfs", array![[1.0]])
        .with(
            "MVM1",
            toy_block(Node::from(Array1::from_elem(NUM_NATIVE, 0.5))),
        );
    let vector_std = engine_for(&tree, SamplingGrid::new()).unwrap();
    tree = tree.with("MVM1", toy_block(Node::from(0.5)));
    let scalar_std = engine_for(&tree, SamplingGrid::new()).unwrap();

    let a = vector_std.read_sim(array![0.3].view()).unwrap();
    let b = scalar_std.read_sim(array![0.3].view()).unwrap();
    for (a, b) in a.rhoatm.iter().zip(&b.rhoatm) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-12);
    }
}

#[test]
fn malformed_models_fail_to_load() {
    // Missing wavelength axis
    let tree = match toy_tree(1, 1.0) {
        Node::Group(mut members) => {
            members.remove("wls");
            Node::Group(members)
        }
        node => node,
    };
    assert!(matches!(
        EmulatorModel::from_tree(&tree),
        Err(EmulatorError::Load(_))
    ));

    // Unknown transform code
    assert!(matches!(
        EmulatorModel::from_tree(&toy_tree(1, 7.0)),
        Err(EmulatorError::Load(_))
    ));

    // Too many blocks
    assert!(matches!(
        EmulatorModel::from_tree(&toy_tree(5, 1.0)),
        Err(EmulatorError::Load(_))
    ));

    // No blocks
    assert!(matches!(
        EmulatorModel::from_tree(&toy_tree(0, 1.0)),
        Err(EmulatorError::Load(_))
    ));

    // Bounds with the wrong length
    let tree = toy_tree(1, 1.0).with("xmax", array![1.0, 2.0]);
    assert!(matches!(
        EmulatorModel::from_tree(&tree),
        Err(EmulatorError::Load(_))
    ));

    // Training inputs that don't match the projection
    let block = toy_block(Node::from(0.5));
    let block = match block {
        Node::Group(mut members) => {
            members.insert(
                "M1".into(),
                Node::group()
                    .with("Z", array![[0.0, 1.0], [1.0, 0.0]])
                    .with("lambda", array![1.0])
                    .with("theta", array![1.0, 1.0, 0.1])
                    .with("h", array![1.0, 1.0]),
            );
            Node::Group(members)
        }
        node => node,
    };
    let tree = toy_tree(1, 1.0).with("MVM1", block);
    assert!(matches!(
        EmulatorModel::from_tree(&tree),
        Err(EmulatorError::Load(_))
    ));
}

#[test]
fn loaded_model_layout() {
    let model = EmulatorModel::from_tree(&toy_tree(3, 1.0)).unwrap();
    assert_eq!(model.num_inputs(), 1);
    assert_eq!(model.wavelengths.len(), NUM_NATIVE);
    assert_eq!(model.blocks.len(), 3);
    assert_eq!(model.blocks[2].name, "MVM3");
    assert_eq!(model.blocks[0].components[0].z_train.shape(), [3, 1]);
    assert_eq!(model.blocks[0].transforms.as_slice(), [InputTransform::Identity]);
}

#[test]
fn unknown_input_index_is_config_error() {
    let tree = toy_tree(1, 1.0).with("inputdims", array![42.0]);
    assert!(matches!(
        engine_for(&tree, SamplingGrid::new()),
        Err(EmulatorError::Config(_))
    ));
}

#[test]
fn missing_required_input_is_config_error() {
    // observer_azimuth has no scalar default
    let tree = toy_tree(1, 1.0).with("inputdims", array![9.0]);
    match engine_for(&tree, SamplingGrid::new()) {
        Err(EmulatorError::Config(msg)) => assert!(msg.contains("observer_azimuth")),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn template_default_fills_geometry_input() {
    let template = GeometryTemplate::from_yaml_str(
        "MODTRAN:\n  - MODTRANINPUT:\n      GEOMETRY:\n        PARM2: 0.4\n",
    )
    .unwrap();
    let registry = KeyRegistry::builtin().with_template(&template);

    // solar_zenith is input index 5
    let tree = toy_tree(1, 1.0).with("inputdims", array![5.0]);
    let (wl, fwhm) = sensor();
    let engine = KernelFlowsEngine::new(
        EmulatorModel::from_tree(&tree).unwrap(),
        &registry,
        SamplingGrid::new(),
        wl.view(),
        fwhm.view(),
    )
    .unwrap();
    assert_eq!(engine.emulator_names(), ["solar_zenith".to_string()]);
    assert_eq!(engine.points(), array![[0.4]]);
    assert!(engine.simulate_grid(None).is_ok());
}

/// One kernel component of the two-input model, stored the way the model
/// file lays it out.
struct StoredComponent {
    /// (`num_reduced`, `num_inputs`)
    xproj: Array2<f64>,
    values: Array1<f64>,
    /// (`num_reduced`, `num_train`)
    z: Array2<f64>,
    lambda: Array1<f64>,
    theta: [f64; 3],
    h: Array1<f64>,
}

const TWO_INPUT_XMEAN: [f64; 2] = [0.5, 0.6];
const TWO_INPUT_XSTD: [f64; 2] = [0.25, 0.3];

fn two_input_components() -> Vec<StoredComponent> {
    vec![
        StoredComponent {
            xproj: array![[0.8, -0.6]],
            values: array![2.0],
            z: array![[-0.5, 0.0, 0.7]],
            lambda: array![1.5],
            theta: [1.2, 0.9, 0.05],
            h: array![0.3, -0.2, 0.4],
        },
        StoredComponent {
            xproj: array![[0.6, 0.8], [0.3, -0.9]],
            values: array![1.5, 0.5],
            z: array![[-1.0, 0.2, 0.5, 1.0], [0.3, -0.4, 0.0, 0.8]],
            lambda: array![0.7, 1.3],
            theta: [0.8, 1.4, 0.1],
            h: array![0.1, 0.25, -0.15, 0.2],
        },
    ]
}

fn two_input_yproj() -> (Array2<f64>, Array1<f64>) {
    let vectors = Array2::from_shape_fn([2, NUM_NATIVE], |(c, j)| match c {
        0 => 0.1 + 0.01 * j as f64,
        _ => 0.2 * (0.7 * j as f64).sin(),
    });
    (vectors, array![1.3, 0.4])
}

fn two_input_ymean() -> Array1<f64> {
    Array1::from_shape_fn(NUM_NATIVE, |j| 0.05 + 0.001 * j as f64)
}

fn two_input_ystd() -> Array1<f64> {
    Array1::from_shape_fn(NUM_NATIVE, |j| if j % 2 == 0 { 0.1 } else { 3.0 })
}

/// H2OSTR (identity) and observer zenith (cosine of degrees), one block.
fn two_input_tree() -> Node {
    let eigen = |vectors: &Array2<f64>, values: &Array1<f64>| {
        Node::group()
            .with("vectors", vectors.clone())
            .with("values", values.clone())
    };

    let (yvectors, yvalues) = two_input_yproj();
    let mut g = Node::group()
        .with("Xmean", Array1::from(TWO_INPUT_XMEAN.to_vec()))
        .with("Xstd", Array1::from(TWO_INPUT_XSTD.to_vec()))
        .with("Yproj", eigen(&yvectors, &yvalues))
        .with("Ymean", two_input_ymean())
        .with("Ystd", two_input_ystd());
    let mut block = Node::group();
    for (i, c) in two_input_components().iter().enumerate() {
        g = g.with(format!("Xproj{}", i + 1), eigen(&c.xproj, &c.values));
        block = block.with(
            format!("M{}", i + 1),
            Node::group()
                .with("Z", c.z.clone())
                .with("lambda", c.lambda.clone())
                .with("theta", Array1::from(c.theta.to_vec()))
                .with("h", c.h.clone()),
        );
    }

    Node::group()
        .with("wls", native_wl())
        .with("inputdims", array![2.0, 6.0])
        .with("xmin", array![0.0, 0.0])
        .with("xmax", array![1.0, 60.0])
        .with("input_transfs", array![[1.0, 3.0]])
        .with("MVM1", block.with("G", g))
}

/// rhoatm per channel, evaluated element by element in the stored layout.
fn two_input_reference(point: [f64; 2], srf: &Array2<f64>) -> Vec<f64> {
    let transformed = [point[0], point[1].to_radians().cos()];
    let standardized: Vec<f64> = (0..2)
        .map(|i| (transformed[i] - TWO_INPUT_XMEAN[i]) / TWO_INPUT_XSTD[i])
        .collect();

    let reduced: Vec<f64> = two_input_components()
        .iter()
        .map(|c| {
            let num_reduced = c.values.len();
            let z_test: Vec<f64> = (0..num_reduced)
                .map(|k| {
                    let proj = (0..2)
                        .map(|i| standardized[i] * c.xproj[[k, i]])
                        .sum::<f64>()
                        / c.values[k];
                    let lambda = if c.lambda.len() == 1 {
                        c.lambda[0]
                    } else {
                        c.lambda[k]
                    };
                    proj * lambda
                })
                .collect();
            (0..c.z.ncols())
                .map(|n| {
                    let d2: f64 = (0..num_reduced)
                        .map(|k| (c.z[[k, n]] - z_test[k]).powi(2))
                        .sum();
                    let d = f64::sqrt(3.0) * d2.sqrt() / c.theta[1];
                    let dot: f64 = (0..num_reduced).map(|k| c.z[[k, n]] * z_test[k]).sum();
                    (c.theta[0] * (1.0 + d) * (-d).exp() + c.theta[2] * dot) * c.h[n]
                })
                .sum()
        })
        .collect();

    let (yvectors, yvalues) = two_input_yproj();
    let (ystd, ymean) = (two_input_ystd(), two_input_ymean());
    let native: Vec<f64> = (0..NUM_NATIVE)
        .map(|j| {
            let y: f64 = (0..2).map(|c| reduced[c] * yvectors[[c, j]] * yvalues[c]).sum();
            y * ystd[j] + ymean[j]
        })
        .collect();
    srf.outer_iter()
        .map(|row| row.iter().zip(&native).map(|(w, v)| w * v).sum())
        .collect()
}

#[test]
fn two_input_model_matches_elementwise_evaluation() {
    let grid = SamplingGrid::new()
        .with("H2OSTR", vec![0.2, 0.8])
        .with("observer_zenith", vec![10.0, 40.0]);
    let engine = engine_for(&two_input_tree(), grid).unwrap();
    assert_eq!(
        engine.emulator_names(),
        ["H2OSTR".to_string(), "observer_zenith".to_string()]
    );
    assert_eq!(
        engine.points(),
        array![[0.2, 10.0], [0.2, 40.0], [0.8, 10.0], [0.8, 40.0]]
    );

    let (wl, fwhm) = sensor();
    let srf = spectral_response_matrix(native_wl().view(), wl.view(), fwhm.view()).unwrap();
    let result = engine.predict(engine.points()).unwrap();
    assert_eq!(result.rhoatm.shape(), [4, 3]);
    for (row, point) in result.rhoatm.outer_iter().zip(engine.points().outer_iter()) {
        let expected = two_input_reference([point[0], point[1]], &srf);
        for (&actual, &expected) in row.iter().zip(&expected) {
            assert_relative_eq!(actual, expected, epsilon = 1e-12, max_relative = 1e-10);
        }
    }
}

#[test]
fn config_thread_count_drives_grid_simulation() {
    let config = EngineConfig::from_yaml_str(
        "emulator_file: emulator.h5\nnum_threads: 2\nlut_grid:\n  H2OSTR: [0.25, 0.5, 0.75]\n",
    )
    .unwrap();
    let (wl, fwhm) = sensor();
    let sensor = SensorGrid::new(wl, fwhm).unwrap();
    let engine = config
        .engine_with_model(EmulatorModel::from_tree(&toy_tree(1, 1.0)).unwrap(), &sensor)
        .unwrap();

    let result = config.simulate(&engine).unwrap();
    assert_eq!(result.num_points(), 3);
    assert_relative_eq!(result.rhoatm[[1, 0]], expected_toy_value(), epsilon = 1e-12);
}

#[test]
fn cancelled_batch_stops_early() {
    let engine = toy_engine(1);
    let cancelled = AtomicBool::new(true);
    assert!(matches!(
        engine.predict_cancellable(engine.points(), Some(2), &cancelled),
        Err(EmulatorError::Cancelled)
    ));

    cancelled.store(false, Ordering::Relaxed);
    let result = engine
        .predict_cancellable(engine.points(), Some(2), &cancelled)
        .unwrap();
    assert_eq!(result.num_points(), 3);
}

//! End-to-end training scenarios on small synthetic graphs.

use std::collections::HashMap;

use candle_core::{Device, Tensor};
use lattix_invariant::importance::{column_importance, normalize_importance};
use lattix_invariant::{
    Baseline, DatasetKind, EdgeIndex, EncoderKind, Error, GraphData, InvarianceConfig,
    InvarianceModel, LossCriterion, PerturbationMode, Step, StepOutput, Trainer, VarianceMode,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `n` nodes on a cycle, `d` features, labels alternating over `c` classes.
fn cycle_graph(n: usize, d: usize, c: u32) -> GraphData {
    let device = Device::Cpu;
    let x = Tensor::randn(0f32, 1f32, (n, d), &device).unwrap();
    let y: Vec<u32> = (0..n as u32).map(|i| i % c).collect();
    let y = Tensor::from_vec(y, (n, 1), &device).unwrap();
    GraphData::new(x, EdgeIndex::cycle(n), y, DatasetKind::default()).unwrap()
}

fn config() -> InvarianceConfig {
    InvarianceConfig::default()
        .with_hidden_channels(8)
        .with_num_envs(2)
}

fn scalar(output: &StepOutput) -> f32 {
    output.loss().unwrap().to_scalar::<f32>().unwrap()
}

/// Name to (shape, flattened values) for every variable of the model.
fn snapshot(model: &InvarianceModel) -> HashMap<String, (Vec<usize>, Vec<f32>)> {
    let data = model.varmap().data().lock().unwrap();
    data.iter()
        .map(|(name, var)| {
            let values = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            (name.clone(), (var.dims().to_vec(), values))
        })
        .collect()
}

#[test]
fn steps_one_to_five_are_finite() {
    init_tracing();
    let graph = cycle_graph(4, 3, 2);
    let mut model = InvarianceModel::new(config(), 4, 2, 3, &Device::Cpu).unwrap();
    model.initialize_environment_adjacency(&graph).unwrap();

    for step in Step::OBJECTIVES {
        let out = model.forward(&graph, LossCriterion::Nll, step).unwrap();
        assert!(scalar(&out).is_finite(), "step {} not finite", step.index());
    }

    match model.forward(&graph, LossCriterion::Nll, Step::Dependence).unwrap() {
        StepOutput::WithReconstruction { reconstruction, .. } => {
            assert_eq!(reconstruction.dims(), &[4, 3]);
        }
        other => panic!("unexpected step 3 output {other:?}"),
    }
}

#[test]
fn variance_term_is_non_negative() {
    let graph = cycle_graph(6, 4, 2);
    for mode in [VarianceMode::Risk, VarianceMode::Ene] {
        let mut model =
            InvarianceModel::new(config().with_variance_mode(mode), 6, 2, 4, &Device::Cpu).unwrap();
        model.initialize_environment_adjacency(&graph).unwrap();
        model.perturb(&graph).unwrap();

        let terms = model.variance_objective(&graph, LossCriterion::Nll).unwrap();
        let variance = terms.variance.to_scalar::<f32>().unwrap();
        assert!(variance >= 0.0 && variance.is_finite());
    }
}

#[test]
fn single_environment_has_zero_variance() {
    let graph = cycle_graph(4, 3, 2);
    let mut model =
        InvarianceModel::new(config().with_num_envs(1), 4, 2, 3, &Device::Cpu).unwrap();
    model.initialize_environment_adjacency(&graph).unwrap();
    let terms = model.variance_objective(&graph, LossCriterion::Nll).unwrap();
    assert_eq!(terms.variance.to_scalar::<f32>().unwrap(), 0.0);
}

#[test]
fn tied_heads_give_zero_penalty() {
    let graph = cycle_graph(5, 3, 2);
    let mut model = InvarianceModel::new(config(), 5, 2, 3, &Device::Cpu).unwrap();
    model.set_training(false);
    for head in model.env_heads() {
        head.copy_from(model.head()).unwrap();
    }

    let terms = model.invariance_terms(&graph, LossCriterion::Nll).unwrap();
    let penalty = terms.penalty.to_scalar::<f32>().unwrap();
    assert!(penalty.abs() < 1e-6, "penalty {penalty}");
    assert_eq!(
        terms.objective.to_scalar::<f32>().unwrap(),
        terms.main_risk.to_scalar::<f32>().unwrap()
    );
}

#[test]
fn environment_risk_ignores_node_order() {
    let device = Device::Cpu;
    let graph = cycle_graph(6, 3, 2);
    let model = InvarianceModel::new(config(), 6, 2, 3, &device).unwrap();
    let before = model
        .environment_risk(&graph, LossCriterion::Nll)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();

    // relabel node i as perm[i]
    let perm: [u32; 6] = [3, 0, 5, 1, 4, 2];
    let mut inverse = [0u32; 6];
    for (i, &p) in perm.iter().enumerate() {
        inverse[p as usize] = i as u32;
    }
    let idx = Tensor::new(&inverse, &device).unwrap();
    let features = graph.features.index_select(&idx, 0).unwrap();
    let labels = graph.labels.index_select(&idx, 0).unwrap();
    let pairs: Vec<_> = graph
        .edges
        .pairs()
        .map(|(s, t)| (perm[s as usize], perm[t as usize]))
        .collect();
    let permuted = GraphData::new(features, EdgeIndex::from_pairs(&pairs), labels, DatasetKind::default())
        .unwrap();

    let after = model
        .environment_risk(&permuted, LossCriterion::Nll)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!((before - after).abs() < 1e-4, "{before} vs {after}");
}

#[test]
fn reset_changes_weights() {
    let graph = cycle_graph(4, 3, 2);
    let mut model = InvarianceModel::new(config(), 4, 2, 3, &Device::Cpu).unwrap();
    let before = model.infer(&graph, false).unwrap().to_vec2::<f32>().unwrap();
    model.reset_parameters().unwrap();
    let after = model.infer(&graph, false).unwrap().to_vec2::<f32>().unwrap();
    assert_ne!(before, after);
}

#[test]
fn reset_redraws_every_weight_matrix() {
    let graph = cycle_graph(5, 4, 2);
    for kind in [
        EncoderKind::Gcn,
        EncoderKind::Sage,
        EncoderKind::Gat,
        EncoderKind::Gpr,
        EncoderKind::Gcnii,
    ] {
        let mut model =
            InvarianceModel::new(config().with_encoder(kind), 5, 2, 4, &Device::Cpu).unwrap();
        model.initialize_environment_adjacency(&graph).unwrap();
        let before = snapshot(&model);
        model.reset_parameters().unwrap();
        let after = snapshot(&model);

        assert_eq!(before.len(), after.len(), "{kind}");
        for (name, (dims, values)) in &before {
            let (new_dims, new_values) = &after[name];
            assert_eq!(dims, new_dims, "{kind}: {name} changed shape");
            // 1-D norm and bias constants keep their fixed defaults
            if dims.len() >= 2 {
                assert_ne!(values, new_values, "{kind}: {name} was not redrawn");
            }
        }
    }
}

#[test]
fn environment_risk_ignores_environment_order() {
    let graph = cycle_graph(6, 3, 2);
    let config = config().with_num_envs(3);
    let mut a = InvarianceModel::new(config.clone(), 6, 2, 3, &Device::Cpu).unwrap();
    let mut b = InvarianceModel::new(config, 6, 2, 3, &Device::Cpu).unwrap();
    a.set_training(false);
    b.set_training(false);

    // environment i of `a` becomes environment perm[i] of `b`
    let perm = [2usize, 0, 1];
    let mut inverse = [0u32; 3];
    for (i, &p) in perm.iter().enumerate() {
        inverse[p] = i as u32;
    }
    let inverse = Tensor::new(&inverse, &Device::Cpu).unwrap();

    let source = a.varmap().data().lock().unwrap();
    let target = b.varmap().data().lock().unwrap();
    for (name, var) in source.iter() {
        let (dest, value) = if let Some(rest) = name.strip_prefix("env_heads.") {
            let (i, tail) = rest.split_once('.').unwrap();
            let i: usize = i.parse().unwrap();
            (format!("env_heads.{}.{tail}", perm[i]), var.as_tensor().clone())
        } else if name.starts_with("env_classifier.lin2.") {
            (name.clone(), var.as_tensor().index_select(&inverse, 0).unwrap())
        } else {
            (name.clone(), var.as_tensor().clone())
        };
        target[&dest].set(&value).unwrap();
    }
    drop(source);
    drop(target);

    let risk_a = a
        .environment_risk(&graph, LossCriterion::Nll)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    let risk_b = b
        .environment_risk(&graph, LossCriterion::Nll)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!(
        (risk_a - risk_b).abs() <= 1e-5 * risk_a.abs().max(1.0),
        "{risk_a} vs {risk_b}"
    );
}

#[test]
fn partial_inference_hides_trailing_features() {
    let device = Device::Cpu;
    let graph = cycle_graph(4, 12, 2);
    let model = InvarianceModel::new(config(), 4, 2, 12, &device).unwrap();

    let partial = model.infer(&graph, true).unwrap();
    let zeroed = graph.features_without_trailing(10).unwrap();
    let manual = GraphData::new(zeroed, graph.edges.clone(), graph.labels.clone(), DatasetKind::default())
        .unwrap();
    let expected = model.infer(&manual, false).unwrap();

    assert_eq!(
        partial.to_vec2::<f32>().unwrap(),
        expected.to_vec2::<f32>().unwrap()
    );
}

#[test]
fn precondition_errors() {
    let graph = cycle_graph(4, 3, 2);
    let mut model = InvarianceModel::new(config(), 4, 2, 3, &Device::Cpu).unwrap();

    assert!(matches!(
        model.forward(&graph, LossCriterion::Nll, Step::Perturbation),
        Err(Error::EnvironmentNotInitialized)
    ));
    assert!(matches!(
        model.forward(&graph, LossCriterion::Nll, Step::Variance),
        Err(Error::EnvironmentNotInitialized)
    ));

    let wrong = cycle_graph(5, 3, 2);
    assert!(matches!(
        model.initialize_environment_adjacency(&wrong),
        Err(Error::DimensionMismatch { expected: 4, got: 5 })
    ));

    let bad_labels = cycle_graph(4, 3, 3);
    assert!(matches!(
        model.forward(&bad_labels, LossCriterion::Nll, Step::PartitionPenalty),
        Err(Error::LabelOutOfRange { label: 2, num_classes: 2 })
    ));

    assert!(matches!(
        "transformer".parse::<EncoderKind>(),
        Err(Error::Config(_))
    ));
}

#[test]
fn feature_mode_masks_num_sample_entries_per_row() {
    let graph = cycle_graph(5, 6, 2);
    let config = config()
        .with_perturbation(PerturbationMode::X)
        .with_num_sample(3);
    let mut model = InvarianceModel::new(config, 5, 2, 6, &Device::Cpu).unwrap();
    model.initialize_environment_adjacency(&graph).unwrap();

    let outcome = model.perturb(&graph).unwrap();
    let original = graph.features.to_vec2::<f32>().unwrap();
    for features in outcome.perturbed_features() {
        let masked = features.to_vec2::<f32>().unwrap();
        for (row, orig) in masked.iter().zip(&original) {
            let zeros = row.iter().zip(orig).filter(|(m, o)| **m == 0.0 && **o != 0.0).count();
            assert_eq!(zeros, 3);
        }
    }
}

#[test]
fn every_encoder_trains_one_epoch() {
    init_tracing();
    let graph = cycle_graph(6, 4, 2);
    for kind in [
        EncoderKind::Gcn,
        EncoderKind::Sage,
        EncoderKind::Gat,
        EncoderKind::Gpr,
        EncoderKind::Gcnii,
    ] {
        let model = InvarianceModel::new(config().with_encoder(kind), 6, 2, 4, &Device::Cpu).unwrap();
        let mut trainer = Trainer::new(model, &graph, 1).unwrap();
        let report = trainer.run_epoch(&graph, LossCriterion::Nll).unwrap();
        assert!(report.total().is_finite(), "{kind} produced a non-finite loss");
        assert!(report.perturbation_loss.is_some());
    }
}

#[test]
fn baseline_importance_is_normalized() {
    let graph = cycle_graph(6, 5, 2);
    let baseline = Baseline::new(config(), 6, 2, 5, &Device::Cpu).unwrap();
    let loss = baseline
        .loss(&graph, LossCriterion::Nll)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!(loss.is_finite());

    let importance = column_importance(&baseline, &graph, LossCriterion::Nll).unwrap();
    assert_eq!(importance.len(), 5);
    for v in normalize_importance(&importance) {
        assert!((0.0..=1.0).contains(&v));
    }
}

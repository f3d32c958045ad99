//! Tests for the model graph and the orchestrator

use super::*;
use crate::autograd::{Context, ConvGeometry};
use crate::lowrank::{InitMethod, LayerCommand, LowRankConfig, Phase};
use crate::nn::{Conv2d, Layer, Linear};
use crate::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn linear(n_in: usize, n_out: usize, seed: u64) -> Linear {
    Linear::new(n_in, n_out, true, &mut StdRng::seed_from_u64(seed))
}

/// model { fc, relu, block { fc, relu }, head }
fn mlp() -> Model {
    let mut model = Model::sequential();
    let root = model.root();
    model.push(root, "fc", linear(4, 6, 1)).unwrap();
    model.push(root, "relu", Layer::Relu).unwrap();
    let block = model.push(root, "block", Layer::Sequential).unwrap();
    model.push(block, "fc", linear(6, 6, 2)).unwrap();
    model.push(block, "relu", Layer::Relu).unwrap();
    model.push(root, "head", linear(6, 2, 3)).unwrap();
    model
}

fn kinds(model: &Model) -> Vec<&'static str> {
    model
        .pre_order()
        .into_iter()
        .map(|id| model.layer(id).kind())
        .collect()
}

fn batch() -> Tensor {
    Tensor::from_shape((0..12).map(|i| i as f32 / 6.0 - 1.0).collect(), &[3, 4], false)
}

#[test]
fn test_pre_order_and_paths() {
    let model = mlp();
    let paths = model.paths();
    let order: Vec<&str> = model
        .pre_order()
        .into_iter()
        .map(|id| paths[id.index()].as_str())
        .collect();
    assert_eq!(
        order,
        vec![
            "model",
            "model.fc",
            "model.relu",
            "model.block",
            "model.block.fc",
            "model.block.relu",
            "model.head"
        ]
    );
}

#[test]
fn test_children_are_named() {
    let model = mlp();
    let names: Vec<&str> = model.children(model.root()).map(|(name, _)| name).collect();
    assert_eq!(names, vec!["fc", "relu", "block", "head"]);
}

#[test]
fn test_leaf_cannot_hold_children() {
    let mut model = mlp();
    let fc = model.children(model.root()).next().unwrap().1;
    assert!(model.push(fc, "x", Layer::Relu).is_err());
}

#[test]
fn test_forward_shapes() {
    let model = mlp();
    let y = model.forward(&batch(), &Context::new()).unwrap();
    assert_eq!(y.shape(), &[3, 2]);
}

#[test]
fn test_residual_adds_input() {
    let mut model = Model::new("res", Layer::Residual);
    let root = model.root();
    model
        .push(root, "fc", Linear::from_weights(2, 2, vec![1.0, 0.0, 0.0, 1.0], None).unwrap())
        .unwrap();
    let x = Tensor::from_shape(vec![1.0, -2.0], &[1, 2], false);
    let y = model.forward(&x, &Context::new()).unwrap();
    assert_eq!(y.data().to_vec(), vec![2.0, -4.0]);
}

#[test]
fn test_residual_shape_mismatch_is_an_error() {
    let mut model = Model::new("res", Layer::Residual);
    let root = model.root();
    model.push(root, "fc", linear(2, 3, 4)).unwrap();
    let x = Tensor::from_shape(vec![1.0, 2.0], &[1, 2], false);
    assert!(model.forward(&x, &Context::new()).is_err());
}

#[test]
fn test_replacement_factorizes_every_dense_node() {
    let model = mlp();
    let (replaced, report) = replace_linear_layers(&model, &LowRankConfig::new()).unwrap();

    assert_eq!(report.replaced, 3);
    assert_eq!(
        kinds(&replaced),
        vec![
            "sequential",
            "lowrank_linear",
            "relu",
            "sequential",
            "lowrank_linear",
            "relu",
            "lowrank_linear"
        ]
    );
    // the source is untouched
    assert_eq!(kinds(&model)[1], "linear");
    assert_eq!(replaced.low_rank_units().len(), 3);
}

#[test]
fn test_last_eligible_is_last_in_pre_order() {
    let (replaced, report) = replace_linear_layers(&mlp(), &LowRankConfig::new()).unwrap();
    let last = report.last.unwrap();
    assert_eq!(last.path, "model.head");
    assert_eq!(replaced.paths()[last.node.index()], "model.head");
    assert!(matches!(last.dense, Layer::Linear(_)));
}

#[test]
fn test_nested_last_eligible() {
    // the last dense node sits inside a block: model { fc, block { fc } }
    let mut model = Model::sequential();
    let root = model.root();
    model.push(root, "fc", linear(4, 4, 5)).unwrap();
    let block = model.push(root, "block", Layer::Sequential).unwrap();
    model.push(block, "fc", linear(4, 4, 6)).unwrap();

    let (replaced, report) = replace_linear_layers(&model, &LowRankConfig::new()).unwrap();
    assert_eq!(report.last.as_ref().unwrap().path, "model.block.fc");

    // same name at a different depth stays low-rank
    let reset = reset_last_layer_to_dense(replaced, &report);
    assert_eq!(
        kinds(&reset),
        vec!["sequential", "lowrank_linear", "sequential", "linear"]
    );
}

#[test]
fn test_exactly_one_node_reverted() {
    let (replaced, report) = replace_linear_layers(&mlp(), &LowRankConfig::new()).unwrap();
    let reset = reset_last_layer_to_dense(replaced, &report);

    let dense = kinds(&reset).iter().filter(|k| **k == "linear").count();
    assert_eq!(dense, 1);
    assert_eq!(reset.low_rank_units().len(), 2);
    // the reverted layer is the original one, weights included
    let head = reset.pre_order()[6];
    let Layer::Linear(head) = reset.layer(head) else {
        panic!("head should be dense");
    };
    let Layer::Linear(original) = mlp().layer(mlp().pre_order()[6]).clone() else {
        unreachable!()
    };
    assert_eq!(head.weight().data(), original.weight().data());
}

#[test]
fn test_replacement_is_idempotent() {
    let config = LowRankConfig::new();
    let (once, _) = replace_linear_layers(&mlp(), &config).unwrap();
    let ranks = get_all_ranks(&once);

    let (twice, report) = replace_linear_layers(&once, &config).unwrap();
    assert_eq!(report.replaced, 0);
    assert!(report.last.is_none());
    assert_eq!(kinds(&twice), kinds(&once));
    assert_eq!(get_all_ranks(&twice), ranks);

    // nothing to revert either
    let reset = reset_last_layer_to_dense(twice, &report);
    assert_eq!(kinds(&reset), kinds(&once));
}

#[test]
fn test_replacement_is_seeded() {
    let config = LowRankConfig::new().with_seed(7);
    let (a, _) = replace_linear_layers(&mlp(), &config).unwrap();
    let (b, _) = replace_linear_layers(&mlp(), &config).unwrap();
    let x = batch();
    let ya = a.forward(&x, &Context::new()).unwrap();
    let yb = b.forward(&x, &Context::new()).unwrap();
    assert_eq!(ya.data(), yb.data());
}

#[test]
fn test_full_rank_replacement_preserves_outputs() {
    let config = LowRankConfig::new()
        .with_adaptive(false)
        .with_init_method(InitMethod::Svd);
    let model = mlp();
    let (replaced, _) = replace_linear_layers(&model, &config).unwrap();

    let x = batch();
    let expected = model.forward(&x, &Context::new()).unwrap();
    let got = replaced.forward(&x, &Context::new()).unwrap();
    for (a, b) in expected.data().iter().zip(got.data().iter()) {
        assert!((a - b).abs() < 1e-4);
    }
}

#[test]
fn test_conv_nodes_are_replaced() {
    let mut model = Model::sequential();
    let root = model.root();
    let geometry = ConvGeometry {
        in_channels: 1,
        kernel: (3, 3),
        stride: (1, 1),
        padding: (1, 1),
        dilation: (1, 1),
    };
    model
        .push(root, "conv", Conv2d::new(geometry, 4, true, &mut StdRng::seed_from_u64(8)))
        .unwrap();
    model.push(root, "flatten", Layer::Flatten).unwrap();
    model.push(root, "fc", linear(4 * 9, 3, 9)).unwrap();

    let (replaced, report) = replace_linear_layers(&model, &LowRankConfig::new()).unwrap();
    assert_eq!(report.replaced, 2);
    assert_eq!(replaced.layer(replaced.pre_order()[1]).kind(), "lowrank_conv2d");

    let x = Tensor::from_shape(vec![0.5; 2 * 9], &[2, 1, 3, 3], false);
    let y = replaced.forward(&x, &Context::new()).unwrap();
    assert_eq!(y.shape(), &[2, 3]);
}

#[test]
fn test_broadcast_reaches_nested_units() {
    let (mut replaced, _) = replace_linear_layers(&mlp(), &LowRankConfig::new()).unwrap();
    let visited = broadcast(&mut replaced, &LayerCommand::SetPhase(Phase::K)).unwrap();
    assert_eq!(visited, 3);
    for unit in replaced.low_rank_units() {
        assert!(unit.core().k().requires_grad());
        assert!(!unit.core().s().requires_grad());
    }
}

#[test]
fn test_broadcast_to_dense_model_is_a_no_op() {
    let mut model = mlp();
    let before: Vec<Vec<f32>> = model.parameters().iter().map(|p| p.data().to_vec()).collect();
    for command in [
        LayerCommand::SetPhase(Phase::L),
        LayerCommand::KPreprocess,
        LayerCommand::SPreprocess,
        LayerCommand::RankAdaption,
        LayerCommand::Truncate(Some(1)),
    ] {
        assert_eq!(broadcast(&mut model, &command).unwrap(), 0);
    }
    let after: Vec<Vec<f32>> = model.parameters().iter().map(|p| p.data().to_vec()).collect();
    assert_eq!(before, after);
    assert!(model.parameters().iter().all(|p| p.requires_grad()));
}

#[test]
fn test_get_all_ranks() {
    let (replaced, _) = replace_linear_layers(&mlp(), &LowRankConfig::new()).unwrap();
    // adaptive start at half of min(n_in, n_out): 2/4, 3/6, 1/2
    assert_eq!(get_all_ranks(&replaced), vec![0.5, 0.5, 0.5]);
    assert!(get_all_ranks(&mlp()).is_empty());
}

#[test]
fn test_parameters_follow_pre_order() {
    let (mut replaced, _) = replace_linear_layers(&mlp(), &LowRankConfig::new()).unwrap();
    assert_eq!(replaced.parameters().len(), 12);
    assert_eq!(replaced.parameters_mut().len(), 12);
    assert_eq!(replaced.buffers_mut().len(), 6);
    // first parameter is the K factor of model.fc: [4, 2]
    assert_eq!(replaced.parameters()[0].shape(), &[4, 2]);
}

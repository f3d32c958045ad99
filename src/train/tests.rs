//! Tests for the phase controller

use super::*;
use crate::autograd::Context;
use crate::error::Error;
use crate::lowrank::{EpsilonConfig, LowRankConfig, Phase};
use crate::model::Model;
use crate::nn::{Layer, Linear};
use crate::optim::{StepLR, SGD};
use crate::Tensor;
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn single_layer(n: usize) -> Model {
    let mut model = Model::sequential();
    let root = model.root();
    model
        .push(root, "fc", Linear::new(n, n, true, &mut StdRng::seed_from_u64(1)))
        .unwrap();
    model
}

/// model { fc1: 10→10, relu, fc2: 10→4 }
fn two_layers() -> Model {
    let mut rng = StdRng::seed_from_u64(2);
    let mut model = Model::sequential();
    let root = model.root();
    model.push(root, "fc1", Linear::new(10, 10, true, &mut rng)).unwrap();
    model.push(root, "relu", Layer::Relu).unwrap();
    model.push(root, "fc2", Linear::new(10, 4, true, &mut rng)).unwrap();
    model
}

fn low_rank(rank_percent: f32) -> LowRankConfig {
    LowRankConfig::new()
        .with_rank_percent(rank_percent)
        .with_epsilon(EpsilonConfig::uniform(0.1))
}

/// Constant ones input with a fixed target
fn ones_batch(rows: usize, n_in: usize, n_out: usize) -> Batch {
    Batch::new(
        Tensor::from_shape(vec![1.0; rows * n_in], &[rows, n_in], false),
        Tensor::from_shape(
            (0..rows * n_out).map(|i| 1.0 + 0.1 * (i % n_out) as f32).collect(),
            &[rows, n_out],
            false,
        ),
    )
}

fn trainer(model: &Model, config: DlrtConfig) -> DlrtTrainer {
    DlrtTrainer::new(model, Box::new(SGD::new(0.1, 0.0)), Box::new(MSELoss), config).unwrap()
}

#[test]
fn test_last_layer_stays_dense() {
    let t = trainer(&two_layers(), DlrtConfig::new().with_low_rank(low_rank(0.5)));
    assert_eq!(t.replacement().replaced, 2);
    assert_eq!(t.model().low_rank_units().len(), 1);
    assert_eq!(t.get_all_ranks().len(), 1);
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = DlrtConfig::new().with_low_rank(LowRankConfig::new().with_rank_percent(1.5));
    let result = DlrtTrainer::new(
        &two_layers(),
        Box::new(SGD::new(0.1, 0.0)),
        Box::new(MSELoss),
        config,
    );
    assert!(matches!(result, Err(Error::InvalidRankPercent(_))));
}

#[test]
fn test_set_layer_case() {
    let mut t = trainer(&two_layers(), DlrtConfig::new());

    t.set_layer_case(Phase::K).unwrap();
    assert_eq!(t.context().phase(), Phase::K);
    let flags: Vec<bool> = t.model().parameters().iter().map(|p| p.requires_grad()).collect();
    // fc1: K, L, S, bias; fc2 (dense): weight, bias
    assert_eq!(flags, vec![true, false, false, false, false, false]);

    t.set_layer_case(Phase::L).unwrap();
    let flags: Vec<bool> = t.model().parameters().iter().map(|p| p.requires_grad()).collect();
    assert_eq!(flags, vec![false, true, false, false, false, false]);

    t.set_layer_case(Phase::S).unwrap();
    assert!(t.model().parameters().iter().all(|p| p.requires_grad()));
}

#[test]
fn test_single_layer_scenario() {
    let config = DlrtConfig::new()
        .with_low_rank(low_rank(0.5))
        .with_dense_last_layer(false);
    let mut t = trainer(&single_layer(10), config);
    let batch = ones_batch(4, 10, 10);

    let first = t.train_step(&batch, true).unwrap();
    assert!(first.loss.is_finite());
    assert_eq!(first.output.shape(), &[4, 10]);
    let rank = t.layer_ranks()[0];
    assert!((1..=5).contains(&rank), "rank {rank}");

    let mut last = first.loss;
    for _ in 0..19 {
        last = t.train_step(&batch, true).unwrap().loss;
        assert!(last.is_finite());
        let rank = t.layer_ranks()[0];
        assert!((1..=5).contains(&rank), "rank {rank}");
    }
    assert!(last < first.loss, "loss went from {} to {last}", first.loss);
    assert_eq!(t.metrics.steps, 20);
}

#[test]
fn test_without_adaptation_ranks_hold() {
    let config = DlrtConfig::new().with_low_rank(low_rank(1.0));
    let mut t = trainer(&two_layers(), config);
    let batch = ones_batch(3, 10, 4);
    let before = t.layer_ranks();

    for _ in 0..3 {
        t.train_step(&batch, false).unwrap();
    }
    assert_eq!(t.layer_ranks(), before);
    // bases are truncated back, not left widened
    for unit in t.model().low_rank_units() {
        assert_eq!(unit.core().basis_width(), unit.rank());
    }
}

#[test]
fn test_fixed_rank_training() {
    let config = DlrtConfig::new()
        .with_low_rank(low_rank(0.5).with_adaptive(false))
        .with_dense_last_layer(false);
    let mut t = trainer(&single_layer(6), config);
    assert_eq!(t.layer_ranks(), vec![3]);

    let batch = ones_batch(2, 6, 6);
    for _ in 0..3 {
        t.train_step(&batch, true).unwrap();
    }
    assert_eq!(t.layer_ranks(), vec![3]);
}

#[test]
fn test_mixed_precision_step() {
    let config = DlrtConfig::new()
        .with_low_rank(low_rank(0.5))
        .with_mixed_precision(true);
    let mut t = trainer(&two_layers(), config);
    assert_eq!(t.scaler().unwrap().scale(), 65536.0);

    let batch = ones_batch(3, 10, 4);
    let step = t.train_step(&batch, true).unwrap();
    assert!(step.loss.is_finite());
    assert_eq!(t.scaler().unwrap().overflow_count(), 0);
    assert!(t
        .model()
        .parameters()
        .iter()
        .all(|p| p.data().iter().all(|v| v.is_finite())));
}

#[test]
fn test_non_finite_loss_is_fatal() {
    let mut t = trainer(&two_layers(), DlrtConfig::new());
    let mut batch = ones_batch(2, 10, 4);
    batch.targets = Tensor::from_shape(vec![f32::NAN; 8], &[2, 4], false);

    match t.train_step(&batch, true) {
        Err(Error::NonFiniteLoss { phase, value }) => {
            assert_eq!(phase, Phase::K);
            assert!(value.is_nan());
        }
        other => panic!("expected a non-finite loss, got {other:?}"),
    }
}

#[test]
fn test_valid_step_matches_direct_forward() {
    let mut t = trainer(&two_layers(), DlrtConfig::new().with_low_rank(low_rank(0.5)));
    let batch = ones_batch(3, 10, 4);
    t.train_step(&batch, true).unwrap();

    // sentinel gradients must survive validation
    for p in t.model().parameters() {
        p.set_grad(Array1::from_elem(p.len(), 7.0));
    }
    let valid = t.valid_step(&batch).unwrap();

    let mut ctx = Context::new();
    ctx.set_phase(Phase::S);
    ctx.set_grad_enabled(false);
    let direct = t.model().forward(&batch.inputs, &ctx).unwrap();
    assert_eq!(valid.output.data(), direct.data());
    assert!(valid.output.backward_op().is_none());

    for p in t.model().parameters() {
        assert!(p.grad().unwrap().iter().all(|&g| g == 7.0));
    }
}

#[test]
fn test_train_epoch_records_metrics() {
    let mut t = trainer(&two_layers(), DlrtConfig::new().with_log_interval(1))
        .with_scheduler(Box::new(StepLR::new(0.1, 1, 0.5)));
    let batches = vec![ones_batch(2, 10, 4); 3];

    let loss = t.train_epoch(batches).unwrap();
    assert!(loss.is_finite());
    assert_eq!(t.metrics.steps, 3);
    assert_eq!(t.metrics.epoch, 1);
    assert_eq!(t.metrics.ranks[0].len(), 1);
    assert!((t.lr() - 0.05).abs() < 1e-6);
}

#[test]
fn test_mode_switches() {
    let mut t = trainer(&two_layers(), DlrtConfig::new());
    t.eval();
    assert!(!t.context().is_training());
    t.train();
    assert!(t.context().is_training());
}

/// Ranks before training and after each of `steps` full K → L → S cycles
fn rank_history(epsilon: f32, steps: usize) -> Vec<usize> {
    let config = DlrtConfig::new()
        .with_low_rank(LowRankConfig::new().with_epsilon(EpsilonConfig::uniform(epsilon)))
        .with_dense_last_layer(false);
    let mut t = trainer(&single_layer(10), config);
    let batch = ones_batch(4, 10, 10);

    let mut history = t.layer_ranks();
    for _ in 0..steps {
        t.train_step(&batch, true).unwrap();
        history.extend(t.layer_ranks());
    }
    history
}

#[test]
fn test_huge_epsilon_shrinks_rank_to_one() {
    let ranks = rank_history(10.0, 6);
    assert_eq!(ranks[0], 5);
    assert!(ranks.windows(2).all(|w| w[1] <= w[0]), "ranks rose: {ranks:?}");
    assert_eq!(*ranks.last().unwrap(), 1);
}

#[test]
fn test_zero_epsilon_never_drops_rank() {
    let ranks = rank_history(0.0, 6);
    assert_eq!(ranks[0], 5);
    assert!(ranks.windows(2).all(|w| w[1] >= w[0]), "ranks fell: {ranks:?}");
    assert!(ranks.iter().all(|&r| r <= 10));
}

#[test]
fn test_initial_rank_clamped_per_layer() {
    let config = DlrtConfig::new()
        .with_low_rank(LowRankConfig::new().with_initial_rank(6))
        .with_dense_last_layer(false);
    let t = trainer(&two_layers(), config);
    assert_eq!(t.layer_ranks(), vec![6, 4]);
}

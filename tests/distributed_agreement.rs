//! Data-parallel DLRT on a thread group: workers stay in lockstep.

use rango::distributed::{Collective, Replica, ThreadGroup, ThreadWorker};
use rango::lowrank::{EpsilonConfig, LowRankConfig};
use rango::model::Model;
use rango::nn::{Layer, Linear};
use rango::optim::SGD;
use rango::train::{Batch, DlrtConfig, DlrtTrainer, MSELoss};
use rango::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::thread;

struct WorkerResult {
    ranks: Vec<usize>,
    params: Vec<Vec<f32>>,
    losses: Vec<f32>,
}

/// Every worker starts from different weights; the broadcast must fix that
fn worker_model(rank: usize) -> Model {
    let mut rng = StdRng::seed_from_u64(100 + rank as u64);
    let mut model = Model::sequential();
    let root = model.root();
    model.push(root, "fc1", Linear::new(6, 6, true, &mut rng)).unwrap();
    model.push(root, "relu", Layer::Relu).unwrap();
    model.push(root, "fc2", Linear::new(6, 6, true, &mut rng)).unwrap();
    model.push(root, "head", Linear::new(6, 2, true, &mut rng)).unwrap();
    model
}

/// Each worker sees its own shard
fn shard(rank: usize) -> Batch {
    let offset = rank as f32 * 0.3;
    Batch::new(
        Tensor::from_shape(
            (0..12).map(|i| (i % 5) as f32 * 0.2 + offset).collect(),
            &[2, 6],
            false,
        ),
        Tensor::from_shape(vec![0.5 - offset, 1.0, -0.5, offset], &[2, 2], false),
    )
}

fn run_worker(worker: ThreadWorker) -> WorkerResult {
    let rank = worker.rank();
    let replica = Replica::new(Box::new(worker));
    let config = DlrtConfig::new().with_low_rank(
        LowRankConfig::new()
            .with_epsilon(EpsilonConfig::uniform(0.2))
            .with_seed(7),
    );
    let mut trainer = DlrtTrainer::new(
        &worker_model(rank),
        Box::new(SGD::new(0.05, 0.9)),
        Box::new(MSELoss),
        config,
    )
    .unwrap()
    .with_replica(replica)
    .unwrap();

    let batch = shard(rank);
    let losses = (0..5)
        .map(|_| trainer.train_step(&batch, true).unwrap().loss)
        .collect();

    WorkerResult {
        ranks: trainer.layer_ranks(),
        params: trainer
            .model()
            .parameters()
            .iter()
            .map(|p| p.data().to_vec())
            .collect(),
        losses,
    }
}

#[test]
fn test_workers_agree_after_training() {
    let handles: Vec<_> = ThreadGroup::spawn(2)
        .into_iter()
        .map(|worker| thread::spawn(move || run_worker(worker)))
        .collect();
    let results: Vec<WorkerResult> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results[0].ranks, results[1].ranks);
    assert_eq!(results[0].params, results[1].params);
    // shards differ, so the local losses do too
    assert_ne!(results[0].losses, results[1].losses);
    assert!(results.iter().flat_map(|r| &r.losses).all(|l| l.is_finite()));
}

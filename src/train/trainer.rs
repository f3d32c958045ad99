//! Three-phase K/L/S trainer

use super::{Batch, DlrtConfig, LossFn, MetricsTracker};
use crate::autograd::{backward, Context, GradScaler};
use crate::distributed::{ParamSubset, Replica};
use crate::error::{Error, Result};
use crate::lowrank::{LayerCommand, Phase};
use crate::model::{
    broadcast, get_all_ranks, replace_linear_layers, reset_last_layer_to_dense, Model,
    ReplacementReport,
};
use crate::optim::{clip_grad_norm_refs, LRScheduler, Optimizer};
use crate::Tensor;
use ndarray::Array1;
use tracing::{debug, info, warn};

/// Loss and output of the S-phase of a step
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub loss: f32,
    /// Model output, detached from the graph
    pub output: Tensor,
}

/// Trainer for a model whose dense layers were factorized
///
/// Every [`train_step`](Self::train_step) updates the basis factors `K`, then
/// the co-basis factors `L`, then the cores `S`, and finally re-selects each
/// layer's rank.
///
/// # Example
///
/// ```no_run
/// use rango::model::Model;
/// use rango::nn::Linear;
/// use rango::optim::SGD;
/// use rango::train::{Batch, DlrtConfig, DlrtTrainer, MSELoss};
/// use rango::Tensor;
/// use rand::{rngs::StdRng, SeedableRng};
///
/// let mut model = Model::sequential();
/// let root = model.root();
/// model.push(root, "fc", Linear::new(10, 10, true, &mut StdRng::seed_from_u64(0))).unwrap();
///
/// let mut trainer = DlrtTrainer::new(
///     &model,
///     Box::new(SGD::new(0.1, 0.0)),
///     Box::new(MSELoss),
///     DlrtConfig::default().with_dense_last_layer(false),
/// )
/// .unwrap();
///
/// let batch = Batch::new(
///     Tensor::from_shape(vec![0.5; 40], &[4, 10], false),
///     Tensor::from_shape(vec![0.0; 40], &[4, 10], false),
/// );
/// let step = trainer.train_step(&batch, true).unwrap();
/// println!("loss={:.4} ranks={:?}", step.loss, trainer.get_all_ranks());
/// ```
pub struct DlrtTrainer {
    model: Model,
    optimizer: Box<dyn Optimizer>,
    loss_fn: Box<dyn LossFn>,
    scheduler: Option<Box<dyn LRScheduler>>,
    scaler: Option<GradScaler>,
    replica: Replica,
    ctx: Context,
    config: DlrtConfig,
    report: ReplacementReport,

    /// Metrics tracker
    pub metrics: MetricsTracker,
}

impl DlrtTrainer {
    /// Factorize `model` and prepare it for training
    ///
    /// The source model is left untouched; the trainer owns the rebuilt one.
    pub fn new(
        model: &Model,
        optimizer: Box<dyn Optimizer>,
        loss_fn: Box<dyn LossFn>,
        config: DlrtConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (mut model, report) = replace_linear_layers(model, &config.low_rank)?;
        if config.dense_last_layer {
            model = reset_last_layer_to_dense(model, &report);
        }

        let precision = config.precision();
        let mut ctx = Context::new();
        ctx.set_precision(precision.compute_precision);
        let scaler = precision.is_mixed().then(|| GradScaler::from_config(&precision));

        info!(
            layers = model.low_rank_units().len(),
            mixed_precision = config.mixed_precision,
            adaptive = config.low_rank.adaptive,
            "DLRT trainer ready"
        );

        Ok(Self {
            model,
            optimizer,
            loss_fn,
            scheduler: None,
            scaler,
            replica: Replica::local(),
            ctx,
            config,
            report,
            metrics: MetricsTracker::new(),
        })
    }

    /// Join a data-parallel group, taking worker 0's parameters
    pub fn with_replica(mut self, replica: Replica) -> Result<Self> {
        replica.broadcast_model(&mut self.model)?;
        self.replica = replica;
        Ok(self)
    }

    pub fn with_scheduler(mut self, scheduler: Box<dyn LRScheduler>) -> Self {
        scheduler.apply(self.optimizer.as_mut());
        self.scheduler = Some(scheduler);
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    pub fn into_model(self) -> Model {
        self.model
    }

    /// Outcome of the dense-to-low-rank replacement
    pub fn replacement(&self) -> &ReplacementReport {
        &self.report
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn config(&self) -> &DlrtConfig {
        &self.config
    }

    pub fn scaler(&self) -> Option<&GradScaler> {
        self.scaler.as_ref()
    }

    /// Get current learning rate
    pub fn lr(&self) -> f32 {
        self.optimizer.lr()
    }

    /// Set learning rate
    pub fn set_lr(&mut self, lr: f32) {
        self.optimizer.set_lr(lr);
    }

    /// Switch to training mode
    pub fn train(&mut self) {
        self.ctx.train();
    }

    /// Switch to evaluation mode
    pub fn eval(&mut self) {
        self.ctx.eval();
    }

    /// Advance the learning-rate schedule, if any
    pub fn scheduler_step(&mut self) {
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.step();
            scheduler.apply(self.optimizer.as_mut());
        }
    }

    /// Freeze the model for `phase`
    ///
    /// K and L phases train only the matching factor of each low-rank layer;
    /// dense layers stay frozen. The S phase trains every parameter.
    pub fn set_layer_case(&mut self, phase: Phase) -> Result<()> {
        let train_all = phase == Phase::S;
        for param in self.model.parameters_mut() {
            param.set_requires_grad(train_all);
        }
        broadcast(&mut self.model, &LayerCommand::SetPhase(phase))?;
        self.ctx.set_phase(phase);
        Ok(())
    }

    pub fn run_preprocess(&mut self, phase: Phase) -> Result<usize> {
        let command = match phase {
            Phase::K => LayerCommand::KPreprocess,
            Phase::L => LayerCommand::LPreprocess,
            Phase::S => LayerCommand::SPreprocess,
        };
        broadcast(&mut self.model, &command)
    }

    /// Basis update after a K or L step; nothing to do after S
    pub fn run_postprocess(&mut self, phase: Phase) -> Result<usize> {
        match phase {
            Phase::K => broadcast(&mut self.model, &LayerCommand::KPostprocess),
            Phase::L => broadcast(&mut self.model, &LayerCommand::LPostprocess),
            Phase::S => Ok(0),
        }
    }

    pub fn run_rank_adaption(&mut self) -> Result<usize> {
        broadcast(&mut self.model, &LayerCommand::RankAdaption)
    }

    /// Per-layer rank as a fraction of `min(n_in, n_out)`
    pub fn get_all_ranks(&self) -> Vec<f32> {
        get_all_ranks(&self.model)
    }

    /// Absolute per-layer ranks
    pub fn layer_ranks(&self) -> Vec<usize> {
        self.model
            .low_rank_units()
            .into_iter()
            .map(|unit| unit.rank())
            .collect()
    }

    /// One K → L → S step
    ///
    /// With `adapt == false` the widened bases are truncated back to the
    /// current ranks instead of re-selecting them.
    pub fn train_step(&mut self, batch: &Batch, adapt: bool) -> Result<StepOutput> {
        self.model.zero_grad();

        self.phase_step(Phase::K, batch)?;
        self.phase_step(Phase::L, batch)?;
        let (loss, output) = self.phase_step(Phase::S, batch)?;

        if self.config.low_rank.adaptive {
            let command = if adapt {
                LayerCommand::RankAdaption
            } else {
                LayerCommand::Truncate(None)
            };
            broadcast(&mut self.model, &command)?;
            self.replica.check_rank_agreement(&self.layer_ranks())?;
        }

        self.metrics.increment_step();
        let step = self.metrics.steps;
        if self.replica.is_primary() && step % self.config.log_interval.max(1) == 0 {
            info!(step, loss, ranks = ?self.get_all_ranks(), lr = self.lr(), "DLRT step");
        }

        Ok(StepOutput { loss, output })
    }

    /// Forward, backward and optimizer step for one phase
    fn phase_step(&mut self, phase: Phase, batch: &Batch) -> Result<(f32, Tensor)> {
        self.set_layer_case(phase)?;
        self.run_preprocess(phase)?;

        let inputs = batch.inputs.detach();
        let output = self.model.forward(&inputs, &self.ctx)?;
        let mut loss = self.loss_fn.forward(&output, &batch.targets)?;
        let value = loss.data()[0];
        if !value.is_finite() {
            return Err(Error::NonFiniteLoss { phase, value });
        }

        let seed = self
            .scaler
            .as_ref()
            .map(|scaler| Array1::from_elem(1, scaler.scale()));
        backward(&mut loss, seed);
        self.replica
            .all_reduce_gradients(&self.model, ParamSubset::Active)?;
        self.optimizer_step(phase);
        self.model.zero_grad();

        self.run_postprocess(phase)?;
        debug!(phase = %phase, loss = value, "Phase step done");
        Ok((value, output.detach()))
    }

    fn optimizer_step(&mut self, phase: Phase) {
        let mut params = self.model.parameters_mut();
        match self.scaler.as_mut() {
            Some(scaler) => {
                let valid = scaler.unscale_and_check(&params);
                if valid {
                    clip_grad_norm_refs(&mut params, self.config.max_grad_norm);
                    self.optimizer.step_refs(&mut params);
                } else {
                    warn!(phase = %phase, scale = scaler.scale(), "Non-finite gradients, skipping step");
                }
                scaler.update(valid);
            }
            None => self.optimizer.step_refs(&mut params),
        }
    }

    /// Evaluate a batch in the S configuration without recording a graph
    ///
    /// Pending basis updates are folded in first; gradients are not touched.
    pub fn valid_step(&mut self, batch: &Batch) -> Result<StepOutput> {
        self.set_layer_case(Phase::S)?;
        self.run_preprocess(Phase::S)?;

        let mut ctx = self.ctx.clone();
        ctx.set_grad_enabled(false);
        let output = self.model.forward(&batch.inputs.detach(), &ctx)?;
        let loss = self.loss_fn.forward(&output, &batch.targets)?.data()[0];
        if !loss.is_finite() {
            return Err(Error::NonFiniteLoss {
                phase: Phase::S,
                value: loss,
            });
        }
        Ok(StepOutput { loss, output })
    }

    /// Train over every batch once; returns the mean S-phase loss
    pub fn train_epoch<I>(&mut self, batches: I) -> Result<f32>
    where
        I: IntoIterator<Item = Batch>,
    {
        self.train();
        let mut total_loss = 0.0;
        let mut num_batches = 0;

        for batch in batches {
            total_loss += self.train_step(&batch, true)?.loss;
            num_batches += 1;
        }

        let avg_loss = if num_batches > 0 {
            total_loss / num_batches as f32
        } else {
            0.0
        };

        let ranks = self.get_all_ranks();
        self.metrics.record_epoch(avg_loss, self.lr(), ranks);
        if self.replica.is_primary() {
            info!(epoch = self.metrics.epoch, loss = avg_loss, lr = self.lr(), "Epoch done");
        }
        self.scheduler_step();
        Ok(avg_loss)
    }
}

impl std::fmt::Debug for DlrtTrainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DlrtTrainer")
            .field("layers", &self.model.low_rank_units().len())
            .field("ranks", &self.layer_ranks())
            .field("phase", &self.ctx.phase())
            .field("replica", &self.replica)
            .finish()
    }
}

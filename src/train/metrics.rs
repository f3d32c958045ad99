//! Training metrics
//!
//! - [`MetricsTracker`]: per-epoch loss and learning-rate history
//! - [`AverageMeter`]: running average that can be summed across workers
//! - [`accuracy`]: top-k classification accuracy

use crate::distributed::Replica;
use crate::error::{Error, Result};
use crate::Tensor;
use std::fmt;

/// Tracks training metrics across epochs
#[derive(Clone, Debug, Default)]
pub struct MetricsTracker {
    /// Training loss history (one per epoch)
    pub losses: Vec<f32>,

    /// Validation loss history (one per epoch, if validation is used)
    pub val_losses: Vec<f32>,

    /// Learning rates (one per epoch)
    pub learning_rates: Vec<f32>,

    /// Per-layer rank fractions at the end of each epoch
    pub ranks: Vec<Vec<f32>>,

    /// Training step count
    pub steps: usize,

    /// Current epoch
    pub epoch: usize,
}

impl MetricsTracker {
    /// Create a new metrics tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an epoch's training metrics
    pub fn record_epoch(&mut self, loss: f32, lr: f32, ranks: Vec<f32>) {
        self.losses.push(loss);
        self.learning_rates.push(lr);
        self.ranks.push(ranks);
        self.epoch += 1;
    }

    /// Record validation loss for the current epoch
    pub fn record_val_loss(&mut self, val_loss: f32) {
        self.val_losses.push(val_loss);
    }

    /// Increment step counter
    pub fn increment_step(&mut self) {
        self.steps += 1;
    }

    /// Get best (minimum) loss
    pub fn best_loss(&self) -> Option<f32> {
        self.losses.iter().copied().reduce(f32::min)
    }

    /// Get best (minimum) validation loss
    pub fn best_val_loss(&self) -> Option<f32> {
        self.val_losses.iter().copied().reduce(f32::min)
    }

    /// Get average loss over last N epochs
    pub fn avg_loss(&self, n: usize) -> f32 {
        if self.losses.is_empty() {
            return 0.0;
        }

        let start = self.losses.len().saturating_sub(n);
        let window = &self.losses[start..];
        window.iter().sum::<f32>() / window.len() as f32
    }
}

/// Running average of a scalar
#[derive(Clone, Debug)]
pub struct AverageMeter {
    name: String,
    val: f32,
    sum: f32,
    count: f32,
}

impl AverageMeter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            val: 0.0,
            sum: 0.0,
            count: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.val = 0.0;
        self.sum = 0.0;
        self.count = 0.0;
    }

    /// Add `val` observed over `n` samples
    pub fn update(&mut self, val: f32, n: usize) {
        self.val = val;
        self.sum += val * n as f32;
        self.count += n as f32;
    }

    /// Last value
    pub fn val(&self) -> f32 {
        self.val
    }

    pub fn sum(&self) -> f32 {
        self.sum
    }

    pub fn count(&self) -> f32 {
        self.count
    }

    /// Average so far, zero before the first update
    pub fn avg(&self) -> f32 {
        if self.count > 0.0 {
            self.sum / self.count
        } else {
            0.0
        }
    }

    /// Sum `sum` and `count` over every worker
    pub fn all_reduce(&mut self, replica: &Replica) -> Result<()> {
        let mut totals = [self.sum, self.count];
        replica.all_reduce_sum(&mut totals)?;
        [self.sum, self.count] = totals;
        Ok(())
    }
}

impl fmt::Display for AverageMeter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:.4} ({:.4})", self.name, self.val, self.avg())
    }
}

/// Top-k accuracy in percent for each `k` in `topk`
///
/// `output` holds `[B, classes]` scores; `targets` holds class indices.
pub fn accuracy(output: &Tensor, targets: &Tensor, classes: usize, topk: &[usize]) -> Result<Vec<f32>> {
    let batch = targets.len();
    if classes == 0 || batch == 0 || output.len() != batch * classes {
        return Err(Error::ShapeMismatch {
            expected: vec![batch, classes],
            got: output.shape().to_vec(),
        });
    }
    let scores = output.data().to_vec();

    // rank of the target's score within each row (0 = best)
    let positions: Vec<usize> = scores
        .chunks(classes)
        .zip(targets.data().iter())
        .map(|(row, &target)| {
            let target = target as usize;
            let score = row.get(target).copied().unwrap_or(f32::NEG_INFINITY);
            row.iter()
                .enumerate()
                .filter(|&(j, &s)| s > score || (s == score && j < target))
                .count()
        })
        .collect();

    Ok(topk
        .iter()
        .map(|&k| {
            let correct = positions.iter().filter(|&&p| p < k).count();
            correct as f32 * 100.0 / batch as f32
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_metrics_tracker() {
        let mut tracker = MetricsTracker::new();

        tracker.record_epoch(1.0, 0.001, vec![0.5]);
        tracker.record_epoch(0.8, 0.001, vec![0.4]);
        tracker.record_epoch(0.6, 0.001, vec![0.4]);

        assert_eq!(tracker.epoch, 3);
        assert_eq!(tracker.losses.len(), 3);
        assert_eq!(tracker.best_loss(), Some(0.6));
        assert_eq!(tracker.ranks[1], vec![0.4]);
        assert_relative_eq!(tracker.avg_loss(2), 0.7, epsilon = 1e-5);
    }

    #[test]
    fn test_validation_loss_tracking() {
        let mut tracker = MetricsTracker::new();
        assert_eq!(tracker.best_val_loss(), None);

        tracker.record_val_loss(0.9);
        tracker.record_val_loss(0.5);
        tracker.record_val_loss(0.7);

        assert_eq!(tracker.best_val_loss(), Some(0.5));
    }

    #[test]
    fn test_average_meter() {
        let mut meter = AverageMeter::new("loss");
        assert_eq!(meter.avg(), 0.0);

        meter.update(1.0, 2);
        meter.update(4.0, 1);

        assert_eq!(meter.val(), 4.0);
        assert_relative_eq!(meter.avg(), 2.0);
        assert_eq!(meter.to_string(), "loss 4.0000 (2.0000)");

        meter.reset();
        assert_eq!(meter.count(), 0.0);
    }

    #[test]
    fn test_average_meter_local_all_reduce() {
        let mut meter = AverageMeter::new("acc");
        meter.update(50.0, 4);
        meter.all_reduce(&Replica::local()).unwrap();
        assert_eq!(meter.sum(), 200.0);
        assert_eq!(meter.count(), 4.0);
    }

    #[test]
    fn test_top_k_accuracy() {
        // row 0: target 2 is best; row 1: target 0 is second best
        let output = Tensor::from_shape(vec![0.1, 0.2, 0.7, 0.3, 0.6, 0.1], &[2, 3], false);
        let targets = Tensor::from_vec(vec![2.0, 0.0], false);

        let acc = accuracy(&output, &targets, 3, &[1, 2, 3]).unwrap();
        assert_eq!(acc, vec![50.0, 100.0, 100.0]);
    }

    #[test]
    fn test_accuracy_shape_mismatch() {
        let output = Tensor::from_vec(vec![0.0; 5], false);
        let targets = Tensor::from_vec(vec![0.0, 1.0], false);
        assert!(accuracy(&output, &targets, 3, &[1]).is_err());
    }
}

//! Learning rate schedulers
//!
//! Schedulers are pure functions of `(global step, epoch)`, so a resumed run
//! recovers the exact rate from the restored step without scheduler state.

use super::Scheduler;
use crate::training::config::{OptimizerConfig, SchedulerType};

/// Constant rate until `decay_epoch`, then linear decay reaching zero at `end_epoch`
#[derive(Debug, Clone)]
pub struct LinearDecayScheduler {
    base_lr: f64,
    decay_epoch: usize,
    end_epoch: usize,
}

impl LinearDecayScheduler {
    /// Create a new linear decay scheduler
    pub fn new(base_lr: f64, decay_epoch: usize, end_epoch: usize) -> Self {
        Self {
            base_lr,
            decay_epoch,
            end_epoch,
        }
    }
}

impl Scheduler for LinearDecayScheduler {
    fn name(&self) -> &str {
        "linear_decay"
    }

    fn learning_rate(&self, _step: u64, epoch: usize) -> f64 {
        if epoch <= self.decay_epoch || self.end_epoch <= self.decay_epoch {
            return self.base_lr;
        }
        let per_epoch = self.base_lr / (self.end_epoch - self.decay_epoch) as f64;
        (self.base_lr - (epoch - self.decay_epoch) as f64 * per_epoch).max(0.0)
    }

    fn base_lr(&self) -> f64 {
        self.base_lr
    }
}

/// `base_lr * decay_rate^(step / decay_steps)`
#[derive(Debug, Clone)]
pub struct ExponentialScheduler {
    base_lr: f64,
    decay_steps: u64,
    decay_rate: f64,
}

impl ExponentialScheduler {
    /// Create a new exponential scheduler
    pub fn new(base_lr: f64, decay_steps: u64, decay_rate: f64) -> Self {
        Self {
            base_lr,
            decay_steps: decay_steps.max(1),
            decay_rate,
        }
    }
}

impl Scheduler for ExponentialScheduler {
    fn name(&self) -> &str {
        "exponential"
    }

    fn learning_rate(&self, step: u64, _epoch: usize) -> f64 {
        self.base_lr * self.decay_rate.powf(step as f64 / self.decay_steps as f64)
    }

    fn base_lr(&self) -> f64 {
        self.base_lr
    }
}

/// Fixed learning rate
#[derive(Debug, Clone)]
pub struct ConstantScheduler {
    lr: f64,
}

impl ConstantScheduler {
    /// Create a new constant scheduler
    pub fn new(lr: f64) -> Self {
        Self { lr }
    }
}

impl Scheduler for ConstantScheduler {
    fn name(&self) -> &str {
        "constant"
    }

    fn learning_rate(&self, _step: u64, _epoch: usize) -> f64 {
        self.lr
    }

    fn base_lr(&self) -> f64 {
        self.lr
    }
}

/// Build the scheduler selected in the optimizer configuration
pub fn create_scheduler(config: &OptimizerConfig, end_epoch: usize) -> Box<dyn Scheduler + Send + Sync> {
    let sched = &config.scheduler;
    match sched.scheduler_type {
        SchedulerType::LinearDecay => Box::new(LinearDecayScheduler::new(
            config.learning_rate,
            sched.decay_epoch,
            end_epoch,
        )),
        SchedulerType::Exponential => Box::new(ExponentialScheduler::new(
            config.learning_rate,
            sched.decay_steps,
            sched.decay_rate,
        )),
        SchedulerType::Constant => Box::new(ConstantScheduler::new(config.learning_rate)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_linear_decay_scheduler() {
        let scheduler = LinearDecayScheduler::new(2e-4, 100, 160);
        assert_eq!(scheduler.name(), "linear_decay");

        assert_eq!(scheduler.learning_rate(0, 0), 2e-4);
        assert_eq!(scheduler.learning_rate(0, 100), 2e-4);
        assert_relative_eq!(scheduler.learning_rate(0, 101), 2e-4 - 2e-4 / 60.0);
        assert_relative_eq!(scheduler.learning_rate(0, 130), 1e-4);
        assert_relative_eq!(scheduler.learning_rate(0, 160), 0.0);
    }

    #[test]
    fn test_linear_decay_ignores_step() {
        let scheduler = LinearDecayScheduler::new(1e-3, 2, 10);
        assert_eq!(scheduler.learning_rate(0, 5), scheduler.learning_rate(99_999, 5));
    }

    #[test]
    fn test_linear_decay_past_end_epoch_never_decays() {
        let scheduler = LinearDecayScheduler::new(1e-3, 3, 3);
        assert_eq!(scheduler.learning_rate(0, 0), 1e-3);
        assert_eq!(scheduler.learning_rate(0, 2), 1e-3);
    }

    #[test]
    fn test_exponential_scheduler() {
        let scheduler = ExponentialScheduler::new(1e-3, 100, 0.5);
        assert_relative_eq!(scheduler.learning_rate(0, 0), 1e-3);
        assert_relative_eq!(scheduler.learning_rate(100, 0), 5e-4);
        assert_relative_eq!(scheduler.learning_rate(200, 7), 2.5e-4);
        assert!(scheduler.learning_rate(150, 0) < 5e-4);
    }

    #[test]
    fn test_constant_scheduler() {
        let scheduler = ConstantScheduler::new(0.001);
        assert_eq!(scheduler.name(), "constant");
        assert_eq!(scheduler.learning_rate(1_000_000, 1000), 0.001);
    }

    #[test]
    fn test_create_scheduler_from_config() {
        let mut config = OptimizerConfig::default();
        assert_eq!(create_scheduler(&config, 160).name(), "linear_decay");

        config.scheduler.scheduler_type = SchedulerType::Exponential;
        assert_eq!(create_scheduler(&config, 160).name(), "exponential");

        config.scheduler.scheduler_type = SchedulerType::Constant;
        let scheduler = create_scheduler(&config, 160);
        assert_eq!(scheduler.base_lr(), config.learning_rate);
    }
}

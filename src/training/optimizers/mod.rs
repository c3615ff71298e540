//! Optimizers and learning rate schedulers
//!
//! Each optimizer role (generators, discriminators) owns one [`Optimizer`]
//! over the parameter groups of its networks. Learning rates come from a
//! [`Scheduler`] evaluated at `(global step, epoch)` before every update.

pub mod adam;
pub mod schedulers;

pub use adam::{AdamOptimizer, ParameterGroup};
pub use schedulers::{
    create_scheduler, ConstantScheduler, ExponentialScheduler, LinearDecayScheduler,
};

use std::collections::HashMap;

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::training::config::OptimizerConfig;

/// Trait for optimizers
pub trait Optimizer {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Update every owned parameter that has a gradient; returns how many were updated
    fn step(&mut self, gradients: &GradStore) -> Result<usize>;

    /// Get current learning rate
    fn learning_rate(&self) -> f64;

    /// Set learning rate
    fn set_learning_rate(&mut self, lr: f64);

    /// Get optimizer state for checkpointing
    fn state_dict(&self) -> Result<OptimizerStateDict>;

    /// Load optimizer state from checkpoint
    fn load_state_dict(&mut self, state: OptimizerStateDict) -> Result<()>;

    /// Check that a state dict fits this optimizer without applying it
    fn validate_state_dict(&self, state: &OptimizerStateDict) -> Result<()>;

    /// Get parameter count
    fn parameter_count(&self) -> usize;

    /// Get current step count
    fn step_count(&self) -> u64;
}

/// Trait for learning rate schedulers
pub trait Scheduler {
    /// Scheduler name
    fn name(&self) -> &str;

    /// Learning rate for the update that produces global step `step` in `epoch`
    fn learning_rate(&self, step: u64, epoch: usize) -> f64;

    /// Initial learning rate
    fn base_lr(&self) -> f64;
}

/// Serializable optimizer scalars, stored in the checkpoint manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerScalars {
    /// Optimizer type
    pub optimizer_type: String,

    /// Current step count
    pub step_count: u64,

    /// Current learning rate
    pub learning_rate: f64,

    /// Hyperparameters
    pub hyperparameters: HashMap<String, f64>,
}

/// Optimizer state dictionary for checkpointing
#[derive(Debug, Clone)]
pub struct OptimizerStateDict {
    /// Scalar state
    pub scalars: OptimizerScalars,

    /// Moment tensors keyed `m/<network>/<var>` and `v/<network>/<var>`
    pub tensors: HashMap<String, Tensor>,
}

/// Create an optimizer for one role from configuration
pub fn create_optimizer(
    name: &str,
    config: &OptimizerConfig,
    groups: Vec<ParameterGroup>,
) -> Box<dyn Optimizer + Send + Sync> {
    Box::new(AdamOptimizer::new(
        name,
        groups,
        config.learning_rate,
        config.beta1,
        config.beta2,
        config.eps,
    ))
}

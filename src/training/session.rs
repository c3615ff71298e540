//! Training session: global step, model pair and both optimizers
//!
//! The session is the unit that checkpoints save and restore. One call to
//! [`TrainingSession::train_step`] performs a complete optimization step: the
//! coupled forward pass, both objectives, both backward passes and then both
//! parameter updates.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use tracing::{instrument, trace};

use crate::networks::{ModelPair, NetworkRole};
use crate::training::config::{OptimizerConfig, TrainingConfig};
use crate::training::loss::{LossComposer, LossScalars};
use crate::training::optimizers::{create_optimizer, Optimizer, ParameterGroup};

/// Name of the generator-side optimizer in checkpoints
pub const GENERATOR_OPTIMIZER: &str = "generator_optimizer";
/// Name of the discriminator-side optimizer in checkpoints
pub const DISCRIMINATOR_OPTIMIZER: &str = "discriminator_optimizer";

/// What one step produced, for logging and summaries
#[derive(Debug, Clone)]
pub struct StepReport {
    /// Global step after the update
    pub global_step: u64,
    /// Learning rate applied to both roles
    pub learning_rate: f64,
    /// Every loss value of the step
    pub losses: LossScalars,
    /// A-domain input patches
    pub x: Tensor,
    /// B-domain input patches
    pub y: Tensor,
    /// G(X), detached
    pub g_x: Tensor,
    /// F(Y), detached
    pub f_y: Tensor,
}

/// Mutable training state passed between the trainer and the checkpoint manager
pub struct TrainingSession {
    /// Completed optimization steps
    pub global_step: u64,
    /// The four networks
    pub models: ModelPair,
    /// Updates both generators from the generator loss
    pub generator_optimizer: Box<dyn Optimizer + Send + Sync>,
    /// Updates both discriminators from the discriminator loss
    pub discriminator_optimizer: Box<dyn Optimizer + Send + Sync>,
    device: Device,
}

impl TrainingSession {
    /// Wrap a model pair with one optimizer per role, starting at step 0
    pub fn new(models: ModelPair, config: &OptimizerConfig, device: Device) -> Self {
        let groups = |role| {
            models
                .networks_for(role)
                .into_iter()
                .map(|n| ParameterGroup::new(n.name(), n.varmap().clone()))
                .collect::<Vec<_>>()
        };
        let generator_optimizer =
            create_optimizer(GENERATOR_OPTIMIZER, config, groups(NetworkRole::Generator));
        let discriminator_optimizer =
            create_optimizer(DISCRIMINATOR_OPTIMIZER, config, groups(NetworkRole::Discriminator));

        Self {
            global_step: 0,
            models,
            generator_optimizer,
            discriminator_optimizer,
            device,
        }
    }

    /// Build the reference networks described by the configuration
    pub fn from_config(config: &TrainingConfig, device: Device) -> Result<Self> {
        let models = ModelPair::reference(
            config.generator_config(),
            config.discriminator_config(),
            config.data.patch_size,
            &device,
        )
        .context("Failed to build networks")?;
        Ok(Self::new(models, &config.optimizer, device))
    }

    /// Device holding the parameters
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Optimizer for a role
    pub fn optimizer(&self, role: NetworkRole) -> &dyn Optimizer {
        match role {
            NetworkRole::Generator => self.generator_optimizer.as_ref(),
            NetworkRole::Discriminator => self.discriminator_optimizer.as_ref(),
        }
    }

    /// One complete optimization step at learning rate `lr`
    ///
    /// Both gradient stores are computed before any parameter changes, then
    /// the generators and discriminators are updated, and the global step is
    /// incremented.
    #[instrument(skip(self, x, y, composer), fields(step = self.global_step + 1))]
    pub fn train_step(
        &mut self,
        x: &Tensor,
        y: &Tensor,
        composer: &LossComposer,
        lr: f64,
    ) -> Result<StepReport> {
        let x = x.to_device(&self.device)?;
        let y = y.to_device(&self.device)?;

        let outputs = self.models.forward(&x, &y, true)?;
        let fakes = self.models.score_detached_fakes(&outputs, true)?;
        let terms = composer.compose(&outputs, &fakes)?;

        let generator_grads = terms
            .generator
            .total
            .backward()
            .context("Generator backward pass failed")?;
        let discriminator_grads = terms
            .discriminator
            .total
            .backward()
            .context("Discriminator backward pass failed")?;
        let losses = terms.scalars()?;

        self.generator_optimizer.set_learning_rate(lr);
        self.discriminator_optimizer.set_learning_rate(lr);
        let g_updated = self.generator_optimizer.step(&generator_grads)?;
        let d_updated = self.discriminator_optimizer.step(&discriminator_grads)?;
        trace!("Updated {} generator and {} discriminator tensors", g_updated, d_updated);

        self.global_step += 1;

        Ok(StepReport {
            global_step: self.global_step,
            learning_rate: lr,
            losses,
            x,
            y,
            g_x: outputs.g_x.detach(),
            f_y: outputs.f_y.detach(),
        })
    }

    /// Translate A→B with generator_G in inference mode
    pub fn translate_a_to_b(&self, image: &Tensor) -> Result<Tensor> {
        let image = image.to_device(&self.device)?;
        Ok(self.models.generator_g.forward_t(&image, false)?)
    }

    /// Translate B→A with generator_F in inference mode
    pub fn translate_b_to_a(&self, image: &Tensor) -> Result<Tensor> {
        let image = image.to_device(&self.device)?;
        Ok(self.models.generator_f.forward_t(&image, false)?)
    }
}

//! Loss composition for cycle-consistent adversarial training
//!
//! One forward pass of the [`ModelPair`](crate::networks::ModelPair) is reduced
//! to two differentiable objectives:
//!
//! ```text
//! cycle_loss    = λ (mean|X - F(G(X))| + mean|Y - G(F(Y))|)
//! identity_loss = γ (mean|G(Y) - Y| + mean|F(X) - X|)
//! G_loss        = mean((D_Y(G(X)) - 1)²) + mean((D_X(F(Y)) - 1)²) + cycle_loss + identity_loss
//! D_loss        = ((mean((D_X(X) - 1)²) + mean(D_X(F(Y))²)) + (mean((D_Y(Y) - 1)²) + mean(D_Y(G(X))²))) / 2
//! ```
//!
//! The discriminator terms on generated images are evaluated on detached
//! generator outputs.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::networks::{DetachedFakeScores, ForwardOutputs};

/// Mean squared distance to a constant target
pub fn least_squares(pred: &Tensor, target: f64) -> Result<Tensor> {
    Ok(pred.affine(1.0, -target)?.sqr()?.mean_all()?)
}

/// Mean absolute difference
pub fn mean_abs_diff(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    Ok((a - b)?.abs()?.mean_all()?)
}

/// Generator-side loss tensors
#[derive(Debug, Clone)]
pub struct GeneratorLosses {
    /// Weighted cycle-consistency loss
    pub cycle: Tensor,
    /// Weighted identity loss
    pub identity: Tensor,
    /// Adversarial loss of generator_G against discriminator_Y
    pub x2y: Tensor,
    /// Adversarial loss of generator_F against discriminator_X
    pub y2x: Tensor,
    /// Sum of the four terms
    pub total: Tensor,
}

/// Discriminator-side loss tensors
#[derive(Debug, Clone)]
pub struct DiscriminatorLosses {
    /// discriminator_Y on real B patches
    pub patch_y: Tensor,
    /// discriminator_Y on G(X)
    pub patch_gx: Tensor,
    /// discriminator_X on real A patches
    pub patch_x: Tensor,
    /// discriminator_X on F(Y)
    pub patch_fy: Tensor,
    /// patch_y + patch_gx
    pub loss_y: Tensor,
    /// patch_x + patch_fy
    pub loss_x: Tensor,
    /// (loss_x + loss_y) / 2
    pub total: Tensor,
}

/// Both objectives of one step
#[derive(Debug, Clone)]
pub struct LossTerms {
    /// Generator objective and its parts
    pub generator: GeneratorLosses,
    /// Discriminator objective and its parts
    pub discriminator: DiscriminatorLosses,
}

/// Host-side copy of every reported loss value
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossScalars {
    /// Total generator loss
    pub g_loss: f32,
    /// Weighted cycle loss
    pub cycle_loss: f32,
    /// Weighted identity loss
    pub identity_loss: f32,
    /// A→B adversarial loss
    pub g_loss_x2y: f32,
    /// B→A adversarial loss
    pub g_loss_y2x: f32,
    /// Total discriminator loss
    pub d_loss: f32,
    /// Realism loss of discriminator_X
    pub d_loss_x: f32,
    /// Realism loss of discriminator_Y
    pub d_loss_y: f32,
    /// discriminator_Y on real B patches
    pub d_loss_patch_y: f32,
    /// discriminator_Y on G(X)
    pub d_loss_patch_gx: f32,
    /// discriminator_X on real A patches
    pub d_loss_patch_x: f32,
    /// discriminator_X on F(Y)
    pub d_loss_patch_fy: f32,
}

impl LossScalars {
    /// Generator summary tags and values
    pub fn generator_entries(&self) -> [(&'static str, f32); 5] {
        [
            ("Generator_loss/1_G_loss", self.g_loss),
            ("Generator_loss/2_cycle_loss", self.cycle_loss),
            ("Generator_loss/3_identity_loss", self.identity_loss),
            ("Generator_loss/4_G_loss_X2Y", self.g_loss_x2y),
            ("Generator_loss/5_G_loss_Y2X", self.g_loss_y2x),
        ]
    }

    /// Discriminator summary tags and values
    pub fn discriminator_entries(&self) -> [(&'static str, f32); 5] {
        [
            ("Discriminator_loss/1_D_loss", self.d_loss),
            ("Discriminator_loss/2_D_loss_Y", self.d_loss_patch_y),
            ("Discriminator_loss/3_D_loss_GX", self.d_loss_patch_gx),
            ("Discriminator_loss/4_D_loss_X", self.d_loss_patch_x),
            ("Discriminator_loss/5_D_loss_FY", self.d_loss_patch_fy),
        ]
    }

    /// Whether every value is finite
    pub fn all_finite(&self) -> bool {
        self.generator_entries()
            .iter()
            .chain(self.discriminator_entries().iter())
            .all(|(_, v)| v.is_finite())
    }
}

/// Reduces forward-pass tensors to the generator and discriminator objectives
#[derive(Debug, Clone, Copy)]
pub struct LossComposer {
    lambda_cycle: f64,
    gamma_identity: f64,
}

impl LossComposer {
    /// Create a composer; negative or non-finite weights are rejected
    pub fn new(lambda_cycle: f64, gamma_identity: f64) -> Result<Self> {
        for (name, weight) in [("lambda_cycle", lambda_cycle), ("gamma_identity", gamma_identity)] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(Error::config(format!(
                    "{name} must be a non-negative finite number, got {weight}"
                )));
            }
        }
        Ok(Self {
            lambda_cycle,
            gamma_identity,
        })
    }

    /// Cycle-consistency weight
    pub fn lambda_cycle(&self) -> f64 {
        self.lambda_cycle
    }

    /// Identity weight
    pub fn gamma_identity(&self) -> f64 {
        self.gamma_identity
    }

    /// Weighted cycle-consistency loss
    pub fn cycle_loss(&self, x: &Tensor, f_gx: &Tensor, y: &Tensor, g_fy: &Tensor) -> Result<Tensor> {
        let sum = (mean_abs_diff(x, f_gx)? + mean_abs_diff(y, g_fy)?)?;
        Ok(sum.affine(self.lambda_cycle, 0.0)?)
    }

    /// Weighted identity loss
    pub fn identity_loss(&self, x: &Tensor, g_y: &Tensor, y: &Tensor, f_x: &Tensor) -> Result<Tensor> {
        let sum = (mean_abs_diff(g_y, y)? + mean_abs_diff(f_x, x)?)?;
        Ok(sum.affine(self.gamma_identity, 0.0)?)
    }

    /// Generator objective from a forward pass
    pub fn generator_losses(&self, out: &ForwardOutputs) -> Result<GeneratorLosses> {
        let cycle = self.cycle_loss(&out.x, &out.f_gx, &out.y, &out.g_fy)?;
        let identity = self.identity_loss(&out.x, &out.g_y, &out.y, &out.f_x)?;
        let x2y = least_squares(&out.d_gx, 1.0)?;
        let y2x = least_squares(&out.d_fy, 1.0)?;
        let total = (((&x2y + &y2x)? + &cycle)? + &identity)?;
        Ok(GeneratorLosses {
            cycle,
            identity,
            x2y,
            y2x,
            total,
        })
    }

    /// Discriminator objective from real scores and scores of generated images
    pub fn discriminator_losses(
        &self,
        d_y: &Tensor,
        d_gx: &Tensor,
        d_x: &Tensor,
        d_fy: &Tensor,
    ) -> Result<DiscriminatorLosses> {
        let patch_y = least_squares(d_y, 1.0)?;
        let patch_gx = least_squares(d_gx, 0.0)?;
        let patch_x = least_squares(d_x, 1.0)?;
        let patch_fy = least_squares(d_fy, 0.0)?;
        let loss_y = (&patch_y + &patch_gx)?;
        let loss_x = (&patch_x + &patch_fy)?;
        let total = (&loss_x + &loss_y)?.affine(0.5, 0.0)?;
        Ok(DiscriminatorLosses {
            patch_y,
            patch_gx,
            patch_x,
            patch_fy,
            loss_y,
            loss_x,
            total,
        })
    }

    /// Both objectives; discriminator fake terms use the detached scores
    pub fn compose(&self, out: &ForwardOutputs, fakes: &DetachedFakeScores) -> Result<LossTerms> {
        Ok(LossTerms {
            generator: self.generator_losses(out)?,
            discriminator: self.discriminator_losses(&out.d_y, &fakes.d_gx, &out.d_x, &fakes.d_fy)?,
        })
    }
}

impl LossTerms {
    /// Copy every loss value to the host
    pub fn scalars(&self) -> Result<LossScalars> {
        let s = |t: &Tensor| -> Result<f32> { Ok(t.to_scalar::<f32>()?) };
        let g = &self.generator;
        let d = &self.discriminator;
        Ok(LossScalars {
            g_loss: s(&g.total)?,
            cycle_loss: s(&g.cycle)?,
            identity_loss: s(&g.identity)?,
            g_loss_x2y: s(&g.x2y)?,
            g_loss_y2x: s(&g.y2x)?,
            d_loss: s(&d.total)?,
            d_loss_x: s(&d.loss_x)?,
            d_loss_y: s(&d.loss_y)?,
            d_loss_patch_y: s(&d.patch_y)?,
            d_loss_patch_gx: s(&d.patch_gx)?,
            d_loss_patch_x: s(&d.patch_x)?,
            d_loss_patch_fy: s(&d.patch_fy)?,
        })
    }
}

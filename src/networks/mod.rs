//! Translation and realism networks
//!
//! The training orchestrator only sees networks through the [`Network`] trait:
//! a named, differentiable `forward_t` together with the [`VarMap`] that owns
//! its parameters. [`ModelPair`] bundles the two generators and two
//! discriminators of a cycle-identity setup and runs the coupled forward pass.
//!
//! The reference implementations are [`ResidualGenerator`] and
//! [`PatchDiscriminator`].

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use tracing::debug;

pub mod discriminator;
pub mod generator;
pub mod layers;

pub use discriminator::{DiscriminatorConfig, PatchDiscriminator};
pub use generator::{GeneratorConfig, ResidualGenerator};

use crate::error::{Error, Result};

/// Canonical network names, also used as checkpoint prefixes
pub const GENERATOR_G: &str = "generator_G";
/// B→A generator
pub const GENERATOR_F: &str = "generator_F";
/// A-domain discriminator
pub const DISCRIMINATOR_X: &str = "discriminator_X";
/// B-domain discriminator
pub const DISCRIMINATOR_Y: &str = "discriminator_Y";

/// Which optimizer a network belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkRole {
    /// Translation network, trained on the generator loss
    Generator,
    /// Realism network, trained on the discriminator loss
    Discriminator,
}

impl std::fmt::Display for NetworkRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkRole::Generator => write!(f, "generator"),
            NetworkRole::Discriminator => write!(f, "discriminator"),
        }
    }
}

/// A differentiable network with its own parameter set
pub trait Network: Send + Sync {
    /// Network name
    fn name(&self) -> &str;

    /// Optimizer role
    fn role(&self) -> NetworkRole;

    /// Forward pass; `train` enables batch statistics and their running updates
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor>;

    /// Trainable parameters and batch-norm statistics
    fn varmap(&self) -> &VarMap;
}

/// Reject anything that is not an `(N, channels, H, W)` tensor
pub fn check_input(context: &str, xs: &Tensor, channels: usize) -> Result<()> {
    let dims = xs.dims();
    if dims.len() != 4 || dims[1] != channels {
        return Err(Error::shape(
            context,
            format!("[N, {channels}, H, W]"),
            format!("{dims:?}"),
        ));
    }
    Ok(())
}

/// Every tensor produced by one coupled forward pass
#[derive(Debug, Clone)]
pub struct ForwardOutputs {
    /// A-domain input patch
    pub x: Tensor,
    /// B-domain input patch
    pub y: Tensor,
    /// generator_G(x)
    pub g_x: Tensor,
    /// generator_F(G_X)
    pub f_gx: Tensor,
    /// generator_F(y)
    pub f_y: Tensor,
    /// generator_G(F_Y)
    pub g_fy: Tensor,
    /// generator_G(y)
    pub g_y: Tensor,
    /// generator_F(x)
    pub f_x: Tensor,
    /// discriminator_Y(G_X)
    pub d_gx: Tensor,
    /// discriminator_X(F_Y)
    pub d_fy: Tensor,
    /// discriminator_Y(y)
    pub d_y: Tensor,
    /// discriminator_X(x)
    pub d_x: Tensor,
}

/// Discriminator scores on generator outputs cut from the generator graph
#[derive(Debug, Clone)]
pub struct DetachedFakeScores {
    /// discriminator_Y(detach(G_X))
    pub d_gx: Tensor,
    /// discriminator_X(detach(F_Y))
    pub d_fy: Tensor,
}

/// Two generators and two discriminators trained together
pub struct ModelPair {
    /// A→B translator
    pub generator_g: Box<dyn Network>,
    /// B→A translator
    pub generator_f: Box<dyn Network>,
    /// A-domain realism
    pub discriminator_x: Box<dyn Network>,
    /// B-domain realism
    pub discriminator_y: Box<dyn Network>,
    channels: usize,
}

impl ModelPair {
    /// Assemble a pair from arbitrary networks
    pub fn new(
        generator_g: Box<dyn Network>,
        generator_f: Box<dyn Network>,
        discriminator_x: Box<dyn Network>,
        discriminator_y: Box<dyn Network>,
        channels: usize,
    ) -> Result<Self> {
        let expected = [
            (&generator_g, NetworkRole::Generator),
            (&generator_f, NetworkRole::Generator),
            (&discriminator_x, NetworkRole::Discriminator),
            (&discriminator_y, NetworkRole::Discriminator),
        ];
        for (network, role) in expected {
            if network.role() != role {
                return Err(Error::config(format!(
                    "network '{}' has role {}, expected {}",
                    network.name(),
                    network.role(),
                    role
                )));
            }
        }

        Ok(Self {
            generator_g,
            generator_f,
            discriminator_x,
            discriminator_y,
            channels,
        })
    }

    /// Build the reference generators and discriminators
    ///
    /// Fails with a configuration error when `patch_size` is too small for the
    /// discriminator to produce a score map.
    pub fn reference(
        generator: GeneratorConfig,
        discriminator: DiscriminatorConfig,
        patch_size: usize,
        device: &Device,
    ) -> Result<Self> {
        if generator.channels != discriminator.channels {
            return Err(Error::config(format!(
                "generator channels ({}) differ from discriminator channels ({})",
                generator.channels, discriminator.channels
            )));
        }
        if generator.channels == 0 || generator.ngf == 0 || generator.nglf == 0 || discriminator.ndf == 0 {
            return Err(Error::config("network widths and channel depth must be positive"));
        }
        let score = discriminator.score_map_size(patch_size).ok_or_else(|| {
            Error::config(format!(
                "patch size {patch_size} collapses the discriminator score map"
            ))
        })?;
        debug!("Discriminator score map: {score}x{score} for patch {patch_size}");

        let channels = generator.channels;
        Self::new(
            Box::new(ResidualGenerator::new(GENERATOR_G, generator.clone(), device)?),
            Box::new(ResidualGenerator::new(GENERATOR_F, generator, device)?),
            Box::new(PatchDiscriminator::new(DISCRIMINATOR_X, discriminator.clone(), device)?),
            Box::new(PatchDiscriminator::new(DISCRIMINATOR_Y, discriminator, device)?),
            channels,
        )
    }

    /// Image channel depth
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// All four networks in canonical order
    pub fn networks(&self) -> [&dyn Network; 4] {
        [
            self.generator_g.as_ref(),
            self.generator_f.as_ref(),
            self.discriminator_x.as_ref(),
            self.discriminator_y.as_ref(),
        ]
    }

    /// Networks owned by one optimizer role
    pub fn networks_for(&self, role: NetworkRole) -> Vec<&dyn Network> {
        self.networks()
            .into_iter()
            .filter(|n| n.role() == role)
            .collect()
    }

    /// Run the full coupled forward pass
    pub fn forward(&self, x: &Tensor, y: &Tensor, train: bool) -> Result<ForwardOutputs> {
        check_input("patch_X", x, self.channels)?;
        check_input("patch_Y", y, self.channels)?;
        if x.dims() != y.dims() {
            return Err(Error::shape(
                "patch pair",
                format!("{:?}", x.dims()),
                format!("{:?}", y.dims()),
            ));
        }

        let g_x = self.generator_g.forward_t(x, train)?;
        let f_gx = self.generator_f.forward_t(&g_x, train)?;
        let f_y = self.generator_f.forward_t(y, train)?;
        let g_fy = self.generator_g.forward_t(&f_y, train)?;
        let g_y = self.generator_g.forward_t(y, train)?;
        let f_x = self.generator_f.forward_t(x, train)?;

        let d_gx = self.discriminator_y.forward_t(&g_x, train)?;
        let d_fy = self.discriminator_x.forward_t(&f_y, train)?;
        let d_y = self.discriminator_y.forward_t(y, train)?;
        let d_x = self.discriminator_x.forward_t(x, train)?;

        Ok(ForwardOutputs {
            x: x.clone(),
            y: y.clone(),
            g_x,
            f_gx,
            f_y,
            g_fy,
            g_y,
            f_x,
            d_gx,
            d_fy,
            d_y,
            d_x,
        })
    }

    /// Score the generator outputs with gradients stopped at the generators
    pub fn score_detached_fakes(&self, outputs: &ForwardOutputs, train: bool) -> Result<DetachedFakeScores> {
        let d_gx = self.discriminator_y.forward_t(&outputs.g_x.detach(), train)?;
        let d_fy = self.discriminator_x.forward_t(&outputs.f_y.detach(), train)?;
        Ok(DetachedFakeScores { d_gx, d_fy })
    }
}

#[cfg(test)]
mod tests;

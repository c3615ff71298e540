//! Least-squares patch discriminator

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use super::layers::{conv_output_size, Activation, ChannelDense, ConvBlock};
use super::{check_input, Network, NetworkRole};
use crate::error::{Error, Result};

/// (kernel, stride) of every conv stage, in order
const STAGES: [(usize, usize); 5] = [(4, 2), (4, 2), (4, 2), (4, 1), (4, 1)];

/// Discriminator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscriminatorConfig {
    /// Image channel depth
    pub channels: usize,
    /// Base feature width
    pub ndf: usize,
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        Self { channels: 1, ndf: 64 }
    }
}

impl DiscriminatorConfig {
    /// Side length of the score map for a square input, `None` if it collapses
    pub fn score_map_size(&self, input: usize) -> Option<usize> {
        STAGES
            .iter()
            .try_fold(input, |size, &(kernel, stride)| conv_output_size(size, kernel, stride))
    }
}

/// Patch discriminator producing a realism score map
pub struct PatchDiscriminator {
    name: String,
    config: DiscriminatorConfig,
    varmap: VarMap,
    blocks: Vec<ConvBlock>,
    dense: ChannelDense,
}

impl PatchDiscriminator {
    /// Build a discriminator with freshly initialized parameters
    pub fn new(name: impl Into<String>, config: DiscriminatorConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let ndf = config.ndf;

        let widths = [ndf, ndf * 2, ndf * 4, ndf * 8, config.channels];
        let mut blocks = Vec::with_capacity(STAGES.len());
        let mut in_channels = config.channels;
        for (i, (&(kernel, stride), &out_channels)) in STAGES.iter().zip(widths.iter()).enumerate() {
            // First stage has no batch norm, last stage is linear.
            let with_norm = i != 0 && i != STAGES.len() - 1;
            let activation = if i == STAGES.len() - 1 {
                Activation::Identity
            } else {
                Activation::LeakyRelu
            };
            blocks.push(ConvBlock::new(
                in_channels,
                out_channels,
                kernel,
                stride,
                with_norm,
                activation,
                vb.pp(format!("layer{}", i + 1)),
            )?);
            in_channels = out_channels;
        }

        let dense = ChannelDense::new(config.channels, config.channels, vb.pp("dense"))?;

        Ok(Self {
            name: name.into(),
            config,
            varmap,
            blocks,
            dense,
        })
    }

    /// Get configuration
    pub fn config(&self) -> &DiscriminatorConfig {
        &self.config
    }
}

impl Network for PatchDiscriminator {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> NetworkRole {
        NetworkRole::Discriminator
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        check_input(&self.name, xs, self.config.channels)?;
        let (_, _, h, w) = xs.dims4()?;
        if self.config.score_map_size(h).is_none() || self.config.score_map_size(w).is_none() {
            return Err(Error::shape(
                self.name.clone(),
                "spatial size large enough for a non-empty score map",
                format!("{h}x{w}"),
            ));
        }

        let mut out = xs.clone();
        for block in &self.blocks {
            out = block.forward_t(&out, train)?;
        }
        self.dense.forward(&out)
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(32 => Some(2))]
    #[test_case(56 => Some(5))]
    #[test_case(16 => None)]
    fn test_score_map_size(input: usize) -> Option<usize> {
        DiscriminatorConfig { channels: 1, ndf: 4 }.score_map_size(input)
    }

    #[test]
    fn test_discriminator_score_map_shape() {
        let device = Device::Cpu;
        let config = DiscriminatorConfig { channels: 1, ndf: 4 };
        let disc = PatchDiscriminator::new("discriminator_Y", config, &device).unwrap();

        let xs = Tensor::randn(0f32, 0.5, (2, 1, 32, 32), &device).unwrap();
        let out = disc.forward_t(&xs, true).unwrap();
        assert_eq!(out.dims(), &[2, 1, 2, 2]);
    }

    #[test]
    fn test_discriminator_rejects_collapsing_input() {
        let device = Device::Cpu;
        let config = DiscriminatorConfig { channels: 1, ndf: 4 };
        let disc = PatchDiscriminator::new("discriminator_X", config, &device).unwrap();

        let xs = Tensor::zeros((1, 1, 16, 16), DType::F32, &device).unwrap();
        assert!(matches!(disc.forward_t(&xs, false), Err(Error::Shape { .. })));
    }
}

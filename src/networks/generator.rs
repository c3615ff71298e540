//! Residual generator with dense feature concatenation
//!
//! A 3x3 stem feeds six residual modules. The stem and every module output are
//! concatenated along the channel axis, squeezed back down by two conv blocks,
//! projected to the image channel count and added to the input image.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Conv2d, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use super::layers::{conv2d, Activation, ConvBlock};
use super::{check_input, Network, NetworkRole};
use crate::error::Result;

/// Generator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Image channel depth
    pub channels: usize,
    /// Feature width of the stem and modules
    pub ngf: usize,
    /// Feature width of the last conv block
    pub nglf: usize,
    /// Number of residual modules
    pub num_modules: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            channels: 1,
            ngf: 128,
            nglf: 15,
            num_modules: 6,
        }
    }
}

/// Three conv blocks with a skip connection around them
#[derive(Debug, Clone)]
struct ResidualModule {
    layers: [ConvBlock; 3],
}

impl ResidualModule {
    fn new(width: usize, vb: VarBuilder) -> Result<Self> {
        let block = |name: &str| ConvBlock::new(width, width, 3, 1, true, Activation::Relu, vb.pp(name));
        Ok(Self {
            layers: [block("l1")?, block("l2")?, block("l3")?],
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut out = xs.clone();
        for layer in &self.layers {
            out = layer.forward_t(&out, train)?;
        }
        Ok((xs + out)?.relu()?)
    }
}

/// Image-to-image translation network
pub struct ResidualGenerator {
    name: String,
    config: GeneratorConfig,
    varmap: VarMap,
    stem: ConvBlock,
    modules: Vec<ResidualModule>,
    squeeze: ConvBlock,
    last: ConvBlock,
    output: Conv2d,
}

impl ResidualGenerator {
    /// Build a generator with freshly initialized parameters
    pub fn new(name: impl Into<String>, config: GeneratorConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let width = config.ngf;
        let stem = ConvBlock::new(config.channels, width, 3, 1, true, Activation::Relu, vb.pp("stem"))?;
        let modules = (0..config.num_modules)
            .map(|i| ResidualModule::new(width, vb.pp(format!("module{}", i + 1))))
            .collect::<Result<Vec<_>>>()?;

        let concat_width = width * (config.num_modules + 1);
        let squeeze = ConvBlock::new(concat_width, width, 3, 1, true, Activation::Relu, vb.pp("squeeze"))?;
        let last = ConvBlock::new(width, config.nglf, 3, 1, true, Activation::Relu, vb.pp("last"))?;
        let output = conv2d(config.nglf, config.channels, 3, 1, vb.pp("output"))?;

        Ok(Self {
            name: name.into(),
            config,
            varmap,
            stem,
            modules,
            squeeze,
            last,
            output,
        })
    }

    /// Get configuration
    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }
}

impl Network for ResidualGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> NetworkRole {
        NetworkRole::Generator
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        check_input(&self.name, xs, self.config.channels)?;

        let stem = self.stem.forward_t(xs, train)?;
        let mut features = Vec::with_capacity(self.modules.len() + 1);
        features.push(stem.clone());

        let mut current = stem;
        for module in &self.modules {
            current = module.forward_t(&current, train)?;
            features.push(current.clone());
        }

        let concat = Tensor::cat(&features, 1)?;
        let out = self.squeeze.forward_t(&concat, train)?;
        let out = self.last.forward_t(&out, train)?;
        let out = self.output.forward(&out)?;
        Ok((out + xs)?)
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> GeneratorConfig {
        GeneratorConfig {
            channels: 1,
            ngf: 4,
            nglf: 3,
            num_modules: 6,
        }
    }

    #[test]
    fn test_generator_preserves_shape() {
        let device = Device::Cpu;
        let gen = ResidualGenerator::new("generator_G", small_config(), &device).unwrap();

        let xs = Tensor::randn(0f32, 0.5, (2, 1, 16, 16), &device).unwrap();
        let out = gen.forward_t(&xs, true).unwrap();
        assert_eq!(out.dims(), xs.dims());

        // Whole-image inference works at a different spatial size.
        let big = Tensor::randn(0f32, 0.5, (1, 1, 24, 20), &device).unwrap();
        let out = gen.forward_t(&big, false).unwrap();
        assert_eq!(out.dims(), &[1, 1, 24, 20]);
    }

    #[test]
    fn test_generator_rejects_wrong_channels() {
        let device = Device::Cpu;
        let gen = ResidualGenerator::new("generator_F", small_config(), &device).unwrap();

        let xs = Tensor::zeros((1, 3, 16, 16), DType::F32, &device).unwrap();
        let err = gen.forward_t(&xs, false).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_generator_parameter_names() {
        let gen = ResidualGenerator::new("generator_G", small_config(), &Device::Cpu).unwrap();
        let data = gen.varmap().data().lock().unwrap();
        assert!(data.contains_key("stem.conv.weight"));
        assert!(data.contains_key("module6.l3.bn.running_var"));
        assert!(data.contains_key("output.bias"));
        assert!(!data.contains_key("output.bn.weight"));
    }
}

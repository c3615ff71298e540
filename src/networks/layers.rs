//! Convolution building blocks shared by the reference networks

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Init, Linear, VarBuilder};

use crate::error::Result;

/// Standard deviation of the normal initializer for convolution kernels
pub const CONV_INIT_STDEV: f64 = 0.02;

/// Batch-norm epsilon
pub const BN_EPS: f64 = 1e-5;

/// Batch-norm running statistics momentum
pub const BN_MOMENTUM: f64 = 0.1;

/// Slope of the leaky ReLU used by discriminators
pub const LEAKY_SLOPE: f64 = 0.2;

/// Activation applied after a convolution block
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    /// No activation
    Identity,
    /// Rectified linear unit
    Relu,
    /// Leaky ReLU with [`LEAKY_SLOPE`]
    LeakyRelu,
}

impl Activation {
    /// Apply the activation
    pub fn apply(self, xs: &Tensor) -> Result<Tensor> {
        let out = match self {
            Activation::Identity => xs.clone(),
            Activation::Relu => xs.relu()?,
            Activation::LeakyRelu => candle_nn::ops::leaky_relu(xs, LEAKY_SLOPE)?,
        };
        Ok(out)
    }
}

/// Convolution with one pixel of zero padding on every side
///
/// Kernels are drawn from N(0, 0.02) and biases start at zero.
pub fn conv2d(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let weight = vb.get_with_hints(
        (out_channels, in_channels, kernel, kernel),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: CONV_INIT_STDEV,
        },
    )?;
    let bias = vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?;
    let config = Conv2dConfig {
        padding: 1,
        stride,
        ..Default::default()
    };
    Ok(Conv2d::new(weight, Some(bias), config))
}

/// Batch normalization with gamma drawn from N(1, 0.02)
///
/// The running mean and variance are registered in the same var map as the
/// affine parameters, so they travel with checkpoints.
pub fn batch_norm(num_features: usize, vb: VarBuilder) -> Result<BatchNorm> {
    // Registering the scale first makes `batch_norm` pick up this initializer.
    vb.get_with_hints(
        num_features,
        "weight",
        Init::Randn {
            mean: 1.0,
            stdev: CONV_INIT_STDEV,
        },
    )?;
    let config = BatchNormConfig {
        eps: BN_EPS,
        remove_mean: true,
        affine: true,
        momentum: BN_MOMENTUM,
    };
    Ok(candle_nn::batch_norm(num_features, config, vb)?)
}

/// Convolution, optional batch norm, activation
#[derive(Debug, Clone)]
pub struct ConvBlock {
    conv: Conv2d,
    norm: Option<BatchNorm>,
    activation: Activation,
}

impl ConvBlock {
    /// Build a block under `vb`, registering `conv` and (optionally) `bn` sub-paths
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        with_norm: bool,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv = conv2d(in_channels, out_channels, kernel, stride, vb.pp("conv"))?;
        let norm = if with_norm {
            Some(batch_norm(out_channels, vb.pp("bn"))?)
        } else {
            None
        };
        Ok(Self {
            conv,
            norm,
            activation,
        })
    }

    /// Forward pass; `train` selects batch statistics and updates running ones
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut out = self.conv.forward(xs)?;
        if let Some(norm) = &self.norm {
            out = norm.forward_t(&out, train)?;
        }
        self.activation.apply(&out)
    }
}

/// Dense layer applied independently at every spatial position of an NCHW map
#[derive(Debug, Clone)]
pub struct ChannelDense {
    linear: Linear,
}

impl ChannelDense {
    /// Create a dense layer mapping `in_channels` to `out_channels`
    pub fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            linear: candle_nn::linear(in_channels, out_channels, vb)?,
        })
    }

    /// Apply over the channel axis
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let nhwc = xs.permute((0, 2, 3, 1))?.contiguous()?;
        let out = self.linear.forward(&nhwc)?;
        Ok(out.permute((0, 3, 1, 2))?.contiguous()?)
    }
}

/// Spatial size after a padded convolution, `None` when the map collapses
pub fn conv_output_size(input: usize, kernel: usize, stride: usize) -> Option<usize> {
    let padded = input + 2;
    if padded < kernel || stride == 0 {
        return None;
    }
    let out = (padded - kernel) / stride + 1;
    (out > 0).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_conv_output_size() {
        assert_eq!(conv_output_size(32, 4, 2), Some(16));
        assert_eq!(conv_output_size(4, 4, 1), Some(3));
        assert_eq!(conv_output_size(32, 3, 1), Some(32));
        assert_eq!(conv_output_size(1, 4, 1), None);
    }

    #[test]
    fn test_batch_norm_stats_live_in_varmap() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        batch_norm(8, vb.pp("bn")).unwrap();

        let data = varmap.data().lock().unwrap();
        for name in ["bn.weight", "bn.bias", "bn.running_mean", "bn.running_var"] {
            assert!(data.contains_key(name), "missing {name}");
        }
    }

    #[test]
    fn test_conv_block_preserves_size_for_3x3() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block = ConvBlock::new(1, 4, 3, 1, true, Activation::Relu, vb).unwrap();

        let xs = Tensor::randn(0f32, 1.0, (2, 1, 8, 8), &Device::Cpu).unwrap();
        let out = block.forward_t(&xs, true).unwrap();
        assert_eq!(out.dims(), &[2, 4, 8, 8]);
    }
}

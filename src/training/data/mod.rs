//! Data loading infrastructure for cycle-identity training
//!
//! Whole images of both domains are held in memory as normalized `[-1, 1]`
//! pixels. Training batches are random or sequential patch crops materialized
//! by background workers; test sets are served at whole-image size.

use anyhow::Result;
use candle_core::{DType, Tensor};
use std::sync::Arc;

pub mod batching;
pub mod datasets;
pub mod loaders;
pub mod pipeline;

// Re-exports
pub use batching::{BatchPlan, CropSpec, PatchCollator, PatchPair};
pub use datasets::{InMemoryDataset, NpyImageDataset};
pub use loaders::{DataLoader, DataLoaderConfig, DataLoaderStream};
pub use pipeline::DataPipeline;

/// Common trait for image datasets
pub trait Dataset: Send + Sync {
    /// Get the number of images in the dataset
    fn len(&self) -> usize;

    /// Check if the dataset is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get an image by index
    fn get(&self, index: usize) -> Result<ImageSample>;

    /// Get dataset metadata
    fn metadata(&self) -> &DatasetMetadata;
}

/// One whole image, normalized to `[-1, 1]`, laid out as `(C, H, W)`
#[derive(Debug, Clone)]
pub struct ImageSample {
    /// Source identifier (file name without the `.npy` suffix)
    pub id: String,
    /// Channel depth
    pub channels: usize,
    /// Height in pixels
    pub height: usize,
    /// Width in pixels
    pub width: usize,
    /// Pixel values
    pub pixels: Arc<[f32]>,
}

impl ImageSample {
    /// Create a sample, checking that the pixel count matches the shape
    pub fn new(
        id: impl Into<String>,
        channels: usize,
        height: usize,
        width: usize,
        pixels: Vec<f32>,
    ) -> std::result::Result<Self, DataError> {
        let id = id.into();
        if pixels.len() != channels * height * width {
            return Err(DataError::MalformedData {
                id,
                reason: format!(
                    "{} values for shape ({channels}, {height}, {width})",
                    pixels.len()
                ),
            });
        }
        Ok(Self {
            id,
            channels,
            height,
            width,
            pixels: pixels.into(),
        })
    }

    /// Copy out a `(C, size, size)` patch with its top-left corner at `(top, left)`
    pub fn crop(&self, top: usize, left: usize, size: usize) -> std::result::Result<Vec<f32>, DataError> {
        if top + size > self.height || left + size > self.width {
            return Err(DataError::MalformedData {
                id: self.id.clone(),
                reason: format!(
                    "crop {size}x{size} at ({top}, {left}) outside {}x{}",
                    self.height, self.width
                ),
            });
        }

        let mut out = Vec::with_capacity(self.channels * size * size);
        for c in 0..self.channels {
            let plane = c * self.height * self.width;
            for row in top..top + size {
                let start = plane + row * self.width + left;
                out.extend_from_slice(&self.pixels[start..start + size]);
            }
        }
        Ok(out)
    }

    /// Whole image as a `(1, C, H, W)` CPU tensor
    pub fn to_tensor(&self) -> Result<Tensor> {
        Ok(Tensor::from_slice(
            &self.pixels[..],
            (1, self.channels, self.height, self.width),
            &candle_core::Device::Cpu,
        )?)
    }
}

/// Dataset metadata
#[derive(Debug, Clone)]
pub struct DatasetMetadata {
    /// Dataset name/identifier
    pub name: String,
    /// Number of images
    pub num_samples: usize,
    /// Image identifiers in index order
    pub ids: Vec<String>,
}

/// Error types for data loading
#[derive(thiserror::Error, Debug)]
pub enum DataError {
    /// Directory or file missing
    #[error("Dataset not found: {path}")]
    DatasetNotFound {
        /// Missing path
        path: String,
    },

    /// Dataset contains no images
    #[error("Dataset '{name}' is empty")]
    Empty {
        /// Dataset name
        name: String,
    },

    /// Index out of range
    #[error("Invalid sample index: {index} >= {dataset_size}")]
    InvalidIndex {
        /// Requested index
        index: usize,
        /// Dataset length
        dataset_size: usize,
    },

    /// Image with an unexpected shape or content
    #[error("Malformed image '{id}': {reason}")]
    MalformedData {
        /// Image identifier
        id: String,
        /// What is wrong with it
        reason: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Tensor error
    #[error("Tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

/// Map raw intensities in `[min, max]` to `[-1, 1]`, clamping outliers
pub fn normalize(value: f32, min: f32, max: f32) -> f32 {
    let clipped = value.clamp(min, max);
    2.0 * (clipped - min) / (max - min) - 1.0
}

/// Linearly map values from `[in_min, in_max]` to `[out_min, out_max]`, clamp, and cast
///
/// Used for exporting images: `[-1, 1]` network outputs become `u8` for
/// summaries or raw intensities for `.npy` artifacts.
pub fn rescale(
    tensor: &Tensor,
    in_min: f64,
    in_max: f64,
    out_min: f64,
    out_max: f64,
    out_dtype: DType,
) -> Result<Tensor> {
    if in_max == in_min || !(in_max - in_min).is_finite() {
        return Err(crate::Error::config(format!(
            "rescale input range [{in_min}, {in_max}] is empty"
        ))
        .into());
    }
    let scale = (out_max - out_min) / (in_max - in_min);
    let shift = out_min - in_min * scale;
    let (lo, hi) = if out_min <= out_max {
        (out_min, out_max)
    } else {
        (out_max, out_min)
    };

    let mapped = tensor
        .to_dtype(DType::F32)?
        .affine(scale, shift)?
        .clamp(lo, hi)?;
    let mapped = match out_dtype {
        DType::U8 | DType::U32 | DType::I64 => mapped.round()?,
        _ => mapped,
    };
    Ok(mapped.to_dtype(out_dtype)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    #[test]
    fn test_normalize_range() {
        assert_relative_eq!(normalize(-1024.0, -1024.0, 3072.0), -1.0);
        assert_relative_eq!(normalize(3072.0, -1024.0, 3072.0), 1.0);
        assert_relative_eq!(normalize(1024.0, -1024.0, 3072.0), 0.0);
        assert_relative_eq!(normalize(9999.0, -1024.0, 3072.0), 1.0);
    }

    #[test]
    fn test_rescale_to_u8() {
        let t = Tensor::new(&[-1f32, 0.0, 1.0, 2.0], &Device::Cpu).unwrap();
        let out = rescale(&t, -1.0, 1.0, 0.0, 255.0, DType::U8).unwrap();
        assert_eq!(out.dtype(), DType::U8);
        assert_eq!(out.to_vec1::<u8>().unwrap(), vec![0, 128, 255, 255]);
    }

    #[test]
    fn test_rescale_rejects_empty_input_range() {
        let t = Tensor::new(&[0f32, 1.0], &Device::Cpu).unwrap();
        let err = rescale(&t, 1.0, 1.0, 0.0, 255.0, DType::U8).unwrap_err();
        assert!(err
            .downcast_ref::<crate::Error>()
            .is_some_and(|e| e.is_configuration()));
    }

    #[test]
    fn test_crop_layout() {
        // 2 channels of 3x3: channel c holds 10*c + row*3 + col
        let pixels: Vec<f32> = (0..2)
            .flat_map(|c| (0..9).map(move |i| (10 * c + i) as f32))
            .collect();
        let sample = ImageSample::new("img", 2, 3, 3, pixels).unwrap();

        let patch = sample.crop(1, 1, 2).unwrap();
        assert_eq!(patch, vec![4.0, 5.0, 7.0, 8.0, 14.0, 15.0, 17.0, 18.0]);
        assert!(sample.crop(2, 2, 2).is_err());
    }

    #[test]
    fn test_sample_shape_checked() {
        assert!(ImageSample::new("bad", 1, 2, 2, vec![0.0; 3]).is_err());
    }
}

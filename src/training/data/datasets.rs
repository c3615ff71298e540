//! Dataset implementations for cycle-identity training

use super::{normalize, DataError, Dataset, DatasetMetadata, ImageSample};
use anyhow::Result;
use candle_core::{DType, Tensor};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Images held entirely in memory
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    metadata: DatasetMetadata,
    samples: Vec<ImageSample>,
}

impl InMemoryDataset {
    /// Create a dataset from already normalized samples
    pub fn new(name: impl Into<String>, samples: Vec<ImageSample>) -> Self {
        let metadata = DatasetMetadata {
            name: name.into(),
            num_samples: samples.len(),
            ids: samples.iter().map(|s| s.id.clone()).collect(),
        };
        Self { metadata, samples }
    }

    /// Borrow all samples
    pub fn samples(&self) -> &[ImageSample] {
        &self.samples
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<ImageSample> {
        self.samples.get(index).cloned().ok_or_else(|| {
            DataError::InvalidIndex {
                index,
                dataset_size: self.samples.len(),
            }
            .into()
        })
    }

    fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }
}

/// Directory of `.npy` whole images in raw intensity units
///
/// Every file must hold a square `whole_size` image as `(H, W)` (single
/// channel), `(C, H, W)` or `(1, C, H, W)`. Files are read in name order and
/// normalized from `[value_min, value_max]` to `[-1, 1]`.
pub struct NpyImageDataset {
    root: PathBuf,
    whole_size: usize,
    channels: usize,
    value_min: f32,
    value_max: f32,
}

impl NpyImageDataset {
    /// Describe a directory to load
    pub fn new(
        root: impl AsRef<Path>,
        whole_size: usize,
        channels: usize,
        value_min: f32,
        value_max: f32,
    ) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            whole_size,
            channels,
            value_min,
            value_max,
        }
    }

    /// Read and normalize every image in the directory
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub fn load(&self) -> Result<InMemoryDataset> {
        if !self.root.is_dir() {
            return Err(DataError::DatasetNotFound {
                path: self.root.to_string_lossy().to_string(),
            }
            .into());
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.root)
            .map_err(DataError::from)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().map_or(false, |ext| ext == "npy"))
            .collect();
        files.sort();

        let name = self.root.to_string_lossy().to_string();
        if files.is_empty() {
            return Err(DataError::Empty { name }.into());
        }

        let samples = files
            .iter()
            .map(|path| self.load_file(path))
            .collect::<Result<Vec<_>>>()?;

        info!("Loaded {} images from {}", samples.len(), name);
        Ok(InMemoryDataset::new(name, samples))
    }

    fn load_file(&self, path: &Path) -> Result<ImageSample> {
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        let tensor = Tensor::read_npy(path).map_err(DataError::from)?;
        let tensor = match tensor.rank() {
            2 if self.channels == 1 => tensor.unsqueeze(0).map_err(DataError::from)?,
            3 => tensor,
            4 if tensor.dim(0).map_err(DataError::from)? == 1 => {
                tensor.squeeze(0).map_err(DataError::from)?
            }
            _ => {
                return Err(DataError::MalformedData {
                    id,
                    reason: format!("unsupported array shape {:?}", tensor.dims()),
                }
                .into())
            }
        };

        let (c, h, w) = tensor.dims3().map_err(DataError::from)?;
        if c != self.channels || h != self.whole_size || w != self.whole_size {
            return Err(DataError::MalformedData {
                id,
                reason: format!(
                    "expected ({}, {}, {}), found ({c}, {h}, {w})",
                    self.channels, self.whole_size, self.whole_size
                ),
            }
            .into());
        }

        let raw = tensor
            .to_dtype(DType::F32)
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(DataError::from)?;
        let pixels = raw
            .into_iter()
            .map(|v| normalize(v, self.value_min, self.value_max))
            .collect();

        debug!("Loaded image '{}' ({c}x{h}x{w})", id);
        Ok(ImageSample::new(id, c, h, w, pixels)?)
    }
}

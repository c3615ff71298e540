//! Utility functions shared by the training, checkpoint and export layers

use std::fs;
use std::path::Path;

use crate::error::Result;

/// File I/O utilities
pub mod io {
    use super::*;

    /// Ensure directory exists (idempotent)
    pub fn ensure_dir_exists<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        Ok(())
    }

    /// Check if file exists and is readable
    pub fn is_file_readable<P: AsRef<Path>>(path: P) -> bool {
        let path = path.as_ref();
        path.is_file() && fs::metadata(path).is_ok()
    }

    /// Write through a sibling temporary file and rename it into place
    pub fn write_file_atomic<P: AsRef<Path>>(path: P, content: &[u8]) -> Result<()> {
        let path = path.as_ref();
        let temp_path = temp_sibling(path);

        fs::write(&temp_path, content)?;
        fs::rename(temp_path, path)?;

        Ok(())
    }

    /// Temporary sibling name used before an atomic rename
    pub fn temp_sibling(path: &Path) -> std::path::PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        path.with_file_name(name)
    }
}

/// Configuration file utilities
pub mod config {
    use serde::{Deserialize, Serialize};

    use super::*;

    fn is_yaml(path: &Path) -> bool {
        path.extension()
            .map_or(false, |ext| ext == "yaml" || ext == "yml")
    }

    /// Load configuration from a JSON or YAML file, chosen by extension
    pub fn load_config<T, P>(path: P) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
        P: AsRef<Path>,
    {
        let content = fs::read_to_string(path.as_ref())?;

        let config = if is_yaml(path.as_ref()) {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };

        Ok(config)
    }

    /// Save configuration to a JSON or YAML file, chosen by extension
    pub fn save_config<T, P>(config: &T, path: P) -> Result<()>
    where
        T: Serialize,
        P: AsRef<Path>,
    {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                super::io::ensure_dir_exists(parent)?;
            }
        }

        let content = if is_yaml(path.as_ref()) {
            serde_yaml::to_string(config)?
        } else {
            serde_json::to_string_pretty(config)?
        };

        super::io::write_file_atomic(path, content.as_bytes())?;
        Ok(())
    }
}

/// Performance timing utilities
pub mod timing {
    use std::time::{Duration, Instant};

    /// Simple timer for measuring performance
    pub struct Timer {
        start: Instant,
        name: String,
    }

    impl Timer {
        /// Start a new timer
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                start: Instant::now(),
                name: name.into(),
            }
        }

        /// Get elapsed time
        pub fn elapsed(&self) -> Duration {
            self.start.elapsed()
        }

        /// Get elapsed time in milliseconds
        pub fn elapsed_ms(&self) -> f64 {
            self.elapsed().as_secs_f64() * 1000.0
        }

        /// Stop timer and log result
        pub fn stop(self) -> Duration {
            let elapsed = self.elapsed();
            tracing::debug!("Timer '{}' elapsed: {:.2}ms", self.name, self.elapsed_ms());
            elapsed
        }
    }
}

/// Run identifiers
pub mod task_id {
    use chrono::{DateTime, Utc};

    /// Generate a task identifier from the given instant
    pub fn from_time(now: DateTime<Utc>) -> String {
        now.format("%Y%m%d_%H%M%S").to_string()
    }

    /// Generate a task identifier from the current UTC time
    pub fn generate() -> String {
        from_time(Utc::now())
    }
}

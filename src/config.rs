//! Construction-time configuration of the heap.
//!
//! Values are layered the usual way:
//! 1. Defaults
//! 2. `segheap.yaml` in the working directory (or an explicit file)
//! 3. `SEGHEAP_*` environment variables

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use validator::{Validate, ValidationErrors};

use crate::utils::align_word;

/// File picked up by [`HeapConfig::load`] when present.
pub const DEFAULT_CONFIG_FILE: &str = "segheap.yaml";

const ENV_PREFIX: &str = "SEGHEAP_";

/// Default bytes per segment.
pub const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("configuration parsing error: {0}")]
    Parsing(#[from] Box<figment::Error>),

    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationErrors),
}

impl From<figment::Error> for ConfigError {
    fn from(error: figment::Error) -> Self {
        Self::Parsing(Box::new(error))
    }
}

/// Knobs of a [`crate::MasterHeap`].
///
/// `segment_size` trades fragmentation against how often a heap has to grow:
/// bigger segments hold more blocks before a new one is mapped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct HeapConfig {
    /// Bytes per segment, headers included.
    #[validate(range(min = 128, max = 1073741824))]
    #[serde(default = "default_segment_size")]
    pub segment_size: usize,

    /// Number of heaps. One per logical processor when unset.
    #[validate(range(min = 1, max = 1024))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heaps: Option<usize>,
}

fn default_segment_size() -> usize {
    DEFAULT_SEGMENT_SIZE
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            segment_size: default_segment_size(),
            heaps: None,
        }
    }
}

impl HeapConfig {
    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.segment_size = segment_size;
        self
    }

    pub fn with_heaps(mut self, heaps: usize) -> Self {
        self.heaps = Some(heaps);
        self
    }

    /// Segment size as the segments will use it.
    #[inline]
    pub fn aligned_segment_size(&self) -> usize {
        align_word(self.segment_size)
    }

    /// Load defaults, then `segheap.yaml` if it exists, then the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if Path::new(DEFAULT_CONFIG_FILE).exists() {
            figment = figment.merge(Yaml::file(DEFAULT_CONFIG_FILE));
        } else {
            debug!("{DEFAULT_CONFIG_FILE} not found, using default configuration");
        }

        Self::extract(figment)
    }

    /// Load from a specific file, which must exist, plus the environment.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let figment = Figment::from(Serialized::defaults(Self::default())).merge(Yaml::file(path));

        Self::extract(figment)
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn default_config_validates() {
        let config = HeapConfig::default();
        config.validate().expect("default config should validate");
        assert_eq!(config.segment_size, DEFAULT_SEGMENT_SIZE);
        assert_eq!(config.heaps, None);
    }

    #[test]
    fn tiny_segments_are_rejected() {
        let config = HeapConfig::default().with_segment_size(16);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_heaps_are_rejected() {
        let config = HeapConfig::default().with_heaps(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn segment_size_is_word_aligned() {
        let config = HeapConfig::default().with_segment_size(1001);
        assert_eq!(config.aligned_segment_size() % std::mem::size_of::<usize>(), 0);
        assert!(config.aligned_segment_size() >= 1001);
    }

    #[test]
    fn load_without_file_uses_defaults() {
        Jail::expect_with(|_| {
            let config = HeapConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config, HeapConfig::default());
            Ok(())
        });
    }

    #[test]
    fn file_then_environment_override() {
        Jail::expect_with(|jail| {
            jail.create_file(DEFAULT_CONFIG_FILE, "segment_size: 4096\nheaps: 3\n")?;
            jail.set_env("SEGHEAP_HEAPS", "2");

            let config = HeapConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.segment_size, 4096);
            assert_eq!(config.heaps, Some(2));
            Ok(())
        });
    }

    #[test]
    fn invalid_file_values_fail_validation() {
        Jail::expect_with(|jail| {
            jail.create_file("small.yaml", "segment_size: 8\n")?;

            let err = HeapConfig::load_from_path("small.yaml").unwrap_err();
            assert!(matches!(err, ConfigError::Validation(_)));
            Ok(())
        });
    }

    #[test]
    fn missing_explicit_file_is_reported() {
        Jail::expect_with(|_| {
            let err = HeapConfig::load_from_path("nope.yaml").unwrap_err();
            assert!(matches!(err, ConfigError::FileNotFound(_)));
            Ok(())
        });
    }
}

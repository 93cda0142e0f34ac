//! Pipeline configuration.
//!
//! Loaded from TOML, then overridden by `ELEMENTA_CHUNK_SIZE` and
//! `ELEMENTA_MAX_CONCURRENT_IMPORTS` when those are set.

use std::path::Path;

use elementa_throttle_models::ThrottleConfig;
use serde::{Deserialize, Serialize};

use crate::IngestError;

/// Environment variable overriding [`IngestConfig::chunk_size`].
pub const CHUNK_SIZE_ENV: &str = "ELEMENTA_CHUNK_SIZE";

/// Environment variable overriding [`IngestConfig::max_concurrent_imports`].
pub const MAX_CONCURRENT_IMPORTS_ENV: &str = "ELEMENTA_MAX_CONCURRENT_IMPORTS";

/// Configuration for imports and cleanups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Records per chunk before clamping to the destination's batch size.
    pub chunk_size: usize,
    /// Upper bound on in-flight destination calls per import.
    pub max_concurrent_imports: usize,
    /// Page size used when listing products during cleanup.
    pub cleanup_page_size: u32,
    /// A cleanup fails once more than this many delete batches fail in a
    /// row.
    pub cleanup_max_consecutive_failures: u32,
    /// Delete products not seen by a completed import.
    pub reconcile_stale: bool,
    /// Adaptive throttle tuning.
    pub throttle: ThrottleConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            max_concurrent_imports: 4,
            cleanup_page_size: 100,
            cleanup_max_consecutive_failures: 3,
            reconcile_stale: false,
            throttle: ThrottleConfig::default(),
        }
    }
}

impl IngestConfig {
    /// Parses a TOML document. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// * If the TOML is malformed
    /// * If a value is out of range
    pub fn from_toml_str(content: &str) -> Result<Self, IngestError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file and applies environment overrides.
    ///
    /// # Errors
    ///
    /// * If the file cannot be read or parsed
    /// * If a value is out of range
    pub fn load(path: &Path) -> Result<Self, IngestError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        config.with_env()
    }

    /// Applies overrides from the process environment.
    ///
    /// # Errors
    ///
    /// * If an override is not a positive integer
    pub fn with_env(self) -> Result<Self, IngestError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides looked up through `lookup`.
    ///
    /// # Errors
    ///
    /// * If an override is not a positive integer
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, IngestError> {
        if let Some(value) = lookup(CHUNK_SIZE_ENV) {
            self.chunk_size = parse_positive(CHUNK_SIZE_ENV, &value)?;
        }
        if let Some(value) = lookup(MAX_CONCURRENT_IMPORTS_ENV) {
            self.max_concurrent_imports = parse_positive(MAX_CONCURRENT_IMPORTS_ENV, &value)?;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::Config("chunk_size must be positive".to_string()));
        }
        if self.max_concurrent_imports == 0 {
            return Err(IngestError::Config(
                "max_concurrent_imports must be positive".to_string(),
            ));
        }
        if self.cleanup_page_size == 0 {
            return Err(IngestError::Config(
                "cleanup_page_size must be positive".to_string(),
            ));
        }
        if self.throttle.min_batch_size == 0 {
            return Err(IngestError::Config(
                "throttle.min_batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_positive(name: &str, value: &str) -> Result<usize, IngestError> {
    value
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| IngestError::Config(format!("{name} must be a positive integer, got {value:?}")))
}

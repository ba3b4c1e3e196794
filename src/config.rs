//! Gzip Configuration
//!
//! Process-wide and read-only once loaded. Sources, lowest precedence first:
//!
//! 1. built-in defaults
//! 2. TOML file (`GzipConfig::load`)
//! 3. environment:
//!    - `CACHE_GZIP_LEVEL`: compression level, 0-9
//!    - `CACHE_GZIP_MEMLEVEL`: memory level, 1-9
//!    - `CACHE_GZIP_CHUNK_SIZE`: backend read size in bytes
//!    - `CACHE_GZIP_BUFFER`: scratch buffer capacity in bytes
//!    - `CACHE_GZIP_TRAILING_GARBAGE`: `ignore` or `reject`

use crate::codec::{QualityParams, MAX_WINDOW_BITS};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;
const MIN_BUFFER_SIZE: usize = 64;
const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;
const MAX_SEGMENT_SIZE: usize = 64 * 1024 * 1024;

/// What to do with bytes following a complete gzip member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailingGarbage {
    /// Drop them with a warning; the object stays valid
    #[default]
    Ignore,
    /// Fail the transfer
    Reject,
}

impl std::str::FromStr for TrailingGarbage {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ignore" => Ok(TrailingGarbage::Ignore),
            "reject" => Ok(TrailingGarbage::Reject),
            other => Err(ConfigError::Invalid(format!(
                "trailing_garbage must be ignore or reject, got {other:?}"
            ))),
        }
    }
}

/// Gzip filter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GzipConfig {
    /// Compression level (default: 6)
    pub level: u32,
    /// Compression memory level (default: 8)
    pub memory_level: u32,
    /// Largest single backend read (default: 16KB)
    pub chunk_size: usize,
    /// Scratch buffer capacity (default: 32KB)
    pub buffer_size: usize,
    /// Storage segment size for in-memory objects (default: 64KB)
    pub segment_size: usize,
    /// Policy for bytes after the gzip trailer on the gunzip paths
    pub trailing_garbage: TrailingGarbage,
}

impl Default for GzipConfig {
    fn default() -> Self {
        GzipConfig {
            level: 6,
            memory_level: 8,
            chunk_size: 16 * 1024,   // 16KB
            buffer_size: 32 * 1024,  // 32KB
            segment_size: 64 * 1024, // 64KB
            trailing_garbage: TrailingGarbage::Ignore,
        }
    }
}

impl GzipConfig {
    /// Small buffers so tests cross every boundary
    pub fn test() -> Self {
        GzipConfig {
            chunk_size: 7,
            buffer_size: MIN_BUFFER_SIZE,
            segment_size: 13,
            ..Default::default()
        }
    }

    /// Parse TOML text; missing keys take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: GzipConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config: GzipConfig = toml::from_str(&text)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = GzipConfig::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `CACHE_GZIP_*` overrides from `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{key}: not a number: {value:?}")))
        }

        if let Some(v) = lookup("CACHE_GZIP_LEVEL") {
            self.level = number("CACHE_GZIP_LEVEL", &v)?;
        }
        if let Some(v) = lookup("CACHE_GZIP_MEMLEVEL") {
            self.memory_level = number("CACHE_GZIP_MEMLEVEL", &v)?;
        }
        if let Some(v) = lookup("CACHE_GZIP_CHUNK_SIZE") {
            self.chunk_size = number("CACHE_GZIP_CHUNK_SIZE", &v)?;
        }
        if let Some(v) = lookup("CACHE_GZIP_BUFFER") {
            self.buffer_size = number("CACHE_GZIP_BUFFER", &v)?;
        }
        if let Some(v) = lookup("CACHE_GZIP_TRAILING_GARBAGE") {
            self.trailing_garbage = v.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn check(ok: bool, msg: impl FnOnce() -> String) -> Result<(), ConfigError> {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::Invalid(msg()))
            }
        }

        check(self.level <= 9, || format!("level {} not in 0..=9", self.level))?;
        check((1..=9).contains(&self.memory_level), || {
            format!("memory_level {} not in 1..=9", self.memory_level)
        })?;
        check((1..=MAX_CHUNK_SIZE).contains(&self.chunk_size), || {
            format!("chunk_size {} not in 1..={}", self.chunk_size, MAX_CHUNK_SIZE)
        })?;
        check(
            (MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size),
            || {
                format!(
                    "buffer_size {} not in {}..={}",
                    self.buffer_size, MIN_BUFFER_SIZE, MAX_BUFFER_SIZE
                )
            },
        )?;
        check((1..=MAX_SEGMENT_SIZE).contains(&self.segment_size), || {
            format!("segment_size {} not in 1..={}", self.segment_size, MAX_SEGMENT_SIZE)
        })
    }

    /// Engine parameters read at context creation
    pub fn quality(&self) -> QualityParams {
        QualityParams {
            level: self.level,
            memory_level: self.memory_level,
            window_bits: MAX_WINDOW_BITS,
        }
    }
}

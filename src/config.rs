//! Runtime configuration for prompt-prefix-cache.
//!
//! Configuration can be loaded from a JSON file or constructed
//! programmatically. Cache admission knobs (byte bound, TTL) live here;
//! per-request generation parameters that feed the cache key and
//! quantization promoter live on [`GenerationParams`], validated at the
//! HTTP boundary before the core ever sees them.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "prompt-prefix-cache", about = "OpenAI-compatible inference server with prompt-prefix KV-cache reuse")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            model: ModelConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen: String,
    pub max_concurrent_requests: usize,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            max_concurrent_requests: 4,
            request_timeout_secs: 300,
        }
    }
}

/// Model-related settings needed for KV tensor shape and byte estimation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_path: PathBuf,
    pub n_gpu_layers: i32,
    pub context_size: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub n_layers: usize,
    /// Block-growth step (in tokens) for dense layer capacity.
    pub dense_growth_step: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model.gguf"),
            n_gpu_layers: -1,
            context_size: 32768,
            n_heads: 40,
            n_kv_heads: 8,
            head_dim: 128,
            n_layers: 40,
            dense_growth_step: 256,
        }
    }
}

/// Process-start cache admission configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Master switch. If false, the manager is null: every lookup returns
    /// `(tokens, none)` unconditionally and write-back is a no-op.
    pub enable_cache: bool,
    pub max_bytes_mb: usize,
    pub ttl_minutes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_cache: false,
            max_bytes_mb: 1024,
            ttl_minutes: 30,
        }
    }
}

impl CacheConfig {
    pub fn max_bytes(&self) -> usize {
        self.max_bytes_mb * 1024 * 1024
    }

    pub fn ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ttl_minutes * 60)
    }
}

/// Per-request generation parameters consumed by the cache core.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    pub kv_bits: Option<u8>,
    pub kv_group_size: u32,
    pub kv_quantization_start: usize,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            kv_bits: None,
            kv_group_size: 64,
            kv_quantization_start: 5000,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationParamsError {
    #[error("kv_bits must be 4 or 8, got {0}")]
    InvalidKvBits(u8),
    #[error("kv_group_size must be a positive multiple of 8, got {0}")]
    InvalidGroupSize(u32),
}

impl GenerationParams {
    /// Validation applied by the server before calling into the cache core.
    /// Only this boundary may surface a user-facing (400-class) error.
    pub fn validate(&self) -> Result<(), GenerationParamsError> {
        if let Some(bits) = self.kv_bits {
            if bits != 4 && bits != 8 {
                return Err(GenerationParamsError::InvalidKvBits(bits));
            }
        }
        if self.kv_group_size == 0 || self.kv_group_size % 8 != 0 {
            return Err(GenerationParamsError::InvalidGroupSize(self.kv_group_size));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for a
    /// missing file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.cache.max_bytes_mb, 1024);
        assert!(!cfg.cache.enable_cache);
    }

    #[test]
    fn cache_byte_and_ttl_conversions() {
        let cfg = CacheConfig {
            enable_cache: true,
            max_bytes_mb: 2,
            ttl_minutes: 1,
        };
        assert_eq!(cfg.max_bytes(), 2 * 1024 * 1024);
        assert_eq!(cfg.ttl(), std::time::Duration::from_secs(60));
    }

    #[test]
    fn validate_rejects_bad_kv_bits() {
        let mut params = GenerationParams::default();
        params.kv_bits = Some(6);
        assert_eq!(
            params.validate(),
            Err(GenerationParamsError::InvalidKvBits(6))
        );
    }

    #[test]
    fn validate_rejects_bad_group_size() {
        let mut params = GenerationParams::default();
        params.kv_group_size = 10;
        assert_eq!(
            params.validate(),
            Err(GenerationParamsError::InvalidGroupSize(10))
        );
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(GenerationParams::default().validate().is_ok());
    }

    #[test]
    fn validate_accepts_quantized_config() {
        let params = GenerationParams {
            kv_bits: Some(4),
            kv_group_size: 64,
            ..GenerationParams::default()
        };
        assert!(params.validate().is_ok());
    }
}

//! Pipeline configuration.

use serde::{Deserialize, Serialize};

use crate::codec::compressor::CompressionAlgorithm;
use crate::error::{PipelineError, Result};
use crate::scheduler::FlushMode;

/// When and how outbound batches are compressed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionOptions {
    /// Batches at least this large (in bytes of contents) are compressed.
    pub minimum_batch_size_in_bytes: usize,
    /// `None` disables compression.
    pub algorithm: Option<CompressionAlgorithm>,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            minimum_batch_size_in_bytes: 614_400,
            algorithm: Some(CompressionAlgorithm::Deflate),
        }
    }
}

/// Tunables for the outbound pipeline and its recovery behaviour.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub compression: CompressionOptions,
    /// Largest payload a single send may carry.
    pub max_batch_size_in_bytes: usize,
    pub chunk_size_in_bytes: usize,
    /// Split oversized payloads instead of failing the flush.
    pub enable_chunking: bool,
    pub enable_grouped_batching: bool,
    /// Offline-capable mode: batch ids are resolved and fork detection runs.
    pub enable_offline_load: bool,
    pub flush_mode: FlushMode,
    /// Reconnects without any acknowledged progress before giving up.
    pub max_consecutive_reconnects: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            compression: CompressionOptions::default(),
            max_batch_size_in_bytes: 972_800,
            chunk_size_in_bytes: 204_800,
            enable_chunking: true,
            enable_grouped_batching: true,
            enable_offline_load: false,
            flush_mode: FlushMode::TurnBased,
            max_consecutive_reconnects: 7,
        }
    }
}

impl PipelineConfig {
    /// Parse from a JSON params object; missing fields take their defaults.
    pub fn from_json(params: serde_json::Value) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_value(params)
            .map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.enable_chunking {
            if self.compression.algorithm.is_none() {
                return Err(PipelineError::InvalidConfig(
                    "chunking requires compression".to_string(),
                ));
            }
            if self.chunk_size_in_bytes == 0
                || self.chunk_size_in_bytes >= self.max_batch_size_in_bytes
            {
                return Err(PipelineError::InvalidConfig(format!(
                    "chunk size {} must be positive and below the max batch size {}",
                    self.chunk_size_in_bytes, self.max_batch_size_in_bytes
                )));
            }
        }
        Ok(())
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression.algorithm.is_some()
    }
}

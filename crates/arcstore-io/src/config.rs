//! Writer, pool, and record-builder configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compression::CompressionKind;
use crate::error::{ArchiveError, ArchiveResult};
use crate::record::ArchiveFormat;

/// Settings shared by every writer of a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterSettings {
    /// File name prefix.
    pub prefix: String,
    /// Optional name suffix; `${HOSTNAME}` is expanded.
    pub suffix: Option<String>,
    /// Serialization profile.
    pub format: ArchiveFormat,
    /// Per-record frame compression.
    pub compression: CompressionKind,
    /// Rotation threshold in bytes, measured on disk.
    pub max_file_size: u64,
    /// Candidate output directories, used round-robin.
    pub directories: Vec<PathBuf>,
    /// Operator lines written in the descriptor record of every file.
    pub metadata: Vec<String>,
    /// Reject records whose source length differs from the declared length.
    pub enforce_length: bool,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            prefix: "ARCSTORE".to_string(),
            suffix: Some("${HOSTNAME}".to_string()),
            format: ArchiveFormat::Warc,
            compression: CompressionKind::Gzip,
            max_file_size: 1024 * 1024 * 1024, // 1GB
            directories: vec![PathBuf::from("archives")],
            metadata: Vec::new(),
            enforce_length: true,
        }
    }
}

/// Writer pool limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum writers (and so open files) at once.
    pub max_active: usize,
    /// How long a borrow waits for a writer, in milliseconds.
    pub max_wait_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: 1,
            max_wait_ms: 5000, // 5s
        }
    }
}

impl PoolConfig {
    /// Borrow timeout.
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Which records the builder chain emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderSettings {
    /// Emit request records for HTTP fetches.
    pub write_requests: bool,
    /// Emit a metadata record per fetch.
    pub write_metadata: bool,
    /// List outlinks in metadata records.
    pub write_metadata_outlinks: bool,
    /// Replace content already stored under the same digest by a revisit.
    pub write_revisit_for_identical_digests: bool,
    /// Write a revisit for HTTP 304 responses.
    pub write_revisit_for_not_modified: bool,
    /// Payload bytes kept in a revisit beyond the protocol headers.
    pub revisit_payload_limit: u64,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self {
            write_requests: true,
            write_metadata: true,
            write_metadata_outlinks: true,
            write_revisit_for_identical_digests: true,
            write_revisit_for_not_modified: true,
            revisit_payload_limit: 0,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Container writer settings.
    pub writer: WriterSettings,
    /// Pool limits.
    pub pool: PoolConfig,
    /// Record builder switches.
    pub builders: BuilderSettings,
}

impl ArchiveConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> ArchiveResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ArchiveConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ArchiveError::Config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| ArchiveError::Config(e.to_string()))?
            }
            _ => {
                return Err(ArchiveError::Config(format!(
                    "Unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> ArchiveResult<()> {
        if self.pool.max_active == 0 {
            return Err(ArchiveError::Config("pool.max_active must be at least 1".to_string()));
        }
        if self.writer.max_file_size == 0 {
            return Err(ArchiveError::Config("writer.max_file_size must be positive".to_string()));
        }
        if self.writer.directories.is_empty() {
            return Err(ArchiveError::Config("writer.directories must not be empty".to_string()));
        }
        if self.writer.prefix.chars().any(|c| c == '/' || c.is_whitespace()) {
            return Err(ArchiveError::Config(format!(
                "writer.prefix {:?} contains a path separator or white space",
                self.writer.prefix
            )));
        }
        Ok(())
    }
}

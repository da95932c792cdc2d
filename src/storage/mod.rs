//! Persistent storage
//!
//! Bridge settings live in the platform data directory.

use std::path::PathBuf;
use thiserror::Error;

pub mod settings;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Get the application data directory
///
/// Returns the platform-specific application data directory:
/// - Linux: `/home/{user}/.local/share/rkllm-bridge`
/// - macOS: `/Users/{user}/Library/Application Support/com.rkllm.rkllm-bridge`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "rkllm", "rkllm-bridge")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}

/// Initialize the storage directory structure
///
/// Creates the following directories:
/// - `{data_dir}/models/` - Default location for `.rkllm` files
/// - `{data_dir}/prompt-cache/` - Saved prompt caches
pub fn init_storage() -> Result<PathBuf, StorageError> {
    let data_dir = get_data_dir()?;

    std::fs::create_dir_all(data_dir.join("models"))?;
    std::fs::create_dir_all(data_dir.join("prompt-cache"))?;

    tracing::info!("Initialized storage at: {}", data_dir.display());

    Ok(data_dir)
}

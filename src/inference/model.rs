//! Model file checks
//!
//! The runtime reports a bad model path only through an opaque init status, so
//! obvious mistakes are caught here before any native call.

use std::fs;
use std::path::Path;
use thiserror::Error;

/// Extension of converted RKLLM model files
pub const MODEL_EXTENSION: &str = "rkllm";

/// Anything smaller cannot hold a converted model header
pub const MIN_MODEL_BYTES: u64 = 64;

/// Errors that can occur while validating model files
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Not a regular file: {0}")]
    NotAFile(String),

    #[error("Expected a .{ext} model file, got {0}", ext = MODEL_EXTENSION)]
    WrongExtension(String),

    #[error("File too small to be a valid model ({0} bytes)")]
    FileTooSmall(u64),
}

/// Basic facts about a model file
#[derive(Debug, Clone)]
pub struct ModelFileInfo {
    /// File name without directories
    pub filename: String,
    /// File size in bytes
    pub size_bytes: u64,
}

/// Validates that a path points at a plausible RKLLM model file.
///
/// # Arguments
/// * `path` - Path to the `.rkllm` file
///
/// # Returns
/// * `Ok(ModelFileInfo)` - Name and size of the model
/// * `Err(ModelError)` - If the file is missing, mis-named or truncated
pub fn validate_model_file<P: AsRef<Path>>(path: P) -> Result<ModelFileInfo, ModelError> {
    let path = path.as_ref();
    let metadata = fs::metadata(path)?;

    if !metadata.is_file() {
        return Err(ModelError::NotAFile(path.display().to_string()));
    }

    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if extension != MODEL_EXTENSION {
        return Err(ModelError::WrongExtension(path.display().to_string()));
    }

    if metadata.len() < MIN_MODEL_BYTES {
        return Err(ModelError::FileTooSmall(metadata.len()));
    }

    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();

    Ok(ModelFileInfo {
        filename,
        size_bytes: metadata.len(),
    })
}

/// Checks that an optional auxiliary file (LoRA adapter, prompt cache) exists
pub fn validate_aux_file<P: AsRef<Path>>(path: P) -> Result<(), ModelError> {
    let path = path.as_ref();
    if !fs::metadata(path)?.is_file() {
        return Err(ModelError::NotAFile(path.display().to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_model_file(suffix: &str, len: usize) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(&vec![0xAB; len]).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_validate_model_valid() {
        let file = create_model_file(".rkllm", 4096);
        let info = validate_model_file(file.path()).unwrap();
        assert_eq!(info.size_bytes, 4096);
        assert!(info.filename.ends_with(".rkllm"));
    }

    #[test]
    fn test_validate_model_wrong_extension() {
        let file = create_model_file(".gguf", 4096);
        let result = validate_model_file(file.path());
        assert!(matches!(result, Err(ModelError::WrongExtension(_))));
    }

    #[test]
    fn test_validate_model_too_small() {
        let file = create_model_file(".rkllm", 8);
        let result = validate_model_file(file.path());
        assert!(matches!(result, Err(ModelError::FileTooSmall(8))));
    }

    #[test]
    fn test_validate_model_missing() {
        let result = validate_model_file("/nonexistent/model.rkllm");
        assert!(matches!(result, Err(ModelError::FileOpen(_))));
    }

    #[test]
    fn test_validate_aux_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            validate_aux_file(dir.path()),
            Err(ModelError::NotAFile(_))
        ));
    }
}

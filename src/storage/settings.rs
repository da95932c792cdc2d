//! Settings storage
//!
//! Manages persistence of the bridge configuration: where the runtime and the
//! model live, the engine parameters, and per-run defaults.

use crate::inference::config::{EngineConfig, GenerationConfig};
use crate::inference::session::{GenerationOptions, DEFAULT_CANCEL_GRACE};
use crate::storage::{get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bridge settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Path (or bare name) of `librkllmrt.so`
    pub library_path: PathBuf,
    /// The `.rkllm` model to load
    pub model_path: PathBuf,
    /// Optional LoRA adapter file, loaded at init
    pub lora_path: Option<PathBuf>,
    /// Name the LoRA adapter is registered under
    pub lora_name: String,
    /// Optional prompt cache file, loaded at init
    pub prompt_cache_path: Option<PathBuf>,
    /// System prompt prepended to conversations
    pub system_prompt: String,
    /// Native engine parameters
    pub engine: EngineConfig,
    /// Take sampling parameters from a `generation_config.json` next to the model
    pub sampling_from_model: bool,
    /// Default stop sequences
    pub stop_sequences: Vec<String>,
    /// Default run timeout in seconds (0 = none)
    pub timeout_secs: u64,
    /// How long an abort may take, in milliseconds
    pub cancel_grace_ms: u64,
    pub enable_thinking: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            library_path: PathBuf::from(crate::inference::library::DEFAULT_LIBRARY),
            model_path: get_data_dir()
                .ok()
                .map(|d| d.join("models").join("model.rkllm"))
                .unwrap_or_else(|| PathBuf::from("./models/model.rkllm")),
            lora_path: None,
            lora_name: "default".to_string(),
            prompt_cache_path: None,
            system_prompt: "You are a helpful AI assistant.".to_string(),
            engine: EngineConfig::default(),
            sampling_from_model: true,
            stop_sequences: Vec::new(),
            timeout_secs: 0,
            cancel_grace_ms: DEFAULT_CANCEL_GRACE.as_millis() as u64,
            enable_thinking: false,
        }
    }
}

impl BridgeSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges
    pub fn validate(&mut self) {
        self.engine.validate();
        self.stop_sequences.retain(|s| !s.is_empty());

        if self.cancel_grace_ms == 0 {
            self.cancel_grace_ms = DEFAULT_CANCEL_GRACE.as_millis() as u64;
        }

        if self.lora_name.trim().is_empty() {
            self.lora_name = "default".to_string();
        }
    }

    /// Engine parameters for the configured model
    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = self.engine.clone();
        if !self.sampling_from_model {
            return engine;
        }
        let model_dir = self.model_path.parent().unwrap_or_else(|| Path::new("."));
        if let Some(gen) = GenerationConfig::for_model_dir(model_dir) {
            tracing::info!("Using sampling parameters from {}", model_dir.display());
            engine.apply_generation_config(&gen);
        }
        engine
    }

    /// Per-run defaults derived from these settings
    pub fn generation_options(&self) -> GenerationOptions {
        let mut options = GenerationOptions::default()
            .with_stop_sequences(self.stop_sequences.clone())
            .with_thinking(self.enable_thinking)
            .with_cancel_grace(Duration::from_millis(self.cancel_grace_ms));
        if self.timeout_secs > 0 {
            options = options.with_timeout(Duration::from_secs(self.timeout_secs));
        }
        if self.lora_path.is_some() {
            options = options.with_lora_adapter(self.lora_name.clone());
        }
        options
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> BridgeSettings {
    let result = get_settings_path().and_then(|path| load_settings_from(&path));
    match result {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            BridgeSettings::default()
        }
    }
}

/// Loads settings from a specific file, defaulting when it does not exist
pub fn load_settings_from(path: &Path) -> Result<BridgeSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(BridgeSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: BridgeSettings = serde_json::from_str(&json)?;

    // Validate loaded settings
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &BridgeSettings) -> Result<(), StorageError> {
    save_settings_to(settings, &get_settings_path()?)
}

pub fn save_settings_to(settings: &BridgeSettings, path: &Path) -> Result<(), StorageError> {
    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::config::MAX_SUPPORTED_CONTEXT_LENGTH;

    #[test]
    fn test_default_settings() {
        let settings = BridgeSettings::default();
        assert_eq!(settings.library_path, PathBuf::from("librkllmrt.so"));
        assert_eq!(settings.engine, EngineConfig::default());
        assert_eq!(settings.cancel_grace_ms, 5000);
        assert!(settings.lora_path.is_none());
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = BridgeSettings::default();
        settings.engine.max_context_len = 1 << 20;
        settings.stop_sequences = vec!["".to_string(), "<|im_end|>".to_string()];
        settings.cancel_grace_ms = 0;
        settings.validate();

        assert_eq!(settings.engine.max_context_len, MAX_SUPPORTED_CONTEXT_LENGTH);
        assert_eq!(settings.stop_sequences, vec!["<|im_end|>".to_string()]);
        assert_eq!(settings.cancel_grace_ms, 5000);
    }

    #[test]
    fn test_generation_options() {
        let settings = BridgeSettings {
            timeout_secs: 30,
            stop_sequences: vec!["</tool_call>".to_string()],
            lora_path: Some(PathBuf::from("adapter.rkllm")),
            ..Default::default()
        };
        let options = settings.generation_options();
        assert_eq!(options.timeout, Some(Duration::from_secs(30)));
        assert_eq!(options.stop_sequences, vec!["</tool_call>".to_string()]);
        assert_eq!(options.lora_adapter.as_deref(), Some("default"));

        let options = BridgeSettings::default().generation_options();
        assert!(options.timeout.is_none());
        assert!(options.lora_adapter.is_none());
    }

    #[test]
    fn test_engine_config_from_model_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("generation_config.json"),
            r#"{"temperature": 0.6, "top_k": 20, "top_p": 0.95}"#,
        )
        .unwrap();

        let mut settings = BridgeSettings {
            model_path: dir.path().join("qwen3-1.7b.rkllm"),
            ..Default::default()
        };
        settings.engine.cpu_mask = 0b1111;
        let engine = settings.engine_config();
        assert_eq!(engine.temperature, 0.6);
        assert_eq!(engine.top_k, 20);
        assert_eq!(engine.cpu_mask, 0b1111);

        settings.sampling_from_model = false;
        assert_eq!(settings.engine_config(), settings.engine);
    }

    #[test]
    fn test_settings_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = BridgeSettings::default();
        settings.model_path = PathBuf::from("/opt/models/qwen3-1.7b.rkllm");
        settings.engine.temperature = 0.3;
        save_settings_to(&settings, &path).unwrap();

        let loaded = load_settings_from(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("none.json");
        assert_eq!(load_settings_from(&missing).unwrap(), BridgeSettings::default());

        let corrupt = dir.path().join("bad.json");
        fs::write(&corrupt, "{ not json").unwrap();
        assert!(matches!(
            load_settings_from(&corrupt),
            Err(StorageError::JsonError(_))
        ));
    }
}

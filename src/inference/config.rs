//! Engine configuration
//!
//! Sampling and context parameters are fixed when the native context is
//! created. Changing any of them means destroying the handle and creating a
//! new one, so [`EngineConfig`] has no mutators on a live engine.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest context the runtime accepts
pub const MAX_SUPPORTED_CONTEXT_LENGTH: i32 = 16384;

/// Default CPU affinity: the big cores (4-7) of an RK3588
pub const DEFAULT_CPU_MASK: u32 = (1 << 4) | (1 << 5) | (1 << 6) | (1 << 7);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Template the runtime wraps around prompt input.
///
/// Empty strings disable native wrapping; the bridge renders ChatML itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeChatTemplate {
    pub system_prompt: String,
    pub prompt_prefix: String,
    pub prompt_postfix: String,
}

/// Immutable parameters of one native context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Context window in tokens
    pub max_context_len: i32,
    /// Maximum generated tokens per run (-1 = until the context is full)
    pub max_new_tokens: i32,
    /// Tokens kept when the context shifts (-1 = runtime default)
    pub n_keep: i32,
    pub top_k: i32,
    pub top_p: f32,
    pub temperature: f32,
    pub repeat_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    /// Mirostat mode: 0 = off, 1 = v1, 2 = v2
    pub mirostat: i32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub skip_special_token: bool,
    /// Run callbacks from a runtime-owned thread; `rkllm_run` returns early
    pub is_async: bool,
    pub img_start: String,
    pub img_end: String,
    pub img_content: String,
    pub base_domain_id: i32,
    pub embed_flash: bool,
    /// Bit `n` set = run on CPU core `n`
    pub cpu_mask: u32,
    pub chat_template: NativeChatTemplate,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_context_len: 4096,
            max_new_tokens: -1,
            n_keep: -1,
            top_k: 1,
            top_p: 0.9,
            temperature: 0.8,
            repeat_penalty: 1.1,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            skip_special_token: true,
            is_async: false,
            img_start: String::new(),
            img_end: String::new(),
            img_content: String::new(),
            base_domain_id: 0,
            embed_flash: false,
            cpu_mask: DEFAULT_CPU_MASK,
            chat_template: NativeChatTemplate::default(),
        }
    }
}

impl EngineConfig {
    /// Takes the sampling and length limits from a model's
    /// `generation_config.json`; everything else is left alone
    pub fn apply_generation_config(&mut self, gen: &GenerationConfig) {
        self.max_context_len = gen.max_length;
        self.max_new_tokens = gen.max_new_tokens;
        self.top_k = gen.top_k;
        self.top_p = gen.top_p;
        self.temperature = gen.temperature;
        self.repeat_penalty = gen.repetition_penalty;
        self.frequency_penalty = gen.frequency_penalty;
        self.validate();
    }

    /// Number of CPU cores selected by the affinity mask
    pub fn enabled_cpus(&self) -> u32 {
        self.cpu_mask.count_ones()
    }

    /// Clamps every parameter into the range the runtime accepts
    pub fn validate(&mut self) {
        if self.max_context_len <= 0 {
            self.max_context_len = 4096;
        }
        self.max_context_len = self.max_context_len.min(MAX_SUPPORTED_CONTEXT_LENGTH);

        if self.max_new_tokens == 0 || self.max_new_tokens < -1 {
            self.max_new_tokens = -1;
        }

        if self.top_k < 1 {
            self.top_k = 1;
        }
        self.top_p = self.top_p.clamp(0.0, 1.0);
        self.temperature = self.temperature.clamp(0.0, 2.0);

        if self.repeat_penalty <= 0.0 {
            self.repeat_penalty = 1.0;
        }

        self.mirostat = self.mirostat.clamp(0, 2);

        if self.cpu_mask == 0 {
            self.cpu_mask = DEFAULT_CPU_MASK;
        }
    }
}

/// CPU affinity mask for the given core indices
pub fn cpu_mask_from_cores(cores: &[u32]) -> u32 {
    cores
        .iter()
        .filter(|&&core| core < 32)
        .fold(0u32, |mask, &core| mask | (1u32 << core))
}

/// Sampling defaults shipped with a model (`generation_config.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_length: i32,
    pub max_new_tokens: i32,
    pub top_k: i32,
    pub top_p: f32,
    pub temperature: f32,
    pub repetition_penalty: f32,
    pub frequency_penalty: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: 4096,
            max_new_tokens: -1,
            top_k: 1,
            top_p: 0.9,
            temperature: 0.7,
            repetition_penalty: 1.1,
            frequency_penalty: 0.0,
        }
    }
}

impl GenerationConfig {
    /// Reads a `generation_config.json`; unknown keys are ignored
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Looks for `generation_config.json` in the model's directory
    pub fn for_model_dir<P: AsRef<Path>>(dir: P) -> Option<Self> {
        let path = dir.as_ref().join("generation_config.json");
        if !path.exists() {
            return None;
        }
        match Self::load(&path) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!("Ignoring {}: {}", path.display(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_context_len, 4096);
        assert_eq!(config.max_new_tokens, -1);
        assert_eq!(config.top_k, 1);
        assert_eq!(config.enabled_cpus(), 4);
        assert!(!config.is_async);
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig {
            max_context_len: 100_000,
            max_new_tokens: 0,
            top_k: 0,
            top_p: 3.0,
            temperature: -1.0,
            mirostat: 7,
            cpu_mask: 0,
            ..Default::default()
        };
        config.validate();

        assert_eq!(config.max_context_len, MAX_SUPPORTED_CONTEXT_LENGTH);
        assert_eq!(config.max_new_tokens, -1);
        assert_eq!(config.top_k, 1);
        assert_eq!(config.top_p, 1.0);
        assert_eq!(config.temperature, 0.0);
        assert_eq!(config.mirostat, 2);
        assert_eq!(config.cpu_mask, DEFAULT_CPU_MASK);
    }

    #[test]
    fn test_cpu_mask_from_cores() {
        assert_eq!(cpu_mask_from_cores(&[4, 5, 6, 7]), DEFAULT_CPU_MASK);
        assert_eq!(cpu_mask_from_cores(&[0, 40]), 1);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"temperature": 0.2}"#).unwrap();
        assert_eq!(config.temperature, 0.2);
        assert_eq!(config.max_context_len, 4096);
    }

    #[test]
    fn test_generation_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("generation_config.json")).unwrap();
        write!(
            file,
            r#"{{"bos_token_id": 1, "temperature": 0.6, "top_p": 0.95, "top_k": 20, "max_length": 32768}}"#
        )
        .unwrap();

        let gen = GenerationConfig::for_model_dir(dir.path()).unwrap();
        assert_eq!(gen.top_k, 20);
        assert_eq!(gen.repetition_penalty, 1.1);

        let mut config = EngineConfig {
            cpu_mask: cpu_mask_from_cores(&[4, 5]),
            ..EngineConfig::default()
        };
        config.apply_generation_config(&gen);
        assert_eq!(config.temperature, 0.6);
        assert_eq!(config.top_p, 0.95);
        assert_eq!(config.max_context_len, MAX_SUPPORTED_CONTEXT_LENGTH);
        assert_eq!(config.cpu_mask, 0b11_0000);
    }

    #[test]
    fn test_missing_generation_config() {
        let dir = tempfile::tempdir().unwrap();
        assert!(GenerationConfig::for_model_dir(dir.path()).is_none());

        std::fs::write(dir.path().join("generation_config.json"), "{ broken").unwrap();
        assert!(GenerationConfig::for_model_dir(dir.path()).is_none());
    }
}

//! Run input payloads
//!
//! The runtime accepts exactly one of several input encodings per run.

use crate::types::ChatRole;

/// Geometry of the image embedding in a multimodal input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageMeta {
    /// Tokens produced per image by the vision encoder
    pub n_image_tokens: usize,
    /// Number of images in the embedding buffer
    pub n_image: usize,
    pub width: usize,
    pub height: usize,
}

/// The single input encoding handed to one native run
#[derive(Debug, Clone, PartialEq)]
pub enum InputPayload {
    /// Text the runtime tokenizes itself
    Prompt(String),
    /// Pre-tokenized ids
    Tokens(Vec<i32>),
    /// Precomputed embeddings, `n_tokens` rows of equal width
    Embedding { embed: Vec<f32>, n_tokens: usize },
    /// Text plus a vision-encoder embedding
    Multimodal {
        prompt: String,
        image_embed: Vec<f32>,
        image: ImageMeta,
    },
}

impl InputPayload {
    /// Short name of the active encoding, for logs
    pub fn mode(&self) -> &'static str {
        match self {
            InputPayload::Prompt(_) => "prompt",
            InputPayload::Tokens(_) => "tokens",
            InputPayload::Embedding { .. } => "embedding",
            InputPayload::Multimodal { .. } => "multimodal",
        }
    }

    /// Checks the invariants the native side relies on but cannot report
    pub fn validate(&self) -> Result<(), String> {
        match self {
            InputPayload::Prompt(text) => check_text(text),
            InputPayload::Tokens(ids) => {
                if ids.is_empty() {
                    return Err("token input is empty".to_string());
                }
                Ok(())
            }
            InputPayload::Embedding { embed, n_tokens } => {
                if *n_tokens == 0 || embed.is_empty() {
                    return Err("embedding input is empty".to_string());
                }
                if embed.len() % n_tokens != 0 {
                    return Err(format!(
                        "embedding of {} floats does not split into {} tokens",
                        embed.len(),
                        n_tokens
                    ));
                }
                Ok(())
            }
            InputPayload::Multimodal {
                prompt,
                image_embed,
                image,
            } => {
                check_text(prompt)?;
                let rows = image
                    .n_image_tokens
                    .checked_mul(image.n_image)
                    .ok_or_else(|| {
                        format!(
                            "{} image(s) x {} tokens overflows the embedding size",
                            image.n_image, image.n_image_tokens
                        )
                    })?;
                if rows == 0 || image_embed.is_empty() {
                    return Err("multimodal input has no image embedding".to_string());
                }
                if image_embed.len() % rows != 0 {
                    return Err(format!(
                        "image embedding of {} floats does not match {} image(s) x {} tokens",
                        image_embed.len(),
                        image.n_image,
                        image.n_image_tokens
                    ));
                }
                Ok(())
            }
        }
    }
}

fn check_text(text: &str) -> Result<(), String> {
    if text.contains('\0') {
        return Err("text input contains an interior NUL byte".to_string());
    }
    Ok(())
}

/// Everything the runtime reads from `RKLLMInput` for one run
#[derive(Debug, Clone, PartialEq)]
pub struct RunInput {
    pub payload: InputPayload,
    pub role: ChatRole,
    pub enable_thinking: bool,
}

impl RunInput {
    pub fn new(payload: InputPayload) -> Self {
        Self {
            payload,
            role: ChatRole::User,
            enable_thinking: false,
        }
    }

    pub fn with_role(mut self, role: ChatRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_thinking(mut self, enable_thinking: bool) -> Self {
        self.enable_thinking = enable_thinking;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_validation() {
        assert!(InputPayload::Prompt("hello".into()).validate().is_ok());
        assert!(InputPayload::Prompt("bad\0text".into()).validate().is_err());
    }

    #[test]
    fn test_embedding_validation() {
        let ok = InputPayload::Embedding {
            embed: vec![0.0; 8],
            n_tokens: 2,
        };
        assert!(ok.validate().is_ok());

        let ragged = InputPayload::Embedding {
            embed: vec![0.0; 7],
            n_tokens: 2,
        };
        assert!(ragged.validate().is_err());
        assert!(InputPayload::Tokens(vec![]).validate().is_err());
    }

    #[test]
    fn test_multimodal_validation() {
        let image = ImageMeta {
            n_image_tokens: 4,
            n_image: 1,
            width: 448,
            height: 448,
        };
        let ok = InputPayload::Multimodal {
            prompt: "<image>describe".into(),
            image_embed: vec![0.5; 16],
            image,
        };
        assert!(ok.validate().is_ok());
        assert_eq!(ok.mode(), "multimodal");

        let empty = InputPayload::Multimodal {
            prompt: "describe".into(),
            image_embed: vec![],
            image,
        };
        assert!(empty.validate().is_err());

        let huge = InputPayload::Multimodal {
            prompt: "describe".into(),
            image_embed: vec![0.5; 16],
            image: ImageMeta {
                n_image_tokens: usize::MAX,
                n_image: 2,
                ..image
            },
        };
        assert!(huge.validate().unwrap_err().contains("overflows"));
    }

    #[test]
    fn test_run_input_builder() {
        let input = RunInput::new(InputPayload::Tokens(vec![1, 2]))
            .with_role(ChatRole::System)
            .with_thinking(true);
        assert_eq!(input.role, ChatRole::System);
        assert!(input.enable_thinking);
    }
}

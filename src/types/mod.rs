//! Shared conversation types

pub mod message;

pub use message::{strip_thinking, ChatMessage, ChatResponse, ChatRole};

//! Raw RKLLM runtime ABI
//!
//! Layouts mirror `rkllm.h`. These are low-level types; use
//! [`RkllmLibrary`](crate::inference::library::RkllmLibrary) instead.

#![allow(non_camel_case_types)]

use std::ffi::{c_char, c_int, c_void};

/// Opaque runtime context
pub type LLMHandle = *mut c_void;

// LLMCallState
pub const RKLLM_RUN_NORMAL: c_int = 0;
pub const RKLLM_RUN_WAITING: c_int = 1;
pub const RKLLM_RUN_FINISH: c_int = 2;
pub const RKLLM_RUN_ERROR: c_int = 3;

// RKLLMInputType
pub const RKLLM_INPUT_PROMPT: c_int = 0;
pub const RKLLM_INPUT_TOKEN: c_int = 1;
pub const RKLLM_INPUT_EMBED: c_int = 2;
pub const RKLLM_INPUT_MULTIMODAL: c_int = 3;

// RKLLMInferMode
pub const RKLLM_INFER_GENERATE: c_int = 0;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RKLLMExtendParam {
    pub base_domain_id: i32,
    pub embed_flash: i8,
    pub enabled_cpus_num: i8,
    pub enabled_cpus_mask: u32,
    pub reserved: [u8; 106],
}

#[repr(C)]
pub struct RKLLMParam {
    pub model_path: *const c_char,
    pub max_context_len: i32,
    pub max_new_tokens: i32,
    pub top_k: i32,
    pub n_keep: i32,
    pub top_p: f32,
    pub temperature: f32,
    pub repeat_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub mirostat: i32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub skip_special_token: bool,
    pub is_async: bool,
    pub img_start: *const c_char,
    pub img_end: *const c_char,
    pub img_content: *const c_char,
    pub extend_param: RKLLMExtendParam,
}

#[repr(C)]
pub struct RKLLMLoraAdapter {
    pub lora_adapter_path: *const c_char,
    pub lora_adapter_name: *const c_char,
    pub scale: f32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RKLLMEmbedInput {
    pub embed: *const f32,
    pub n_tokens: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RKLLMTokenInput {
    pub input_ids: *const i32,
    pub n_tokens: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RKLLMMultiModelInput {
    pub prompt: *const c_char,
    pub image_embed: *const f32,
    pub n_image_tokens: usize,
    pub n_image: usize,
    pub image_width: usize,
    pub image_height: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union RKLLMInputUnion {
    pub prompt_input: *const c_char,
    pub embed_input: RKLLMEmbedInput,
    pub token_input: RKLLMTokenInput,
    pub multimodal_input: RKLLMMultiModelInput,
}

#[repr(C)]
pub struct RKLLMInput {
    pub role: *const c_char,
    pub enable_thinking: bool,
    pub input_type: c_int,
    pub input_data: RKLLMInputUnion,
}

#[repr(C)]
pub struct RKLLMLoraParam {
    pub lora_adapter_name: *const c_char,
}

#[repr(C)]
pub struct RKLLMPromptCacheParam {
    pub save_prompt_cache: c_int,
    pub prompt_cache_path: *const c_char,
}

#[repr(C)]
pub struct RKLLMInferParam {
    pub mode: c_int,
    pub lora_params: *mut RKLLMLoraParam,
    pub prompt_cache_params: *mut RKLLMPromptCacheParam,
    pub keep_history: c_int,
}

#[repr(C)]
pub struct RKLLMResultLastHiddenLayer {
    pub hidden_states: *const f32,
    pub embd_size: c_int,
    pub num_tokens: c_int,
}

#[repr(C)]
pub struct RKLLMResultLogits {
    pub logits: *const f32,
    pub vocab_size: c_int,
    pub num_tokens: c_int,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RKLLMPerfStat {
    pub prefill_time_ms: f32,
    pub prefill_tokens: c_int,
    pub generate_time_ms: f32,
    pub generate_tokens: c_int,
    pub memory_usage_mb: f32,
}

#[repr(C)]
pub struct RKLLMResult {
    pub text: *const c_char,
    pub token_id: i32,
    pub last_hidden_layer: RKLLMResultLastHiddenLayer,
    pub logits: RKLLMResultLogits,
    pub perf: RKLLMPerfStat,
}

/// Registered once per context at init; invoked on the thread inside `rkllm_run`
pub type LLMResultCallback =
    unsafe extern "C" fn(result: *mut RKLLMResult, userdata: *mut c_void, state: c_int) -> c_int;

pub type RkllmInitFn =
    unsafe extern "C" fn(handle: *mut LLMHandle, param: *mut RKLLMParam, callback: LLMResultCallback) -> c_int;
pub type RkllmRunFn = unsafe extern "C" fn(
    handle: LLMHandle,
    input: *mut RKLLMInput,
    infer_params: *mut RKLLMInferParam,
    userdata: *mut c_void,
) -> c_int;
pub type RkllmHandleFn = unsafe extern "C" fn(handle: LLMHandle) -> c_int;
pub type RkllmSetChatTemplateFn = unsafe extern "C" fn(
    handle: LLMHandle,
    system_prompt: *const c_char,
    prompt_prefix: *const c_char,
    prompt_postfix: *const c_char,
) -> c_int;
pub type RkllmLoadLoraFn =
    unsafe extern "C" fn(handle: LLMHandle, lora_adapter: *mut RKLLMLoraAdapter) -> c_int;
pub type RkllmLoadPromptCacheFn =
    unsafe extern "C" fn(handle: LLMHandle, prompt_cache_path: *const c_char) -> c_int;
pub type RkllmClearKvCacheFn =
    unsafe extern "C" fn(handle: LLMHandle, keep_system_prompt: c_int) -> c_int;

//! `librkllmrt` loaded at run time
//!
//! The runtime is resolved with `libloading`, so nothing links against the
//! vendor library at build time. A single trampoline is registered with every
//! context; runs are told apart by the run id carried in `userdata`.

use std::ffi::{c_int, c_void, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::ptr;

use libloading::Library;

use crate::inference::backend::{
    check_status, LoraAdapter, NativeBackend, NativeContext, NativeError, RunRequest,
};
use crate::inference::config::{EngineConfig, NativeChatTemplate};
use crate::inference::ffi::*;
use crate::inference::input::InputPayload;
use crate::inference::streaming::{dispatch, CallbackEvent, RunId};
use crate::inference::telemetry::PerfStats;

/// Default library name searched by the dynamic loader
pub const DEFAULT_LIBRARY: &str = "librkllmrt.so";

/// Function table of a loaded runtime
pub struct RkllmLibrary {
    path: PathBuf,
    init: RkllmInitFn,
    run: RkllmRunFn,
    abort: RkllmHandleFn,
    destroy: RkllmHandleFn,
    set_chat_template: RkllmSetChatTemplateFn,
    load_lora: Option<RkllmLoadLoraFn>,
    load_prompt_cache: Option<RkllmLoadPromptCacheFn>,
    release_prompt_cache: Option<RkllmHandleFn>,
    clear_kv_cache: Option<RkllmClearKvCacheFn>,
    // Keeps every function pointer above valid
    _library: Library,
}

impl RkllmLibrary {
    /// Loads the runtime and resolves its symbols.
    ///
    /// LoRA, prompt-cache and KV-cache symbols are optional; older runtimes
    /// lack some of them and the matching operations report `Unsupported`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, NativeError> {
        let path = path.as_ref();

        // SAFETY: loading runs the library's initialisers; librkllmrt has no
        // requirements beyond being loaded once per path.
        let library = unsafe { Library::new(path) }
            .map_err(|e| NativeError::Library(format!("{}: {}", path.display(), e)))?;

        // SAFETY: the signatures match rkllm.h and the pointers stay valid for
        // as long as `library`, which the returned value owns.
        let lib = unsafe {
            Self {
                path: path.to_path_buf(),
                init: required(&library, b"rkllm_init\0")?,
                run: required(&library, b"rkllm_run\0")?,
                abort: required(&library, b"rkllm_abort\0")?,
                destroy: required(&library, b"rkllm_destroy\0")?,
                set_chat_template: required(&library, b"rkllm_set_chat_template\0")?,
                load_lora: optional(&library, b"rkllm_load_lora\0"),
                load_prompt_cache: optional(&library, b"rkllm_load_prompt_cache\0"),
                release_prompt_cache: optional(&library, b"rkllm_release_prompt_cache\0"),
                clear_kv_cache: optional(&library, b"rkllm_clear_kv_cache\0"),
                _library: library,
            }
        };

        tracing::info!("Loaded RKLLM runtime from {}", path.display());
        Ok(lib)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

unsafe fn required<T: Copy>(library: &Library, name: &'static [u8]) -> Result<T, NativeError> {
    library
        .get::<T>(name)
        .map(|symbol| *symbol)
        .map_err(|e| NativeError::Library(format!("missing {}: {}", symbol_name(name), e)))
}

unsafe fn optional<T: Copy>(library: &Library, name: &'static [u8]) -> Option<T> {
    match library.get::<T>(name) {
        Ok(symbol) => Some(*symbol),
        Err(_) => {
            tracing::debug!("Runtime does not export {}", symbol_name(name));
            None
        }
    }
}

fn symbol_name(name: &[u8]) -> String {
    String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name)).into_owned()
}

fn cstring(value: &str, what: &str) -> Result<CString, NativeError> {
    CString::new(value)
        .map_err(|_| NativeError::InvalidArgument(format!("{} contains a NUL byte", what)))
}

fn path_cstring(path: &Path) -> Result<CString, NativeError> {
    let path = path
        .to_str()
        .ok_or_else(|| NativeError::InvalidArgument(format!("{} is not UTF-8", path.display())))?;
    cstring(path, "path")
}

fn perf_stats(perf: &RKLLMPerfStat) -> PerfStats {
    PerfStats {
        prefill_time_ms: perf.prefill_time_ms,
        prefill_tokens: perf.prefill_tokens.max(0) as u32,
        generate_time_ms: perf.generate_time_ms,
        generate_tokens: perf.generate_tokens.max(0) as u32,
        memory_usage_mb: perf.memory_usage_mb,
    }
}

/// Converts one native callback into an event.
///
/// # Safety
/// `result` must be null or point at a live `RKLLMResult` whose `text` is
/// null or NUL-terminated.
unsafe fn decode_event(result: *const RKLLMResult, state: c_int) -> Option<CallbackEvent> {
    match state {
        RKLLM_RUN_NORMAL => {
            let result = result.as_ref()?;
            if result.text.is_null() {
                return None;
            }
            let bytes = CStr::from_ptr(result.text).to_bytes().to_vec();
            Some(CallbackEvent::TokenChunk(bytes))
        }
        RKLLM_RUN_WAITING => Some(CallbackEvent::Waiting),
        RKLLM_RUN_FINISH => {
            let perf = result.as_ref().map(|r| r.perf).unwrap_or_default();
            Some(CallbackEvent::Finished(perf_stats(&perf)))
        }
        RKLLM_RUN_ERROR => Some(CallbackEvent::Error(RKLLM_RUN_ERROR)),
        other => {
            tracing::warn!("Ignoring unknown callback state {}", other);
            None
        }
    }
}

/// The one callback every context is initialised with
unsafe extern "C" fn result_callback(
    result: *mut RKLLMResult,
    userdata: *mut c_void,
    state: c_int,
) -> c_int {
    let run = userdata as usize as RunId;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: the runtime keeps `result` alive until the callback returns
        if let Some(event) = unsafe { decode_event(result, state) } {
            dispatch(run, event);
        }
    }));
    if outcome.is_err() {
        tracing::error!("Panic while handling native callback for run {}", run);
    }
    0
}

impl NativeBackend for RkllmLibrary {
    fn init(&self, config: &EngineConfig, model_path: &Path) -> Result<NativeContext, NativeError> {
        let model = path_cstring(model_path)?;
        let img_start = cstring(&config.img_start, "img_start")?;
        let img_end = cstring(&config.img_end, "img_end")?;
        let img_content = cstring(&config.img_content, "img_content")?;

        let mut param = RKLLMParam {
            model_path: model.as_ptr(),
            max_context_len: config.max_context_len,
            max_new_tokens: config.max_new_tokens,
            top_k: config.top_k,
            n_keep: config.n_keep,
            top_p: config.top_p,
            temperature: config.temperature,
            repeat_penalty: config.repeat_penalty,
            frequency_penalty: config.frequency_penalty,
            presence_penalty: config.presence_penalty,
            mirostat: config.mirostat,
            mirostat_tau: config.mirostat_tau,
            mirostat_eta: config.mirostat_eta,
            skip_special_token: config.skip_special_token,
            is_async: config.is_async,
            img_start: img_start.as_ptr(),
            img_end: img_end.as_ptr(),
            img_content: img_content.as_ptr(),
            extend_param: RKLLMExtendParam {
                base_domain_id: config.base_domain_id,
                embed_flash: i8::from(config.embed_flash),
                enabled_cpus_num: config.enabled_cpus() as i8,
                enabled_cpus_mask: config.cpu_mask,
                reserved: [0; 106],
            },
        };

        let mut handle: LLMHandle = ptr::null_mut();
        // SAFETY: `param` and the strings it points at outlive the call
        let status = unsafe { (self.init)(&mut handle, &mut param, result_callback) };
        check_status("rkllm_init", status)?;
        if handle.is_null() {
            return Err(NativeError::Status {
                op: "rkllm_init",
                code: -1,
            });
        }
        Ok(NativeContext::from_ptr(handle))
    }

    fn run(&self, ctx: NativeContext, request: &RunRequest<'_>) -> Result<(), NativeError> {
        let input = request.input;
        let role = cstring(input.role.as_str(), "role")?;

        // Owns text inputs until rkllm_run returns
        let mut texts: Vec<CString> = Vec::with_capacity(1);
        let (input_type, input_data) = match &input.payload {
            InputPayload::Prompt(prompt) => {
                let prompt = cstring(prompt, "prompt")?;
                let data = RKLLMInputUnion {
                    prompt_input: prompt.as_ptr(),
                };
                texts.push(prompt);
                (RKLLM_INPUT_PROMPT, data)
            }
            InputPayload::Tokens(ids) => (
                RKLLM_INPUT_TOKEN,
                RKLLMInputUnion {
                    token_input: RKLLMTokenInput {
                        input_ids: ids.as_ptr(),
                        n_tokens: ids.len(),
                    },
                },
            ),
            InputPayload::Embedding { embed, n_tokens } => (
                RKLLM_INPUT_EMBED,
                RKLLMInputUnion {
                    embed_input: RKLLMEmbedInput {
                        embed: embed.as_ptr(),
                        n_tokens: *n_tokens,
                    },
                },
            ),
            InputPayload::Multimodal {
                prompt,
                image_embed,
                image,
            } => {
                let prompt = cstring(prompt, "prompt")?;
                let data = RKLLMInputUnion {
                    multimodal_input: RKLLMMultiModelInput {
                        prompt: prompt.as_ptr(),
                        image_embed: image_embed.as_ptr(),
                        n_image_tokens: image.n_image_tokens,
                        n_image: image.n_image,
                        image_width: image.width,
                        image_height: image.height,
                    },
                };
                texts.push(prompt);
                (RKLLM_INPUT_MULTIMODAL, data)
            }
        };

        let mut native_input = RKLLMInput {
            role: role.as_ptr(),
            enable_thinking: input.enable_thinking,
            input_type,
            input_data,
        };

        let lora_name = request
            .lora_adapter
            .map(|name| cstring(name, "lora adapter name"))
            .transpose()?;
        let mut lora_param = lora_name.as_ref().map(|name| RKLLMLoraParam {
            lora_adapter_name: name.as_ptr(),
        });

        let cache_path = request.save_prompt_cache.map(path_cstring).transpose()?;
        let mut cache_param = cache_path.as_ref().map(|path| RKLLMPromptCacheParam {
            save_prompt_cache: 1,
            prompt_cache_path: path.as_ptr(),
        });

        let mut infer = RKLLMInferParam {
            mode: RKLLM_INFER_GENERATE,
            lora_params: lora_param
                .as_mut()
                .map_or(ptr::null_mut(), |p| p as *mut RKLLMLoraParam),
            prompt_cache_params: cache_param
                .as_mut()
                .map_or(ptr::null_mut(), |p| p as *mut RKLLMPromptCacheParam),
            keep_history: c_int::from(request.keep_history),
        };

        let userdata = request.run as usize as *mut c_void;
        // SAFETY: every pointer in `native_input` and `infer` refers to data
        // owned by this frame or by `request`, all alive until the call returns
        let status = unsafe { (self.run)(ctx.as_ptr(), &mut native_input, &mut infer, userdata) };
        check_status("rkllm_run", status)
    }

    fn abort(&self, ctx: NativeContext) -> Result<(), NativeError> {
        // SAFETY: ctx came from rkllm_init and has not been destroyed
        check_status("rkllm_abort", unsafe { (self.abort)(ctx.as_ptr()) })
    }

    fn destroy(&self, ctx: NativeContext) -> Result<(), NativeError> {
        // SAFETY: ctx came from rkllm_init; the engine handle destroys it once
        check_status("rkllm_destroy", unsafe { (self.destroy)(ctx.as_ptr()) })
    }

    fn set_chat_template(
        &self,
        ctx: NativeContext,
        template: &NativeChatTemplate,
    ) -> Result<(), NativeError> {
        let system = cstring(&template.system_prompt, "system prompt")?;
        let prefix = cstring(&template.prompt_prefix, "prompt prefix")?;
        let postfix = cstring(&template.prompt_postfix, "prompt postfix")?;
        // SAFETY: the strings outlive the call; the runtime copies them
        let status = unsafe {
            (self.set_chat_template)(ctx.as_ptr(), system.as_ptr(), prefix.as_ptr(), postfix.as_ptr())
        };
        check_status("rkllm_set_chat_template", status)
    }

    fn load_lora(&self, ctx: NativeContext, adapter: &LoraAdapter) -> Result<(), NativeError> {
        let load = self
            .load_lora
            .ok_or(NativeError::Unsupported("rkllm_load_lora"))?;
        let path = path_cstring(&adapter.path)?;
        let name = cstring(&adapter.name, "lora adapter name")?;
        let mut native = RKLLMLoraAdapter {
            lora_adapter_path: path.as_ptr(),
            lora_adapter_name: name.as_ptr(),
            scale: adapter.scale,
        };
        // SAFETY: `native` and its strings outlive the call
        check_status("rkllm_load_lora", unsafe { load(ctx.as_ptr(), &mut native) })
    }

    fn load_prompt_cache(&self, ctx: NativeContext, path: &Path) -> Result<(), NativeError> {
        let load = self
            .load_prompt_cache
            .ok_or(NativeError::Unsupported("rkllm_load_prompt_cache"))?;
        let path = path_cstring(path)?;
        // SAFETY: the path outlives the call
        check_status("rkllm_load_prompt_cache", unsafe { load(ctx.as_ptr(), path.as_ptr()) })
    }

    fn release_prompt_cache(&self, ctx: NativeContext) -> Result<(), NativeError> {
        let release = self
            .release_prompt_cache
            .ok_or(NativeError::Unsupported("rkllm_release_prompt_cache"))?;
        // SAFETY: ctx came from rkllm_init and has not been destroyed
        check_status("rkllm_release_prompt_cache", unsafe { release(ctx.as_ptr()) })
    }

    fn clear_kv_cache(
        &self,
        ctx: NativeContext,
        keep_system_prompt: bool,
    ) -> Result<(), NativeError> {
        let clear = self
            .clear_kv_cache
            .ok_or(NativeError::Unsupported("rkllm_clear_kv_cache"))?;
        // SAFETY: ctx came from rkllm_init and has not been destroyed
        check_status("rkllm_clear_kv_cache", unsafe {
            clear(ctx.as_ptr(), c_int::from(keep_system_prompt))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::streaming::{register, unregister, StreamEvent};
    use std::sync::mpsc;

    fn empty_result(text: *const std::ffi::c_char) -> RKLLMResult {
        RKLLMResult {
            text,
            token_id: 0,
            last_hidden_layer: RKLLMResultLastHiddenLayer {
                hidden_states: ptr::null(),
                embd_size: 0,
                num_tokens: 0,
            },
            logits: RKLLMResultLogits {
                logits: ptr::null(),
                vocab_size: 0,
                num_tokens: 0,
            },
            perf: RKLLMPerfStat::default(),
        }
    }

    #[test]
    fn test_load_missing_library() {
        let result = RkllmLibrary::load("/nonexistent/librkllmrt.so");
        assert!(matches!(result, Err(NativeError::Library(_))));
    }

    #[test]
    fn test_decode_text_and_null_text() {
        let text = CString::new("héllo").unwrap();
        let result = empty_result(text.as_ptr());
        let event = unsafe { decode_event(&result, RKLLM_RUN_NORMAL) };
        assert_eq!(
            event,
            Some(CallbackEvent::TokenChunk("héllo".as_bytes().to_vec()))
        );

        let result = empty_result(ptr::null());
        assert_eq!(unsafe { decode_event(&result, RKLLM_RUN_NORMAL) }, None);
        assert_eq!(unsafe { decode_event(ptr::null(), RKLLM_RUN_NORMAL) }, None);
    }

    #[test]
    fn test_decode_terminal_states() {
        let mut result = empty_result(ptr::null());
        result.perf = RKLLMPerfStat {
            prefill_time_ms: 10.0,
            prefill_tokens: 12,
            generate_time_ms: 20.0,
            generate_tokens: 34,
            memory_usage_mb: 512.0,
        };
        match unsafe { decode_event(&result, RKLLM_RUN_FINISH) } {
            Some(CallbackEvent::Finished(stats)) => {
                assert_eq!(stats.prefill_tokens, 12);
                assert_eq!(stats.generate_tokens, 34);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            unsafe { decode_event(ptr::null(), RKLLM_RUN_ERROR) },
            Some(CallbackEvent::Error(RKLLM_RUN_ERROR))
        );
        assert_eq!(
            unsafe { decode_event(ptr::null(), RKLLM_RUN_WAITING) },
            Some(CallbackEvent::Waiting)
        );
        assert_eq!(unsafe { decode_event(ptr::null(), 42) }, None);
    }

    #[test]
    fn test_trampoline_routes_by_userdata() {
        let (tx, rx) = mpsc::channel();
        let sink = register(tx);
        let text = CString::new("chunk").unwrap();
        let mut result = empty_result(text.as_ptr());
        let userdata = sink.id() as usize as *mut c_void;

        let ret = unsafe { result_callback(&mut result, userdata, RKLLM_RUN_NORMAL) };
        assert_eq!(ret, 0);
        unsafe { result_callback(&mut result, userdata, RKLLM_RUN_FINISH) };
        unregister(sink.id());

        assert_eq!(rx.try_recv().unwrap(), StreamEvent::Text("chunk".into()));
        assert!(rx.try_recv().unwrap().is_terminal());
    }
}

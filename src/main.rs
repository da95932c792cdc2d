//! rkllm-bridge
//!
//! Streams one prompt through an RKLLM model on the NPU and prints telemetry.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueHint};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rkllm_bridge::inference::{EngineHandle, LoraAdapter};
use rkllm_bridge::storage::init_storage;
use rkllm_bridge::storage::settings::{load_settings, save_settings};
use rkllm_bridge::types::ChatMessage;

#[derive(Parser, Debug)]
#[command(name = "rkllm-bridge", version, about = "Stream a prompt through an RKLLM model")]
struct Cli {
    /// Prompt to send as the user message
    prompt: String,

    /// Model file (.rkllm), overrides the saved setting
    #[arg(long, value_hint = ValueHint::FilePath)]
    model: Option<PathBuf>,

    /// Path to librkllmrt.so, overrides the saved setting
    #[arg(long, value_hint = ValueHint::FilePath)]
    library: Option<PathBuf>,

    /// System prompt, overrides the saved setting
    #[arg(long)]
    system: Option<String>,

    /// Stop sequence (repeatable)
    #[arg(long = "stop")]
    stop: Vec<String>,

    /// Let the model reason inside <think> before answering
    #[arg(long)]
    think: bool,

    /// Abort the run after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Persist the effective settings
    #[arg(long)]
    save: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("rkllm_bridge=info")),
        )
        .init();

    info!("Starting rkllm-bridge v{}", env!("CARGO_PKG_VERSION"));

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    if let Err(e) = init_storage() {
        warn!("Storage unavailable: {}", e);
    }

    let mut settings = load_settings();
    if let Some(model) = cli.model {
        settings.model_path = model;
    }
    if let Some(library) = cli.library {
        settings.library_path = library;
    }
    if let Some(system) = cli.system {
        settings.system_prompt = system;
    }
    if !cli.stop.is_empty() {
        settings.stop_sequences = cli.stop;
    }
    if let Some(timeout) = cli.timeout {
        settings.timeout_secs = timeout;
    }
    settings.enable_thinking |= cli.think;
    settings.validate();

    if cli.save {
        save_settings(&settings)?;
    }

    let lora = settings
        .lora_path
        .as_ref()
        .map(|path| LoraAdapter::new(path, settings.lora_name.clone()));
    let engine = EngineHandle::open(
        &settings.library_path,
        settings.engine_config(),
        &settings.model_path,
        lora.as_ref(),
        settings.prompt_cache_path.as_deref(),
    )?;

    let mut messages = Vec::new();
    if !settings.system_prompt.trim().is_empty() {
        messages.push(ChatMessage::system(settings.system_prompt.clone()));
    }
    messages.push(ChatMessage::user(cli.prompt));

    let stream = engine.stream(&messages, settings.generation_options())?;
    let cancel = stream.cancel_handle();
    let (mut rx, summary) = stream.into_async();

    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            text = rx.recv() => match text {
                Some(text) => {
                    stdout.write_all(text.as_bytes())?;
                    stdout.flush()?;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, aborting generation");
                cancel.cancel();
            }
        }
    }
    println!();

    let summary = summary.await?;
    if let Some(perf) = summary.perf {
        eprintln!(
            "prefill: {} tokens in {:.0} ms | generate: {} tokens in {:.0} ms ({:.1} tok/s) | memory: {:.0} MB",
            perf.prefill_tokens,
            perf.prefill_time_ms,
            perf.generate_tokens,
            perf.generate_time_ms,
            perf.generate_tokens_per_second().unwrap_or(0.0),
            perf.memory_usage_mb
        );
    }
    eprintln!("stop reason: {:?}", summary.stop_reason);

    if let Some(e) = summary.error {
        return Err(e.into());
    }
    engine.destroy()?;
    Ok(ExitCode::SUCCESS)
}

//! prompt-prefix-cache: an OpenAI-compatible inference server with
//! prompt-prefix KV-cache reuse.
//!
//! Detects the longest prompt-token prefix already processed by an earlier
//! request under identical generation parameters, reuses the attention
//! key/value tensors computed for that prefix, and writes back the
//! extended cache with bounded memory and time-to-live admission.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::info;

use prompt_prefix_cache::cache::manager::Manager;
use prompt_prefix_cache::config::{Cli, Config};
use prompt_prefix_cache::inference::engine::InferenceEngine;
use prompt_prefix_cache::inference::llama_ffi::{LlamaModel, ModelParams};
use prompt_prefix_cache::server::openai_api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "prompt_prefix_cache=debug,tower_http=debug"
    } else {
        "prompt_prefix_cache=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("prompt-prefix-cache v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&cli.config)?;
    let config = Arc::new(config);

    info!(
        model = %config.model.model_path.display(),
        context_size = config.model.context_size,
        n_layers = config.model.n_layers,
        n_kv_heads = config.model.n_kv_heads,
        "configuration loaded"
    );

    info!(
        enable_cache = config.cache.enable_cache,
        max_bytes_mb = config.cache.max_bytes_mb,
        ttl_minutes = config.cache.ttl_minutes,
        "cache configuration"
    );

    let model = Arc::new(LlamaModel::load(
        &config.model.model_path.display().to_string(),
        ModelParams {
            n_gpu_layers: config.model.n_gpu_layers,
            ..ModelParams::default()
        },
    )?);

    let cache = Arc::new(Manager::new(&config.cache));
    let engine = InferenceEngine::new(cache.clone(), config.clone(), model);

    let state = Arc::new(AppState {
        engine: RwLock::new(engine),
        config: config.clone(),
        cache,
        start_time: Instant::now(),
    });

    let app = build_router(state);

    let listen_addr = cli.listen;
    info!(addr = listen_addr, "starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}

//! `kiln serve`: the live loop until Ctrl+C.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::core::setup_shutdown_handler;
use crate::engine::Engine;

/// Run the engine on a multi-threaded runtime. Returns after a graceful
/// shutdown has persisted the caches.
pub fn serve_components(config: EngineConfig) -> Result<()> {
    let shutdown = CancellationToken::new();
    setup_shutdown_handler(shutdown.clone())?;

    let engine = Arc::new(Engine::new(config)?);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("kiln-runtime")
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    runtime.block_on(engine.run(shutdown))
}

use anyhow::{Context, Result};
use chatpulse_backend::config::EngineConfig;
use chatpulse_backend::runtime::BackendRuntime;
use chatpulse_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,chatpulse=debug,chatpulse_backend=debug")
            }),
        )
        .init();

    tracing::info!("ChatPulse backend starting...");

    let config = EngineConfig::load();
    let runtime =
        BackendRuntime::bootstrap(config).context("failed to bootstrap backend runtime")?;

    tracing::info!(
        "Serving on {} (set CHATPULSE_BACKEND_TOKEN; auth mode via CHATPULSE_BACKEND_AUTH_MODE)",
        runtime.config.bind_addr
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(runtime))
}

use anyhow::{Context, Result};
use bodydouble_backend::config::{AuthMode, CompanionConfig};
use bodydouble_backend::runtime::BackendRuntime;
use bodydouble_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,bodydouble=debug,bodydouble_backend=debug")
            }),
        )
        .init();

    let config = CompanionConfig::load();

    // `--write-config` dumps the resolved settings for editing, then exits.
    if std::env::args().skip(1).any(|arg| arg == "--write-config") {
        config.save()?;
        return Ok(());
    }

    if config.auth_mode == AuthMode::Required {
        tracing::info!("Bearer auth required (BODYDOUBLE_TOKEN)");
    }
    tracing::info!(
        "Starting body double backend (bind via BODYDOUBLE_BIND; auth mode via BODYDOUBLE_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(async {
        let runtime =
            BackendRuntime::bootstrap(config).context("failed to bootstrap backend runtime")?;
        serve_backend(runtime).await
    })
}

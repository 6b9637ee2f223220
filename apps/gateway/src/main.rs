use anyhow::Context;

use datawash_gateway::build_router;
use datawash_gateway::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_filter.clone())),
        )
        .init();

    let bind_addr = config.bind_addr;
    let router = build_router(config).context("failed to build router")?;

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    let local_addr = listener.local_addr().context("failed to read local address")?;
    tracing::info!(addr = %local_addr, "datawash gateway listening");

    axum::serve(listener, router)
        .await
        .context("server terminated")?;

    Ok(())
}

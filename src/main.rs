use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;

use kiln::config::Config;
use kiln::gateway::GenerationGateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    let config = Config::load();
    tracing::info!(
        bind = %config.bind,
        max_requests = config.rate_limit.max_requests,
        window = ?config.rate_limit.window,
        "kiln starting"
    );

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    let gateway = Arc::new(GenerationGateway::from_config(&config));

    let app = kiln::server::router(gateway, config.trust_forwarded_for);
    kiln::server::serve(listener, app, async {
        tokio::signal::ctrl_c().await.ok();
    })
    .await
    .inspect_err(|e| tracing::error!("serving error: {e:?}"))?;

    tracing::info!("kiln shutting down");
    Ok(())
}

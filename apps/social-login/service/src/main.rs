use anyhow::{Context, Result};
use social_login_service::build_router;
use social_login_service::config::Config;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("load social login configuration")?;

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter)),
        )
        .init();

    if config.redirect_url.is_empty() {
        tracing::warn!(
            target: "social_login.config",
            "SOCIAL_LOGIN_REDIRECT_URL is not set; twitter handshakes will be rejected",
        );
    }

    let bind_addr = config.bind_addr;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("bind {bind_addr}"))?;
    tracing::info!(
        target: "social_login.server",
        addr = %bind_addr,
        "social login service listening",
    );

    axum::serve(listener, build_router(config))
        .await
        .context("serve social login router")?;
    Ok(())
}

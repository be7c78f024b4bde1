use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mcp_gateway::{server, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mcp_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let bind_address = config.bind_address.clone();
    let scopes = config.scopes.clone();

    let state = AppState::from_config(config)?;
    let app = server::build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(
        address = %bind_address,
        scopes = ?scopes,
        "MCP gateway listening"
    );
    axum::serve(listener, app).await?;

    Ok(())
}

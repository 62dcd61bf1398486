use std::net::SocketAddr;

use pin_chat::{app, config::Config, db, error::AppErr, state::AppState, utils::clean};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AppErr> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug")),
        )
        .init();

    let config = Config::from_env()?;
    tokio::fs::create_dir_all(&config.upload_dir).await?;
    let pool = db::connect(&config.database_url, 8).await?;
    let addr = config.bind_addr.clone();
    let state = AppState::new(pool, config);

    tokio::spawn(clean::task(state.clone())); // sweeper

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app(state).into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

use tracing::info;

use accounts_api::{routes, state::AppState};

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    // Create and run the tokio runtime
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()?
        .block_on(async { run_application().await })
}

async fn run_application() -> color_eyre::Result<()> {
    setup_tracing()?;

    let app_state = AppState::from_env().await?;

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], app_state.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, routes::routes(app_state)).await?;

    Ok(())
}

fn setup_tracing() -> color_eyre::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::Router;
use clap::Parser;
use color_eyre::eyre::Result;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tuya_bulb_panel::api::{self, AppState};
use tuya_bulb_panel::config::DEFAULT_CONFIG_PATH;
use tuya_bulb_panel::{Config, DeviceSession};

/// Web control panel for a Tuya white-light bulb
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Address to bind, overrides `server.bind`
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| {
                EnvFilter::new("tuya_bulb_panel=info,bulbd=info,tower_http=debug")
            }),
        )
        .compact()
        .init();

    color_eyre::install()?;

    let args = Args::parse();

    let mut config = Config::load_validated(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    info!(
        "Bulb {} at {} (protocol {})",
        config.bulb.redacted_device_id(),
        config.bulb.ip_address,
        config.bulb.version
    );

    let session = DeviceSession::tcp(config.bulb.clone(), config.session.options());

    // The panel stays up without the bulb; /restart retries later.
    if let Err(e) = session.connect().await {
        warn!("Initial connection failed: {}", e);
    }

    let state = AppState::new(session);

    let mut app = api::router();
    if let Some(dir) = &config.server.static_dir {
        info!("Serving front end from {:?}", dir);
        app = app.fallback_service(ServeDir::new(dir));
    }

    let app: Router = app
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let addr: SocketAddr = config.server.bind.parse()?;

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use fleet_orchestrator::app::App;
use fleet_orchestrator::config::Config;

#[derive(Parser, Debug)]
#[command(name = "fleet-orchestrator", version, about = "Fleet orchestrator and multiplexing proxy for P2P streaming engines")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, default_value = "fleet-orchestrator.toml")]
    config: String,

    /// Override the configured bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the configured bind port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Tracing filter, e.g. "info" or "fleet_orchestrator=debug".
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();

    let mut config = Config::load_from_file(&cli.config)?;
    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }

    let app = App::new(config);
    app.wire_observers().await;
    app.clone().spawn_background_tasks();

    let addr = format!("{}:{}", app.config.web.host, app.config.web.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "fleet orchestrator listening");

    let router = fleet_orchestrator::web::router(app);
    axum::serve(listener, router.into_make_service_with_connect_info::<std::net::SocketAddr>()).await?;

    Ok(())
}

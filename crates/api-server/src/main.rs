//! API Server binary entrypoint.

use api_server::{ApiServer, ServerConfig};
use clap::{Parser, Subcommand};
use relay_core::config::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Copyrelay API Server
#[derive(Parser)]
#[command(name = "api-server")]
#[command(about = "HTTP and WebSocket API for the copyrelay copy-trading platform")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server (default)
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "api_server=info,replication=info,relay_core=info,auth=info,audit=info,tower_http=warn,sqlx=warn,hyper=warn".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Config::from_env()?;
    let pool = relay_core::db::create_pool(&config.database).await?;

    let skip_migrations = std::env::var("SKIP_MIGRATIONS")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    if !skip_migrations {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("../../migrations").run(&pool).await?;
    }

    match cli.command {
        Some(Commands::Serve) | None => {
            let server_config = ServerConfig::from_env();
            tracing::info!(
                host = %server_config.host,
                port = %server_config.port,
                "Server configuration loaded"
            );

            let server = ApiServer::new(server_config, pool).await?;
            server.run().await?;
        }
    }

    Ok(())
}

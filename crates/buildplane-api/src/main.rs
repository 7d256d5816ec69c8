//! Buildplane API Server

use buildplane_api::{AppState, routes};
use buildplane_builds::BuildService;
use buildplane_config::{LogFormat, StoreBackend, SystemConfig, load_system_config};
use buildplane_core::audit::LogAuditor;
use buildplane_core::authz::RoleAuthorizer;
use buildplane_core::events::MemoryPubsub;
use buildplane_core::notification::LogNotifier;
use buildplane_db::{MemoryStore, PgStore, Store, create_pool, run_migrations};
use buildplane_scheduler::WorkspaceBuilder;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "buildplane-server", about = "Workspace build control plane")]
struct Args {
    /// Path to the KDL system configuration.
    #[arg(long, env = "BUILDPLANE_CONFIG", default_value = "buildplane.kdl")]
    config: PathBuf,

    /// PostgreSQL connection string; selects the postgres store.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Address to listen on.
    #[arg(long, env = "BUILDPLANE_LISTEN")]
    listen: Option<SocketAddr>,
}

fn load_config(args: &Args) -> anyhow::Result<SystemConfig> {
    let mut config = if args.config.exists() {
        load_system_config(&args.config)?
    } else {
        SystemConfig::default()
    };
    if let Some(url) = &args.database_url {
        config.database.backend = StoreBackend::Postgres;
        config.database.url = Some(url.clone());
    }
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    Ok(config)
}

fn init_tracing(config: &SystemConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn open_store(config: &SystemConfig) -> anyhow::Result<Arc<dyn Store>> {
    match config.database.backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; data is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let url = config
                .database
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("database url is required for the postgres store"))?;
            info!("Connecting to database...");
            let pool = create_pool(url, config.database.max_connections).await?;
            run_migrations(&pool).await?;
            info!("Database connected");
            Ok(Arc::new(PgStore::new(pool)))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config);

    let store = open_store(&config).await?;
    let stale_interval = config.provisioner.stale_interval;
    let builds = BuildService::new(
        store,
        Arc::new(WorkspaceBuilder::new(stale_interval)),
        Arc::new(MemoryPubsub::new()),
        Arc::new(LogNotifier),
        Arc::new(LogAuditor),
        Arc::new(RoleAuthorizer),
    )
    .with_stale_interval(stale_interval);

    let app = routes::router(AppState::new(builds))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr = config.server.listen;
    info!("Starting server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

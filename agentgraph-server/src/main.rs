use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use agentgraph_core::config::KvBackend;
use agentgraph_core::{AgentGraphConfig, KvStore, MemoryKvStore, PgKvStore};
use agentgraph_server::server;
use agentgraph_server::state::AppState;
use agentgraph_server::subsystems::sweeper;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "agentgraph.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

async fn connect_store(config: &AgentGraphConfig) -> anyhow::Result<Arc<dyn KvStore>> {
    match config.kv.backend {
        KvBackend::Memory => Ok(Arc::new(MemoryKvStore::new())),
        KvBackend::Postgres => {
            let pool = agentgraph_core::db::create_pool(&config.kv.database).await?;
            let store = PgKvStore::new(pool);
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience; production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Init logging
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    // Load config
    let config = match AgentGraphConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Connect the session store
    let store = match connect_store(&config).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to connect session store ({:?}): {}", config.kv.backend, e);
            std::process::exit(1);
        }
    };

    let state = Arc::new(AppState::new(config.clone(), store));

    if args.health {
        match state.directories.ensure_root().await {
            Ok(()) => println!("✅ Session root writable: {}", state.directories.root().display()),
            Err(e) => {
                println!("❌ Session root unavailable: {}", e);
                std::process::exit(1);
            }
        }

        if config.kv.backend == KvBackend::Postgres {
            let pool = agentgraph_core::db::create_pool(&config.kv.database).await?;
            match agentgraph_core::db::health_check(&pool).await {
                Ok(v) => println!("✅ PostgreSQL connected: {}", v),
                Err(e) => {
                    println!("❌ PostgreSQL connection failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        println!("✅ AgentGraph health check passed");
        return Ok(());
    }

    state.directories.ensure_root().await?;
    tracing::info!(
        root = %state.directories.root().display(),
        kv_backend = state.sessions.backend(),
        "Session storage ready"
    );

    // Shutdown fan-out
    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // Spawn the lifecycle sweep loop
    if config.sweeper.enabled {
        tokio::spawn(sweeper::run_sweep_loop(
            state.sweeper.clone(),
            config.sweeper.clone(),
            tx.subscribe(),
        ));
    } else {
        tracing::warn!("Sweeper disabled: expired sessions are only reclaimed on demand");
    }

    // Spawn HTTP REST API server if enabled
    if config.http.enabled {
        let http_state = state.clone();
        let http_shutdown = tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = agentgraph_server::http::start_http_server(http_state, http_shutdown).await {
                tracing::error!("HTTP server error: {}", e);
            }
        });
    }

    let socket_path = config.service.socket_path.clone();
    server::run_unix_server(&socket_path, state, tx.subscribe()).await?;

    Ok(())
}

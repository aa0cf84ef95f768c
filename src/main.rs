//! artifact-depot - A self-hosted multi-ecosystem package registry
//!
//! This is the main entry point for the artifact-depot application.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use artifact_depot::auth::{
    hash_token, AllowAll, AuditSink, AuthManager, DatabasePermissions, PermissionChecker,
    RegistryTokenIssuer, TracingAuditSink,
};
use artifact_depot::config::Config;
use artifact_depot::container::{spawn_upload_reaper, ListenerAccess};
use artifact_depot::database::{Database, SqliteDatabase};
use artifact_depot::otel::{init_tracing, Metrics, OtelProvider};
use artifact_depot::plugins::cache::{spawn_sweeper, ProxyCache};
use artifact_depot::router::{ListenerOutcome, RepositoryRouter};
use artifact_depot::server::{AppState, Server};
use artifact_depot::storage::StorageSet;
use artifact_depot::upstream::UpstreamClient;

/// artifact-depot - A self-hosted multi-ecosystem package registry
#[derive(Parser, Debug)]
#[command(name = "artifact-depot")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "ARTIFACT_DEPOT_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the argon2 hash of a secret for `auth.admin_password_hash`
    HashToken {
        /// Secret to hash
        secret: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(Command::HashToken { secret }) = &args.command {
        println!("{}", hash_token(secret)?);
        return Ok(());
    }

    let config = load_config(&args)?;
    config.validate()?;

    let otel_provider = OtelProvider::new(&config.otel)?;
    init_tracing(&otel_provider, &config.logging)?;
    let metrics = Arc::new(Metrics::new(&otel_provider.meter()));

    info!(version = env!("CARGO_PKG_VERSION"), "Starting artifact-depot");

    let database: Arc<dyn Database> = Arc::new(SqliteDatabase::new(&config.database.path).await?);
    info!(path = %config.database.path, "Database initialized");

    let storage = StorageSet::from_config(&config.storage).await?;
    let upstream = Arc::new(UpstreamClient::new(&config.upstream)?);
    let cache = Arc::new(
        ProxyCache::new(storage.clone(), upstream, config.cache.clone()).with_metrics(metrics),
    );

    let repositories = database.list_repositories().await?;
    let recovered = cache.rebuild(&repositories).await?;
    info!(
        repositories = repositories.len(),
        cache_entries = recovered,
        "Proxy cache index rebuilt"
    );

    let auth = Arc::new(AuthManager::new(Arc::clone(&database), &config.auth));
    let grants = Arc::new(DatabasePermissions::new(
        Arc::clone(&database),
        config.auth.anonymous_read,
    ));
    let permissions: Arc<dyn PermissionChecker> = if config.auth.enabled {
        grants.clone()
    } else {
        Arc::new(AllowAll)
    };
    info!(auth_enabled = config.auth.enabled, "Authentication manager initialized");

    let access = ListenerAccess::new(
        Some(Arc::clone(&auth)),
        Arc::clone(&permissions),
        RegistryTokenIssuer::from_config(&config.container),
        config.container.service_name.clone(),
    );
    let router = RepositoryRouter::new(
        Arc::clone(&database),
        storage,
        Arc::clone(&cache),
        config.server.base_url(),
    )
    .with_auth(Arc::clone(&auth))
    .with_listeners(config.container.clone(), access);

    for (repository, outcome) in router.start_listeners().await? {
        match outcome {
            ListenerOutcome::Started { port } => {
                info!(repository = %repository, port, "Registry listener started")
            }
            ListenerOutcome::Failed { error } => {
                warn!(repository = %repository, error = %error, "Registry listener not started")
            }
            other => info!(repository = %repository, outcome = ?other, "Registry listener"),
        }
    }

    let (sweep_tx, sweep_rx) = broadcast::channel(1);
    let sweeper = spawn_sweeper(
        Arc::clone(&cache),
        Arc::clone(&database),
        Duration::from_secs(config.cache.sweep_interval_secs),
        sweep_rx,
    );
    let reaper = router.listeners().map(|listeners| {
        spawn_upload_reaper(
            Arc::clone(listeners.sessions()),
            Duration::from_secs(config.container.upload_idle_secs),
            sweep_tx.subscribe(),
        )
    });

    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let state = AppState {
        router: Arc::clone(&router),
        auth,
        permissions,
        grants: Some(grants),
        audit,
    };

    info!(
        host = %config.server.host,
        port = %config.server.port,
        public_url = %config.server.base_url(),
        "Starting HTTP server"
    );
    let result = Server::new(config.server.clone(), state)
        .run(shutdown_signal())
        .await;

    let _ = sweep_tx.send(());
    router.shutdown().await;
    if let Err(e) = sweeper.await {
        warn!(error = %e, "Cache sweeper did not stop cleanly");
    }
    if let Some(reaper) = reaper {
        if let Err(e) = reaper.await {
            warn!(error = %e, "Upload reaper did not stop cleanly");
        }
    }

    if let Err(e) = otel_provider.shutdown() {
        error!(error = %e, "Failed to shutdown OpenTelemetry");
    }

    info!("artifact-depot shutdown complete");

    result.map_err(Into::into)
}

/// Load configuration from file or environment
fn load_config(args: &Args) -> anyhow::Result<Config> {
    match &args.config {
        Some(path) => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from file: {}", path);
            Config::from_file(path).map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
        }
        None => {
            eprintln!("Loading configuration from environment variables");
            Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
        }
    }
}

/// Create a future that resolves when a shutdown signal is received
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

//! mirror-node daemon
//!
//! Wires the credential manager, object store, download pool, cache and
//! session controller together and serves objects over HTTP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info};

use mirror_node::cache::{spawn_sweep_task, ObjectCache};
use mirror_node::certs::CertDir;
use mirror_node::config::Config;
use mirror_node::coordinator::{CoordinatorClient, CURRENT_VERSION};
use mirror_node::counters::ServeCounters;
use mirror_node::credentials::CredentialManager;
use mirror_node::download::progress::SyncProgress;
use mirror_node::download::DownloadCoordinator;
use mirror_node::manifest::ManifestClient;
use mirror_node::server::{create_router, ServerState};
use mirror_node::session::channel::SocketIoConnector;
use mirror_node::session::{Announcement, SessionController, SessionParts};
use mirror_node::shutdown::Shutdown;
use mirror_node::storage::ContentStore;

#[derive(Parser)]
#[command(name = "mirror-node")]
#[command(about = "Edge agent for a federated file-distribution cluster")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "mirror-node.toml")]
    config: String,

    /// Object store directory
    #[arg(short, long, env = "MIRROR_DATA_DIR")]
    data_dir: Option<String>,

    /// Cluster ID (overrides config file)
    #[arg(long, env = "CLUSTER_ID")]
    cluster_id: Option<String>,

    /// Cluster secret (overrides config file)
    #[arg(long, env = "CLUSTER_SECRET", hide_env_values = true)]
    cluster_secret: Option<String>,

    /// HTTP serving port (overrides config file)
    #[arg(short, long, env = "MIRROR_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mirror_node=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    info!(version = CURRENT_VERSION, "Starting mirror-node");
    info!("Config file: {}", cli.config);

    let mut config = if std::path::Path::new(&cli.config).exists() {
        let content = std::fs::read_to_string(&cli.config)?;
        Config::from_toml(&content)?
    } else {
        info!("Config file not found, using defaults");
        Config::default()
    };

    if let Some(id) = cli.cluster_id {
        config.cluster.id = id;
    }
    if let Some(secret) = cli.cluster_secret {
        config.cluster.secret = secret;
    }
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = PathBuf::from(data_dir);
    }
    if let Some(port) = cli.port {
        config.api.http_port = port;
    }
    config.validate()?;

    info!("Cluster: {}", config.cluster.id);
    info!("Coordinator: {}", config.coordinator.base_url);
    info!("Data dir: {}", config.storage.data_dir.display());

    let shutdown = Shutdown::new();

    let client = CoordinatorClient::new(&config.coordinator)?;
    let credentials = Arc::new(CredentialManager::new(client.clone(), &config.cluster));
    let store = Arc::new(ContentStore::new(&config.storage.data_dir).await?);
    let progress = Arc::new(SyncProgress::new(config.download.window_secs));
    let counters = Arc::new(ServeCounters::new());

    let cache = Arc::new(ObjectCache::new(Arc::clone(&store), &config.cache));
    spawn_sweep_task(
        Arc::clone(&cache),
        Duration::from_secs(config.cache.sweep_interval_secs.max(1)),
        shutdown.subscribe(),
    );

    tokio::spawn(Arc::clone(&credentials).run_refresh_loop(shutdown.subscribe()));

    let downloads = DownloadCoordinator::new(
        client.clone(),
        Arc::clone(&credentials),
        Arc::clone(&store),
        Arc::clone(&progress),
        config.download.clone(),
        shutdown.subscribe(),
    );
    let connector = SocketIoConnector::new(
        client.socket_url(),
        Duration::from_secs(config.coordinator.request_timeout_secs),
    );
    let controller = SessionController::new(
        SessionParts {
            credentials: Arc::clone(&credentials),
            manifest: ManifestClient::new(client.clone(), Arc::clone(&credentials)),
            downloads,
            connector: Arc::new(connector),
            counters: counters.clone(),
            certs: Arc::new(CertDir::new(config.session.ssl_dir.clone())),
        },
        Announcement::from_config(&config),
        config.session.clone(),
        shutdown.subscribe(),
    );
    let session_state = controller.subscribe();
    let session_task = tokio::spawn(controller.run());

    let app = create_router(Arc::new(ServerState {
        cache,
        counters,
        progress,
        session: session_state,
        started_at: Instant::now(),
    }));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api.http_port));
    info!("Serving on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_shutdown = shutdown.clone();
    let mut server_signal = shutdown.subscribe();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        mirror_node::shutdown::wait_for(&mut server_signal).await;
    });

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
        server_shutdown.trigger();
    });

    let served = server.await;
    if !shutdown.is_triggered() {
        error!("HTTP server exited before shutdown was requested");
        shutdown.trigger();
    }
    if let Err(e) = session_task.await {
        error!(error = %e, "Session controller task failed");
    }

    served?;
    info!("mirror-node stopped");
    Ok(())
}

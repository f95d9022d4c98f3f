use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use axum::Json;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use alertmux_engine::config::parse_duration;
use alertmux_engine::peer::StaticPeer;
use alertmux_server::api::{self, ApiState};
use alertmux_server::discovery;
use alertmux_server::http::{self, TenantState};
use alertmux_server::manager::{Manager, ManagerConfig};
use alertmux_server::metrics::{render_prometheus, ManagerMetrics};
use alertmux_server::store::etcd::EtcdStore;
use alertmux_server::store::inmem::InMemStore;
use alertmux_server::store::pump::ChangePump;
use alertmux_server::store::ConfigStore;

#[derive(Parser)]
#[command(name = "alertmux", version, about = "Multi-tenant alert notification service")]
struct Opts {
    #[clap(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the multi-tenant alertmanager
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(
        long = "alertmanager.storage.path",
        default_value = "data/",
        help = "Base path for data storage"
    )]
    storage_path: PathBuf,

    #[arg(
        long = "alertmanager.storage.retention",
        default_value = "120h",
        help = "How long to keep notification log and silence data for"
    )]
    retention: String,

    #[arg(
        long = "alertmanager.path-prefix",
        default_value = "/api/prom/alertmanager",
        help = "Path prefix the per-tenant API is served under"
    )]
    path_prefix: String,

    #[arg(
        long = "alertmanager.configs.poll-interval",
        default_value = "15s",
        help = "How frequently to poll for tenant config changes"
    )]
    poll_interval: String,

    #[arg(
        long = "alertmanager.api-port",
        default_value_t = 8080,
        help = "Port the HTTP API listens on"
    )]
    api_port: u16,

    #[arg(
        long = "cluster.listen-address",
        default_value = "0.0.0.0:9094",
        help = "Listen address for cluster membership"
    )]
    cluster_listen: String,

    #[arg(
        long = "cluster.advertise-address",
        help = "Address peers reach this node at (defaults to POD_IP + listen port)"
    )]
    cluster_advertise: Option<String>,

    #[arg(long = "cluster.peer", help = "Peer address, repeatable")]
    cluster_peers: Vec<String>,

    #[arg(
        long = "cluster.peer-timeout",
        default_value = "15s",
        help = "Base wait unit per peer position"
    )]
    peer_timeout: String,

    #[arg(long = "etcd.endpoints", help = "Etcd endpoints for config storage, repeatable")]
    etcd_endpoints: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match Opts::parse().cmd {
        Commands::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let retention =
        parse_duration(&args.retention).context("invalid --alertmanager.storage.retention")?;
    let poll_interval = parse_duration(&args.poll_interval)
        .context("invalid --alertmanager.configs.poll-interval")?;
    let peer_timeout =
        parse_duration(&args.peer_timeout).context("invalid --cluster.peer-timeout")?;

    let store: Arc<dyn ConfigStore> = if args.etcd_endpoints.is_empty() {
        tracing::warn!("no etcd endpoints configured, using in-memory config store");
        Arc::new(InMemStore::new())
    } else {
        Arc::new(
            EtcdStore::connect(&args.etcd_endpoints)
                .await
                .context("failed to connect to etcd")?,
        )
    };

    let peer = if args.cluster_peers.is_empty() {
        None
    } else {
        let pod_ip = std::env::var(discovery::POD_IP_ENV).ok();
        let advertise = discovery::advertise_addr(
            args.cluster_advertise.as_deref(),
            pod_ip.as_deref(),
            &args.cluster_listen,
        )?;
        tracing::info!(%advertise, peers = args.cluster_peers.len(), "cluster membership enabled");
        Some(Arc::new(StaticPeer::new(advertise, &args.cluster_peers)))
    };

    let stop = CancellationToken::new();
    let pump = ChangePump::new(store.clone(), stop.clone());
    let metrics = ManagerMetrics::new();

    let manager = Manager::new(
        ManagerConfig {
            data_dir: args.storage_path.clone(),
            retention,
            external_url: args.path_prefix.clone(),
            poll_interval,
            peer,
            peer_timeout,
        },
        pump,
        metrics.clone(),
    )
    .context("failed to create manager")?;

    let manager_task = tokio::spawn(manager.clone().run());

    let metrics_for_route = metrics.clone();
    let app = api::router(ApiState {
        store: store.clone(),
    })
    .merge(http::router(
        &args.path_prefix,
        TenantState {
            manager: manager.clone(),
        },
    ))
    .route("/healthz", get(healthz))
    .route(
        "/metrics",
        get(move || {
            let metrics = metrics_for_route.clone();
            async move { render_prometheus(&metrics) }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], args.api_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "API server starting");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await
        .context("API server failed")?;

    tracing::info!("shutting down");
    manager.shutdown();
    stop.cancel();
    manager_task.await.context("manager task panicked")?;
    Ok(())
}

#[derive(serde::Serialize)]
struct HealthResponse {
    status: String,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
    })
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

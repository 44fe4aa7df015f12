use std::sync::Arc;

use actix_files::Files;
use actix_web::{web, App, HttpServer};
use clap::Parser;
use pkci::config::PkciConfig;
use pkci::{
    api::{service::StatusService, stats_raw_route, stats_route},
    supervisor::{self, Reconciler, SupervisorState},
    worker::{self, net::RealHostNetworkEffector},
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(
    version = "0.1",
    author = "Polytech Montpellier - DevOps",
    about = "Reconciliation supervisor for per-bridge DHCP workers"
)]
pub struct PkciOpts {
    /// Config file path
    #[clap(short, long, default_value = "/etc/pkci/config.yaml")]
    config: String,

    /// Override the reconciliation poll interval, in seconds
    #[clap(long)]
    poll_interval: Option<u64>,
}

#[derive(Error, Debug)]
pub enum PkciError {
    #[error(transparent)]
    Other(#[from] anyhow::Error),
    #[error("unknown pkci error")]
    Unknown,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("starting up ...");

    let options = PkciOpts::parse();

    debug!("loading config file at {}", options.config);
    let mut config = PkciConfig::load(options.config.as_str()).unwrap_or_else(|e| {
        error!("failed to load config file {}: {}", options.config, e);
        std::process::exit(1);
    });
    if let Some(poll_interval) = options.poll_interval {
        config.api.poll_interval_secs = poll_interval;
    }
    trace!(
        "config file loaded successfully with content: {:#?}",
        config
    );

    info!("setting up");
    let state = Arc::new(Mutex::new(SupervisorState::new()));
    let reconciler = Arc::new(Mutex::new(Reconciler::new()));
    let effector: Arc<dyn worker::net::HostNetworkEffector> =
        Arc::new(RealHostNetworkEffector);

    let supervisor_reconciler = reconciler.clone();
    let supervisor_state = state.clone();
    let supervisor_config = config.clone();
    let supervisor_effector = effector.clone();
    let supervisor_task = tokio::spawn(async move {
        supervisor::run(
            supervisor_reconciler,
            supervisor_state,
            supervisor_config,
            supervisor_effector,
        )
        .await;
    });

    let status_service = web::Data::new(StatusService::new(state));

    info!("everything is set up, starting servers");

    let http_host = config.api.web_host.clone();
    let http_port = config.api.web_port;
    info!("Starting web server on {}:{}", http_host, http_port);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(status_service.clone())
            .service(stats_raw_route)
            .service(stats_route)
            .service(Files::new("/", "./static").index_file("index.html"))
    })
    .bind((http_host, http_port))
    .map_err(|e| {
        error!("failed to bind HTTP listener: {e}");
        e
    })?
    .run();

    let server_handle = server.handle();

    // §5: "Process-level shutdown must stop the poll task, then call stop()
    // on every worker." Aborting the supervisor task first guarantees no new
    // tick starts; `supervisor::shutdown` then waits for any tick already in
    // flight (via the reconciler's own lock) before tearing workers down.
    tokio::select! {
        result = server => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, stopping reconciliation loop");
            supervisor_task.abort();
            supervisor::shutdown(&reconciler, effector.as_ref()).await;
            info!("all workers torn down, stopping HTTP server");
            server_handle.stop(true).await;
            Ok(())
        }
    }
}

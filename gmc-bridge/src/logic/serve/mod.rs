pub mod api;
pub mod error;
pub mod ingest;
pub mod presence;
pub mod publisher;
pub mod rate_limit;

use crate::logic::config::BridgeConfig;
use crate::logic::serve::api::api_routes;
use crate::logic::serve::ingest::{IngestHandler, MAX_PARAMETERS};
use crate::logic::serve::presence::{run_sweeper, PresenceTracker};
use crate::logic::serve::publisher::{connect, Publisher};
use crate::logic::serve::rate_limit::{TokenBucket, DEFAULT_BURST, DEFAULT_RATE};
use crate::logic::validation::KNOWN_PARAMETERS;
use colored::*;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// How long in-flight requests get to finish once shutdown is signalled
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run(host: String, port: u16, config: BridgeConfig) -> anyhow::Result<()> {
    // 1) Refuse to start on a bad broker scheme or base topic
    config.validate()?;

    // 2) Connect to the broker; failing here is fatal
    let (publisher, connection) = connect(&config).await?;
    let publisher: Arc<dyn Publisher> = Arc::new(publisher);

    // 3) Presence tracking, rate limiting and the report handler
    let tracker = Arc::new(PresenceTracker::new(
        publisher.clone(),
        config.topic.clone(),
        config.offline_threshold(),
    ));
    let limiter = Arc::new(TokenBucket::default());
    let handler = Arc::new(IngestHandler::new(
        tracker.clone(),
        publisher,
        limiter,
        config.topic.clone(),
    ));

    // 4) Shutdown signal shared by the server and the sweeper
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received, shutting down gracefully...");
        let _ = shutdown_tx.send(true);
    });

    let sweeper = tokio::spawn(run_sweeper(
        tracker.clone(),
        config.check_frequency(),
        shutdown_rx.clone(),
    ));

    // 5) Serve until the signal flips
    let ip: IpAddr = host.parse()?;
    let mut server_shutdown = shutdown_rx.clone();
    let (addr, server) = warp::serve(api_routes(handler)).try_bind_with_graceful_shutdown(
        (ip, port),
        async move {
            stopped(&mut server_shutdown).await;
        },
    )?;

    print_banner(&addr.to_string(), &config);
    info!(%addr, broker = %config.broker, topic = %config.topic, "starting HTTP server");
    if !serve_until_drained(server, shutdown_rx, SHUTDOWN_TIMEOUT).await {
        warn!(timeout = ?SHUTDOWN_TIMEOUT, "connections still open at shutdown, closing them");
    }

    if let Err(e) = sweeper.await {
        error!(error = %e, "presence sweeper task failed");
    }
    let devices = tracker.snapshot().await;
    let online = devices.iter().filter(|d| d.online).count();
    info!(tracked = devices.len(), online, "presence state discarded");

    connection.shutdown().await;
    info!("server stopped");
    Ok(())
}

/// Drive `server` to completion, allowing it at most `deadline` once
/// `shutdown` flips. Returns false if the deadline cut it off.
async fn serve_until_drained<F>(
    server: F,
    mut shutdown: watch::Receiver<bool>,
    deadline: Duration,
) -> bool
where
    F: Future<Output = ()>,
{
    tokio::pin!(server);
    tokio::select! {
        _ = &mut server => return true,
        _ = stopped(&mut shutdown) => {}
    }
    tokio::time::timeout(deadline, server).await.is_ok()
}

/// Resolves once `shutdown` reads true or its sender is gone
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn print_banner(addr: &str, config: &BridgeConfig) {
    println!(
        "{} listening on {}",
        "gmc-bridge".green().bold(),
        format!("http://{}", addr).cyan()
    );
    println!("  {} {} (topic {})", "mqtt:".bold(), config.broker, config.topic);
    println!(
        "  {} {} req/sec (burst {}), max {} params, allowed keys: {}",
        "security:".bold(),
        DEFAULT_RATE,
        DEFAULT_BURST,
        MAX_PARAMETERS,
        KNOWN_PARAMETERS.join(", ")
    );
    println!(
        "  {} GID/AID=alphanumeric (max 50 chars), CPM=integer, ACPM/uSV=decimal",
        "parameters:".bold()
    );
    println!(
        "  {} devices marked offline after {} min of inactivity, checked every {} min",
        "monitoring:".bold(),
        config.offline_threshold_minutes.to_string().yellow(),
        config.check_frequency_minutes.to_string().yellow()
    );
}

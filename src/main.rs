use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use horizon::auth::AccessControl;
use horizon::clock::SystemClock;
use horizon::cluster::StaticClusterResources;
use horizon::config::ServerConfig;
use horizon::engine::ReservationSystem;
use horizon::notify::NotifyHub;
use horizon::{follower, snapshot, wire};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env();
    horizon::observability::init(config.metrics_port)?;

    let system = Arc::new(ReservationSystem::new(
        Arc::new(StaticClusterResources::new(config.cluster)),
        AccessControl::new(config.acl_enabled),
        Arc::new(SystemClock),
        Arc::new(NotifyHub::new()),
    ));

    // Saved plans first, then the configured queues on top of them
    if let Some(path) = &config.snapshot_path {
        let plans = snapshot::load(path)?;
        if !plans.is_empty() {
            system.restore(plans).await?;
        }
    }
    let outcome = system.reinitialize(&config.queues()?).await?;
    for (queue, e) in &outcome.refused {
        tracing::warn!("queue {queue} kept previous settings: {e}");
    }

    let step = Duration::from_millis(config.step_ms.max(1));
    let follower_handle = tokio::spawn(follower::run_plan_follower(system.clone(), step));

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("horizon listening on {addr}");
    info!("  queues: {}", system.registry().queues().join(", "));
    info!("  cluster: {}", config.cluster);
    info!("  acl: {}", if config.acl_enabled { "enabled" } else { "disabled" });
    info!("  max_connections: {max_connections}");
    info!("  plan step: {}ms", step.as_millis());
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("SIGTERM handler unavailable: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(horizon::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(horizon::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(horizon::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let system = system.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, system).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(horizon::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    follower_handle.abort();
    if let Some(path) = &config.snapshot_path {
        let plans = system.snapshot().await;
        snapshot::save(path, &plans)?;
        info!("saved {} plans to {}", plans.len(), path.display());
    }

    info!("horizon stopped");
    Ok(())
}

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::try_join;
use tracing::info;

use crate::cluster::ClusterObserver;
use crate::config::RemedyConfig;
use crate::controller::{ControllerContext, Scheduler};
use crate::web::run_http_server;

/// Compute the HTTP bind address based on config.
pub fn compute_http_addr(cfg: &RemedyConfig) -> SocketAddr {
    ([0, 0, 0, 0], cfg.http_port).into()
}

/// Start the control loop and the liveness endpoint, wire termination
/// signals to graceful shutdown, and wait until both services settle.
pub async fn run_all(
    observer: Arc<dyn ClusterObserver>,
    cfg: RemedyConfig,
) -> anyhow::Result<()> {
    let addr = compute_http_addr(&cfg);
    let workers = cfg.workers;
    let ctx = Arc::new(ControllerContext::new(observer, cfg));
    let scheduler = Scheduler::new(ctx);

    let signal_sched = scheduler.clone();
    tokio::spawn(async move {
        if wait_for_shutdown().await.is_ok() {
            info!("shutdown signal received");
        }
        signal_sched.stop();
    });

    let controller = {
        let sched = scheduler.clone();
        tokio::spawn(async move { sched.start(workers).await })
    };
    let http = tokio::spawn(run_http_server(addr, scheduler.shutdown_token()));

    let (c_res, h_res) = try_join!(controller, http)?;
    c_res?;
    h_res?;
    Ok(())
}

async fn wait_for_shutdown() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

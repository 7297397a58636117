use crate::mqtt_service::ConnectionPool;
use crate::reconciler::Reconciler;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

/// Refresh settings now and then every `period`.
pub fn start_reconciler(reconciler: Arc<Reconciler>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if reconciler.refresh().await.is_err() {
                warn!("Next settings refresh in {:?}", period);
            }
        }
    })
}

/// Wait for Ctrl-C, then stop reconciling and close every broker connection.
pub async fn handle_shutdown(pool: Arc<ConnectionPool>, reconciler_task: JoinHandle<()>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
    }

    info!("Relay is shutting down...");
    reconciler_task.abort();
    pool.close_all().await;
}

use super::*;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Drive `cluster` one tick per period until cancelled.
///
/// Cancellation is only observed between ticks so that an in-flight
/// transition completes. The lease is released on exit.
pub fn new(mut cluster: Cluster, cancel: CancellationToken) -> JoinHandle<()> {
    let fut = async move {
        let mut interval = tokio::time::interval(cluster.config().tick());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("cluster {} worker started", cluster.name());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => cluster.tick().await,
            }
        }
        cluster.shutdown().await;
    };
    tokio::spawn(fut)
}

use super::*;

/// Publishes the heartbeat of one cluster unless it is frozen.
pub struct Thread {
    shared: Arc<ClusterShared>,
    arbitrator: Arc<Arbitrator>,
    interval: Duration,
}

impl Thread {
    async fn run_once(&self) -> Result<()> {
        let obs = self
            .shared
            .observation()
            .context("cluster is frozen")?;
        self.arbitrator.publish_heartbeat(&obs).await;
        Ok(())
    }

    fn do_loop(self) -> ThreadHandle {
        let fut = async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                interval.tick().await;
                self.run_once().await.ok();
            }
        };
        let hdl = tokio::spawn(fut).abort_handle();
        ThreadHandle(hdl)
    }
}

pub fn new(shared: Arc<ClusterShared>, arbitrator: Arc<Arbitrator>, interval: Duration) -> ThreadHandle {
    Thread {
        shared,
        arbitrator,
        interval,
    }
    .do_loop()
}

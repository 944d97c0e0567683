use super::*;

/// Injects a fresh pseudo-GTID token on the primary at a fixed interval.
pub struct Thread {
    shared: Arc<ClusterShared>,
    connector: Arc<dyn Connector>,
    interval: Duration,
}

impl Thread {
    async fn run_once(&self) -> Result<()> {
        let status = self.shared.status();
        ensure!(status.state == ClusterState::Monitor);
        let primary = status.elected_primary.context("no primary")?;
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.connector
            .connect(&primary)
            .inject_pseudo_gtid(&token)
            .await
            .with_context(|| format!("pseudo-GTID injection on {primary}"))?;
        debug!("cluster {} pseudo-GTID {token} on {primary}", status.name);
        Ok(())
    }

    fn do_loop(self) -> ThreadHandle {
        let fut = async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                interval.tick().await;
                if let Err(e) = self.run_once().await {
                    debug!("cluster {} pseudo-GTID skipped: {e:#}", self.shared.name());
                }
            }
        };
        let hdl = tokio::spawn(fut).abort_handle();
        ThreadHandle(hdl)
    }
}

pub fn new(shared: Arc<ClusterShared>, connector: Arc<dyn Connector>, interval: Duration) -> ThreadHandle {
    Thread {
        shared,
        connector,
        interval,
    }
    .do_loop()
}

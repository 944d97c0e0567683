use super::*;

use crate::arbitration::{
    ArbitrationStore, Arbitrator, Member, MysqlArbitrationStore, RedbArbitrationStore,
};
use crate::bus::{Bus, Counters, LogObserver, MetricsObserver, RouteObserver, Routes, Watch};
use crate::cluster::{thread, Cluster, ClusterShared, ClusterStatus, Deps, SwitchoverTicket};
use crate::config::{ArbitrationBackend, ClusterConfig, ManagerConfig};
use crate::journal::{CrashRecord, Journal};
use crate::replication::{Connector, SqlConnector};
use crate::thread::ThreadHandle;
use std::collections::BTreeMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Opens the instances of one cluster.
pub type ConnectorFactory = Arc<dyn Fn(&ClusterConfig) -> Arc<dyn Connector> + Send + Sync>;

/// Status of a cluster with its counters.
#[derive(Clone, Debug, Serialize)]
pub struct StatusReport {
    pub status: ClusterStatus,
    pub counters: Counters,
    pub dropped_events: u64,
}

struct ClusterHandle {
    shared: Arc<ClusterShared>,
    journal: Arc<Journal>,
    _threads: Vec<ThreadHandle>,
}

/// `Manager` runs one worker per configured cluster.
pub struct Manager {
    uid: u32,
    uuid: String,
    bus: Arc<Bus>,
    metrics: Arc<MetricsObserver>,
    store: Arc<dyn ArbitrationStore>,
    clusters: BTreeMap<String, ClusterHandle>,
    cancel: CancellationToken,
    workers: spin::Mutex<Vec<JoinHandle<()>>>,
}

/// Open the arbitration store named by the configuration.
pub async fn open_store(config: &ManagerConfig) -> Result<Arc<dyn ArbitrationStore>> {
    let fresh = config.manager.fresh_window();
    let store: Arc<dyn ArbitrationStore> = match &config.manager.arbitration {
        ArbitrationBackend::Disabled => Arc::new(RedbArbitrationStore::in_memory(fresh)?),
        ArbitrationBackend::Embedded { path } => {
            Arc::new(RedbArbitrationStore::open(path, fresh)?)
        }
        ArbitrationBackend::Mysql { url } => {
            let store = MysqlArbitrationStore::connect(url, fresh)?;
            store.init().await?;
            Arc::new(store)
        }
    };
    Ok(store)
}

fn sql_connector(c: &ClusterConfig) -> Arc<dyn Connector> {
    Arc::new(SqlConnector::new(
        &c.user,
        &c.password,
        c.ping_timeout(),
        c.channels(),
    ))
}

impl Manager {
    /// Start against real servers.
    pub async fn start(config: ManagerConfig) -> Result<Self> {
        let store = open_store(&config).await?;
        Self::start_with(config, store, Arc::new(sql_connector), None).await
    }

    /// Start with the given store and connectors. Primary changes are also
    /// sent to `router` when given.
    pub async fn start_with(
        config: ManagerConfig,
        store: Arc<dyn ArbitrationStore>,
        connectors: ConnectorFactory,
        router: Option<Arc<dyn RouteObserver>>,
    ) -> Result<Self> {
        config.validate()?;
        let m = &config.manager;
        let uuid = uuid::Uuid::new_v4().to_string();
        info!("manager {} ({uuid}) starting {} clusters", m.uid, config.clusters.len());

        let bus = Arc::new(Bus::new(m.bus_capacity));
        let metrics = Arc::new(MetricsObserver::default());
        bus.subscribe(Arc::new(LogObserver));
        bus.subscribe(metrics.clone());
        if let Some(router) = router {
            bus.subscribe(Arc::new(Routes(router)));
        }

        let cancel = CancellationToken::new();
        let mut clusters = BTreeMap::new();
        let mut workers = vec![];
        for cc in &config.clusters {
            let connector = connectors(cc);
            let arbitrator = Arc::new(Arbitrator::new(
                store.clone(),
                Member {
                    secret: m.secret.clone(),
                    cluster: cc.name.clone(),
                    uid: m.uid,
                    uuid: uuid.clone(),
                },
            ));
            let journal =
                Arc::new(Journal::open(&m.crash_dir, &cc.name, m.crash_retention).await?);
            let cluster = Cluster::new(
                cc.clone(),
                Deps {
                    connector: connector.clone(),
                    arbitrator: arbitrator.clone(),
                    journal: journal.clone(),
                    bus: bus.clone(),
                },
            );
            let shared = cluster.shared();

            let mut threads = vec![thread::heartbeat::new(
                shared.clone(),
                arbitrator,
                m.heartbeat_interval(),
            )];
            if cc.pseudo_gtid_interval_secs > 0 {
                threads.push(thread::pseudo_gtid::new(
                    shared.clone(),
                    connector,
                    Duration::from_secs(cc.pseudo_gtid_interval_secs),
                ));
            }
            workers.push(thread::tick::new(cluster, cancel.child_token()));
            clusters.insert(
                cc.name.clone(),
                ClusterHandle {
                    shared,
                    journal,
                    _threads: threads,
                },
            );
        }

        Ok(Self {
            uid: m.uid,
            uuid,
            bus,
            metrics,
            store,
            clusters,
            cancel,
            workers: spin::Mutex::new(workers),
        })
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn bus(&self) -> Arc<Bus> {
        self.bus.clone()
    }

    pub fn cluster_names(&self) -> Vec<String> {
        self.clusters.keys().cloned().collect()
    }

    fn cluster(&self, name: &str) -> Result<&ClusterHandle> {
        self.clusters
            .get(name)
            .ok_or_else(|| Error::ClusterNotFound(name.to_owned()).into())
    }

    pub fn status(&self, name: &str) -> Result<StatusReport> {
        let c = self.cluster(name)?;
        Ok(StatusReport {
            status: c.shared.status(),
            counters: self.metrics.snapshot(name),
            dropped_events: self.bus.dropped(),
        })
    }

    /// Queue a switchover and return its completion.
    ///
    /// Fails at once if the cluster is frozen or another switchover is
    /// pending.
    pub fn switchover(&self, name: &str, preferred: Option<Endpoint>) -> Result<SwitchoverTicket> {
        let c = self.cluster(name)?;
        let state = c.shared.status().state;
        ensure!(
            state != crate::cluster::ClusterState::Frozen,
            Error::Operator(format!("cluster {name} is frozen"))
        );
        info!("cluster {name} switchover requested (preferred {preferred:?})");
        c.shared.switchover(preferred)
    }

    pub fn freeze(&self, name: &str) -> Result<()> {
        self.cluster(name)?.shared.freeze();
        Ok(())
    }

    pub fn unfreeze(&self, name: &str) -> Result<()> {
        self.cluster(name)?.shared.unfreeze();
        Ok(())
    }

    /// Delete every heartbeat row of `secret`.
    pub async fn forget_arbitration(&self, secret: &str) -> Result<u64> {
        let n = self.store.forget(secret).await?;
        warn!("forgot {n} arbitration rows");
        Ok(n)
    }

    pub async fn crash_records(&self, name: &str) -> Result<Vec<(String, CrashRecord)>> {
        self.cluster(name)?.journal.list().await
    }

    pub fn watch(&self) -> Watch {
        self.bus.watch()
    }

    /// Stop every worker after its current tick and release the leases.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for w in workers {
            if let Err(e) = w.await {
                error!("cluster worker failed: {e}");
            }
        }
        info!("manager {} stopped", self.uid);
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

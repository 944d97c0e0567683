use anyhow::Result;
use repman::arbitration::{
    ArbitrationStore, Arbitrator, HeartbeatRow, Member, Observation, RedbArbitrationStore,
};
use repman::bus::{Bus, Event, MetricsObserver, RecordingRouter, Routes, Watch};
use repman::cluster::{Cluster, ClusterStatus, Deps};
use repman::config::ClusterConfig;
use repman::journal::{CrashRecord, Journal};
use repman::replication::{Connector, Instance};
use repman::Endpoint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

pub use sim::{Flavor, SimInstance, World, BINLOG};

static INIT: Once = Once::new();

const SECRET: &str = "repman-test";
const CLUSTER: &str = "c1";

/// Arbitration store that can be switched off.
pub struct FaultyStore {
    inner: Arc<dyn ArbitrationStore>,
    down: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn ArbitrationStore>) -> Self {
        Self {
            inner,
            down: AtomicBool::new(false),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        anyhow::ensure!(
            !self.down.load(Ordering::SeqCst),
            repman::Error::Connection("arbitration store is down".to_owned())
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl ArbitrationStore for FaultyStore {
    async fn publish_heartbeat(&self, me: &Member, obs: &Observation) -> Result<()> {
        self.check()?;
        self.inner.publish_heartbeat(me, obs).await
    }

    async fn request_election(&self, me: &Member, obs: &Observation) -> Result<bool> {
        self.check()?;
        self.inner.request_election(me, obs).await
    }

    async fn release(&self, me: &Member) -> Result<()> {
        self.check()?;
        self.inner.release(me).await
    }

    async fn rows(&self, secret: &str, cluster: &str) -> Result<Vec<HeartbeatRow>> {
        self.check()?;
        self.inner.rows(secret, cluster).await
    }

    async fn forget(&self, secret: &str) -> Result<u64> {
        self.check()?;
        self.inner.forget(secret).await
    }
}

/// Shared pieces of one test: a simulated world and the stores managers
/// write to.
pub struct Env {
    pub world: World,
    pub bus: Arc<Bus>,
    pub store: Arc<FaultyStore>,
    pub metrics: Arc<MetricsObserver>,
    pub router: Arc<RecordingRouter>,
    dir: tempfile::TempDir,
}

impl Env {
    pub fn new(world: World, with_logging: bool) -> Result<Self> {
        INIT.call_once(|| {
            if with_logging {
                let format = tracing_subscriber::fmt::format()
                    .with_target(false)
                    .with_thread_names(true)
                    .compact();
                tracing_subscriber::fmt()
                    .event_format(format)
                    .try_init()
                    .ok();
            }
        });
        let bus = Arc::new(Bus::new(4096));
        let metrics = Arc::new(MetricsObserver::default());
        let router = Arc::new(RecordingRouter::default());
        bus.subscribe(metrics.clone());
        bus.subscribe(Arc::new(Routes(router.clone())));
        let redb = RedbArbitrationStore::in_memory(Duration::from_secs(10))?;
        Ok(Self {
            world,
            bus,
            store: Arc::new(FaultyStore::new(Arc::new(redb))),
            metrics,
            router,
            dir: tempfile::tempdir()?,
        })
    }

    pub fn crash_dir(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Cluster config over every server of the world with timers fit for
    /// tick-driven tests.
    pub fn config(&self) -> ClusterConfig {
        let mut c = ClusterConfig::new(CLUSTER, self.world.endpoints());
        c.tick_ms = 100;
        c.ping_timeout_ms = 500;
        c.n_suspect = 2;
        c.n_failover = 1;
        c.cooldown_secs = 0;
        c.catchup_secs = 2;
        c.failover_max_secs = 30;
        c.relay_apply_secs = 2;
        c
    }

    pub fn arbitrator(&self, uid: u32) -> Arc<Arbitrator> {
        Arc::new(Arbitrator::new(
            self.store.clone(),
            Member {
                secret: SECRET.to_owned(),
                cluster: CLUSTER.to_owned(),
                uid,
                uuid: format!("manager-{uid}"),
            },
        ))
    }

    pub async fn journal(&self) -> Result<Arc<Journal>> {
        Ok(Arc::new(Journal::open(self.dir.path(), CLUSTER, 5).await?))
    }

    /// A manager of the world identified by `uid`.
    pub async fn manager(&self, uid: u32, config: ClusterConfig) -> Result<Cluster> {
        let connector: Arc<dyn Connector> = Arc::new(self.world.clone());
        let deps = Deps {
            connector,
            arbitrator: self.arbitrator(uid),
            journal: self.journal().await?,
            bus: self.bus.clone(),
        };
        Ok(Cluster::new(config, deps))
    }

    pub fn instance(&self, ep: &Endpoint) -> Arc<dyn Instance> {
        self.world.connect(ep)
    }

    pub async fn crash_records(&self) -> Result<Vec<CrashRecord>> {
        let recs = self.journal().await?.list().await?;
        Ok(recs.into_iter().map(|(_, r)| r).collect())
    }

    pub fn watch(&self) -> Watch {
        self.bus.watch()
    }
}

/// Tick `c` `n` times.
pub async fn ticks(c: &mut Cluster, n: usize) {
    for _ in 0..n {
        c.tick().await;
    }
}

/// Tick until `f` holds on the status, at most `max` times.
pub async fn tick_until(
    c: &mut Cluster,
    max: usize,
    f: impl Fn(&ClusterStatus) -> bool,
) -> Result<ClusterStatus> {
    for _ in 0..max {
        c.tick().await;
        let st = c.shared().status();
        if f(&st) {
            return Ok(st);
        }
    }
    anyhow::bail!(
        "condition not met after {max} ticks: {:?}",
        c.shared().status()
    )
}

/// Drain what a watch has queued.
pub async fn drain(w: &Watch) -> Vec<Event> {
    let mut out = vec![];
    loop {
        let xs = w.next_batch(Duration::from_millis(50)).await;
        if xs.is_empty() {
            return out;
        }
        out.extend(xs);
    }
}

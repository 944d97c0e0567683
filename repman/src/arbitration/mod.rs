use super::*;

mod mysql;
mod embedded;
pub use self::mysql::MysqlArbitrationStore;
pub use self::embedded::RedbArbitrationStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// `U`
    Unknown,
    /// `E`
    Elected,
}

impl Status {
    pub fn as_char(&self) -> char {
        match self {
            Self::Unknown => 'U',
            Self::Elected => 'E',
        }
    }

    pub fn from_char(c: &str) -> Self {
        if c.eq_ignore_ascii_case("E") {
            Self::Elected
        } else {
            Self::Unknown
        }
    }
}

/// One row of the `heartbeat` table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRow {
    pub secret: String,
    pub cluster: String,
    pub uid: u32,
    pub uuid: String,
    /// Primary endpoint seen by the writer. Empty when unknown.
    pub primary: String,
    /// Unix millis.
    pub date: u64,
    /// Unix millis.
    pub arbitration_date: u64,
    pub status: Status,
    pub hosts: u32,
    pub failed: u32,
}

/// Identity of this manager in one cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub secret: String,
    pub cluster: String,
    pub uid: u32,
    pub uuid: String,
}

/// What this manager currently sees of a cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Observation {
    pub hosts_seen: u32,
    pub hosts_failed: u32,
    pub primary: Option<Endpoint>,
}

impl Observation {
    fn primary_str(&self) -> String {
        self.primary
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_default()
    }

    fn row(&self, me: &Member, status: Status, now: u64, arbitration_date: u64) -> HeartbeatRow {
        HeartbeatRow {
            secret: me.secret.clone(),
            cluster: me.cluster.clone(),
            uid: me.uid,
            uuid: me.uuid.clone(),
            primary: self.primary_str(),
            date: now,
            arbitration_date,
            status,
            hosts: self.hosts_seen,
            failed: self.hosts_failed,
        }
    }
}

/// Serial store of heartbeat rows.
///
/// Implementations run each operation in one transaction of at least
/// read-committed isolation.
#[async_trait::async_trait]
pub trait ArbitrationStore: Send + Sync + 'static {
    /// Upsert our row. Clears every election when the fresh rows agree on
    /// exactly one primary.
    async fn publish_heartbeat(&self, me: &Member, obs: &Observation) -> Result<()>;

    /// Returns true if this member is now elected.
    async fn request_election(&self, me: &Member, obs: &Observation) -> Result<bool>;

    /// Set our row back to `U`.
    async fn release(&self, me: &Member) -> Result<()>;

    async fn rows(&self, secret: &str, cluster: &str) -> Result<Vec<HeartbeatRow>>;

    /// Delete every row of `secret`.
    async fn forget(&self, secret: &str) -> Result<u64>;
}

/// Decisions shared by stores that evaluate the protocol in memory.
pub(crate) mod protocol {
    use super::*;

    /// True when fresh rows name exactly one distinct primary.
    pub fn converged(rows: &[HeartbeatRow], now: u64, fresh: Duration) -> bool {
        let since = now.saturating_sub(fresh.as_millis() as u64);
        let mut primaries: Vec<&str> = rows
            .iter()
            .filter(|r| r.date >= since)
            .map(|r| r.primary.as_str())
            .collect();
        primaries.sort();
        primaries.dedup();
        primaries.len() == 1
    }

    /// Reason to refuse an election, if any.
    pub fn refusal(rows: &[HeartbeatRow], me: &Member, obs: &Observation) -> Option<String> {
        let peers = || rows.iter().filter(|r| r.uid != me.uid);
        if let Some(r) = peers().find(|r| r.status == Status::Elected) {
            return Some(format!("manager {} is elected", r.uid));
        }
        if let Some(r) = peers().find(|r| r.status == Status::Unknown && r.failed < obs.hosts_failed) {
            return Some(format!(
                "manager {} sees fewer failed hosts ({} < {})",
                r.uid, r.failed, obs.hosts_failed
            ));
        }
        None
    }
}

/// Client of the arbitration store for one cluster.
pub struct Arbitrator {
    store: Arc<dyn ArbitrationStore>,
    me: Member,
}

impl Arbitrator {
    pub fn new(store: Arc<dyn ArbitrationStore>, me: Member) -> Self {
        Self { store, me }
    }

    pub fn member(&self) -> &Member {
        &self.me
    }

    /// Write errors are logged and ignored.
    pub async fn publish_heartbeat(&self, obs: &Observation) {
        if let Err(e) = self.store.publish_heartbeat(&self.me, obs).await {
            warn!("cluster {} heartbeat failed: {e:#}", self.me.cluster);
        }
    }

    /// Ok only when granted. A refusal or an unreachable store is
    /// `ElectionInconclusive`.
    pub async fn request_election(&self, obs: &Observation) -> Result<()> {
        match self.store.request_election(&self.me, obs).await {
            Ok(true) => Ok(()),
            Ok(false) => bail!(Error::ElectionInconclusive("refused".to_owned())),
            Err(e) => bail!(Error::ElectionInconclusive(format!("{e:#}"))),
        }
    }

    /// Best effort.
    pub async fn release(&self) {
        match self.store.release(&self.me).await {
            Ok(()) => info!("cluster {} lease released", self.me.cluster),
            Err(e) => warn!("cluster {} failed to release lease: {e:#}", self.me.cluster),
        }
    }

    /// Uid of the elected manager.
    pub async fn lease_holder(&self) -> Result<Option<u32>> {
        let rows = self.store.rows(&self.me.secret, &self.me.cluster).await?;
        Ok(rows
            .iter()
            .find(|r| r.status == Status::Elected)
            .map(|r| r.uid))
    }

    /// Primary endpoint written by the elected manager.
    pub async fn whoami_primary(&self) -> Result<Option<Endpoint>> {
        let rows = self.store.rows(&self.me.secret, &self.me.cluster).await?;
        let Some(row) = rows.iter().find(|r| r.status == Status::Elected) else {
            return Ok(None);
        };
        if row.primary.is_empty() {
            return Ok(None);
        }
        Ok(Some(row.primary.parse()?))
    }
}

use super::*;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Top-level configuration file.
///
/// ```toml
/// [manager]
/// uid = 1
/// secret = "prod"
///
/// [manager.arbitration]
/// backend = "embedded"
/// path = "/var/lib/repman/arbitration.redb"
///
/// [[cluster]]
/// name = "orders"
/// servers = [{ endpoint = "db1:3306" }, { endpoint = "db2:3306", rank = -1 }]
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerConfig {
    #[serde(default)]
    pub manager: ManagerSection,
    #[serde(default, rename = "cluster")]
    pub clusters: Vec<ClusterConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerSection {
    /// Stable identifier of this manager process in the heartbeat table.
    #[serde(default = "default_uid")]
    pub uid: u32,
    /// Shared by every manager arbitrating the same clusters.
    #[serde(default = "default_secret")]
    pub secret: String,
    #[serde(default = "default_crash_dir")]
    pub crash_dir: PathBuf,
    #[serde(default = "default_crash_retention")]
    pub crash_retention: usize,
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,
    #[serde(default)]
    pub arbitration: ArbitrationBackend,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_fresh_secs")]
    pub fresh_secs: u64,
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            uid: default_uid(),
            secret: default_secret(),
            crash_dir: default_crash_dir(),
            crash_retention: default_crash_retention(),
            admin_addr: default_admin_addr(),
            arbitration: ArbitrationBackend::default(),
            heartbeat_ms: default_heartbeat_ms(),
            fresh_secs: default_fresh_secs(),
            bus_capacity: default_bus_capacity(),
        }
    }
}

impl ManagerSection {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn fresh_window(&self) -> Duration {
        Duration::from_secs(self.fresh_secs)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "backend", rename_all = "snake_case", deny_unknown_fields)]
pub enum ArbitrationBackend {
    /// The manager is alone and always holds the lease.
    #[default]
    Disabled,
    /// A redb file shared by managers on the same host.
    Embedded { path: PathBuf },
    /// A small MariaDB/MySQL instance reachable by every manager.
    Mysql { url: String },
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailoverMode {
    #[default]
    Automatic,
    /// Only operator switchovers change the primary.
    Manual,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub endpoint: Endpoint,
    /// Lower wins ties during candidate selection.
    #[serde(default)]
    pub rank: i32,
    /// Never elected.
    #[serde(default)]
    pub ignored: bool,
}

/// Settings enforced on every reachable server of a cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DurabilityConfig {
    #[serde(default)]
    pub sync_binlog: bool,
    #[serde(default)]
    pub sync_innodb: bool,
    #[serde(default)]
    pub binlog_checksum: bool,
    #[serde(default)]
    pub binlog_compress: bool,
    #[serde(default)]
    pub binlog_format: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub name: String,
    pub servers: Vec<ServerConfig>,

    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_user")]
    pub replication_user: String,
    #[serde(default)]
    pub replication_password: String,
    /// Replication channel managed in this cluster. Empty is the default connection.
    #[serde(default)]
    pub channel: String,
    /// Extra channels inspected on MySQL replicas.
    #[serde(default)]
    pub extra_channels: Vec<String>,
    #[serde(default)]
    pub ssl: bool,

    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_n_suspect")]
    pub n_suspect: u32,
    #[serde(default = "default_n_failover")]
    pub n_failover: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_catchup_secs")]
    pub catchup_secs: u64,
    #[serde(default = "default_failover_max_secs")]
    pub failover_max_secs: u64,
    #[serde(default = "default_longwrite_secs")]
    pub longwrite_secs: u64,
    #[serde(default = "default_relay_apply_secs")]
    pub relay_apply_secs: u64,
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,
    #[serde(default = "default_connect_retry_secs")]
    pub connect_retry_secs: u32,
    #[serde(default = "default_heartbeat_period_secs")]
    pub heartbeat_period_secs: u32,

    #[serde(default)]
    pub failover_mode: FailoverMode,
    /// Automatic failovers allowed in the lifetime of the manager. 0 is unlimited.
    #[serde(default)]
    pub failover_limit: u32,
    #[serde(default = "default_true")]
    pub false_positive_check: bool,
    /// Candidates lagging more are skipped. 0 is unlimited.
    #[serde(default)]
    pub max_delay_secs: u64,
    #[serde(default)]
    pub require_semisync_failover: bool,
    #[serde(default = "default_true")]
    pub read_only_replicas: bool,
    #[serde(default)]
    pub move_event_scheduler: bool,
    #[serde(default = "default_true")]
    pub switchover_flush_tables: bool,
    /// Replicas may replicate through another replica.
    #[serde(default)]
    pub relay_topology: bool,
    /// Interval of pseudo-GTID token injection on the primary. 0 disables it.
    #[serde(default)]
    pub pseudo_gtid_interval_secs: u64,
    #[serde(default)]
    pub pre_failover_script: Option<PathBuf>,
    #[serde(default)]
    pub post_failover_script: Option<PathBuf>,
    #[serde(default)]
    pub force: DurabilityConfig,
}

impl ClusterConfig {
    /// A cluster with default timers.
    pub fn new(name: impl Into<String>, servers: Vec<Endpoint>) -> Self {
        Self {
            name: name.into(),
            servers: servers
                .into_iter()
                .map(|endpoint| ServerConfig {
                    endpoint,
                    rank: 0,
                    ignored: false,
                })
                .collect(),
            user: default_user(),
            password: String::new(),
            replication_user: default_user(),
            replication_password: String::new(),
            channel: String::new(),
            extra_channels: vec![],
            ssl: false,
            tick_ms: default_tick_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            n_suspect: default_n_suspect(),
            n_failover: default_n_failover(),
            cooldown_secs: default_cooldown_secs(),
            catchup_secs: default_catchup_secs(),
            failover_max_secs: default_failover_max_secs(),
            longwrite_secs: default_longwrite_secs(),
            relay_apply_secs: default_relay_apply_secs(),
            probe_concurrency: default_probe_concurrency(),
            connect_retry_secs: default_connect_retry_secs(),
            heartbeat_period_secs: default_heartbeat_period_secs(),
            failover_mode: FailoverMode::default(),
            failover_limit: 0,
            false_positive_check: true,
            max_delay_secs: 0,
            require_semisync_failover: false,
            read_only_replicas: true,
            move_event_scheduler: false,
            switchover_flush_tables: true,
            relay_topology: false,
            pseudo_gtid_interval_secs: 0,
            pre_failover_script: None,
            post_failover_script: None,
            force: DurabilityConfig::default(),
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn catchup_timeout(&self) -> Duration {
        Duration::from_secs(self.catchup_secs)
    }

    pub fn failover_max(&self) -> Duration {
        Duration::from_secs(self.failover_max_secs)
    }

    pub fn longwrite_threshold(&self) -> Duration {
        Duration::from_secs(self.longwrite_secs)
    }

    pub fn relay_apply_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_apply_secs)
    }

    pub fn server(&self, endpoint: &Endpoint) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| &s.endpoint == endpoint)
    }

    /// Channels inspected on a MySQL replica.
    pub fn channels(&self) -> Vec<String> {
        let mut out = vec![self.channel.clone()];
        for ch in &self.extra_channels {
            if !out.contains(ch) {
                out.push(ch.clone());
            }
        }
        out
    }

    fn validate(&self) -> Result<()> {
        ensure!(!self.name.is_empty(), "cluster name is empty");
        ensure!(
            !self.servers.is_empty(),
            "cluster {} has no servers",
            self.name
        );
        ensure!(self.tick_ms > 0, "cluster {}: tick_ms is zero", self.name);
        ensure!(
            self.n_suspect > 0 && self.n_failover > 0,
            "cluster {}: n_suspect and n_failover must be positive",
            self.name
        );
        ensure!(
            self.probe_concurrency > 0,
            "cluster {}: probe_concurrency is zero",
            self.name
        );
        let mut seen = HashSet::new();
        for s in &self.servers {
            ensure!(
                seen.insert(&s.endpoint),
                "cluster {}: duplicate server {}",
                self.name,
                s.endpoint
            );
        }
        Ok(())
    }
}

impl ManagerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&s)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.manager.secret.is_empty(), "secret is empty");
        ensure!(self.manager.heartbeat_ms > 0, "heartbeat_ms is zero");
        ensure!(self.manager.bus_capacity > 0, "bus_capacity is zero");
        let mut names = HashSet::new();
        for c in &self.clusters {
            c.validate()?;
            ensure!(names.insert(&c.name), "duplicate cluster {}", c.name);
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn default_uid() -> u32 {
    1
}
fn default_secret() -> String {
    "repman".to_owned()
}
fn default_crash_dir() -> PathBuf {
    PathBuf::from("crash")
}
fn default_crash_retention() -> usize {
    5
}
fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 10005))
}
fn default_heartbeat_ms() -> u64 {
    2000
}
fn default_fresh_secs() -> u64 {
    10
}
fn default_bus_capacity() -> usize {
    1024
}
fn default_user() -> String {
    "root".to_owned()
}
fn default_tick_ms() -> u64 {
    2000
}
fn default_ping_timeout_ms() -> u64 {
    2000
}
fn default_n_suspect() -> u32 {
    3
}
fn default_n_failover() -> u32 {
    2
}
fn default_cooldown_secs() -> u64 {
    600
}
fn default_catchup_secs() -> u64 {
    30
}
fn default_failover_max_secs() -> u64 {
    120
}
fn default_longwrite_secs() -> u64 {
    10
}
fn default_relay_apply_secs() -> u64 {
    60
}
fn default_probe_concurrency() -> usize {
    8
}
fn default_connect_retry_secs() -> u32 {
    10
}
fn default_heartbeat_period_secs() -> u32 {
    3
}
fn default_true() -> bool {
    true
}

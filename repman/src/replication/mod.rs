use super::*;

use crate::gtid::GtidList;
use crate::session::Row;
use crate::version::CapabilityRecord;
use tokio::time::Instant;

pub mod dialect;
mod sql;
pub use sql::{SqlConnector, SqlInstance};

/// Coordinates in a binary log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinlogCoord {
    pub file: String,
    pub pos: u64,
}

impl BinlogCoord {
    pub fn new(file: impl Into<String>, pos: u64) -> Self {
        Self {
            file: file.into(),
            pos,
        }
    }
}

impl std::fmt::Display for BinlogCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.pos)
    }
}

/// `SHOW MASTER STATUS`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrimaryStatus {
    pub file: String,
    pub pos: u64,
    pub do_db: String,
    pub ignore_db: String,
}

impl PrimaryStatus {
    pub fn from_row(row: &Row) -> Self {
        Self {
            file: row.string("File"),
            pos: row.u64("Position").unwrap_or(0),
            do_db: row.string("Binlog_Do_DB"),
            ignore_db: row.string("Binlog_Ignore_DB"),
        }
    }

    pub fn coord(&self) -> BinlogCoord {
        BinlogCoord::new(self.file.clone(), self.pos)
    }

    pub fn same_binlog_filters(&self, other: &PrimaryStatus) -> bool {
        self.do_db == other.do_db && self.ignore_db == other.ignore_db
    }
}

/// Client error codes reported when the IO thread cannot reach its primary.
const IO_CONNECT_ERRNOS: &[u32] = &[2003, 2005, 2006, 2013];

/// Replica status of one channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub channel: String,
    pub master_host: String,
    pub master_port: u16,
    pub master_log_file: String,
    pub read_master_log_pos: u64,
    pub relay_master_log_file: String,
    pub exec_master_log_pos: u64,
    pub seconds_behind_master: Option<u64>,
    pub io_running: bool,
    pub sql_running: bool,
    pub using_gtid: String,
    pub gtid_io_pos: GtidList,
    pub gtid_slave_pos: GtidList,
    pub last_io_errno: u32,
    pub last_io_error: String,
    pub last_sql_errno: u32,
    pub last_sql_error: String,
    pub received_heartbeats: u64,
    pub taken_at: Instant,
}

impl ReplicaStatus {
    /// Parse a row of `SHOW [ALL] SLAVE[S] STATUS`.
    pub fn from_row(row: &Row, channel: &str) -> Result<Self> {
        let channel = row
            .get("Connection_name")
            .or_else(|| row.get("Channel_Name"))
            .unwrap_or(channel)
            .to_owned();
        // MySQL reports received and executed sets as GTID sets.
        let gtid_io_pos = row
            .get("Gtid_IO_Pos")
            .or_else(|| row.get("Retrieved_Gtid_Set"))
            .unwrap_or_default();
        let gtid_slave_pos = row
            .get("Gtid_Slave_Pos")
            .or_else(|| row.get("Executed_Gtid_Set"))
            .unwrap_or_default();
        Ok(Self {
            channel,
            master_host: row.string("Master_Host"),
            master_port: row.u64("Master_Port").unwrap_or(0) as u16,
            master_log_file: row.string("Master_Log_File"),
            read_master_log_pos: row.u64("Read_Master_Log_Pos").unwrap_or(0),
            relay_master_log_file: row.string("Relay_Master_Log_File"),
            exec_master_log_pos: row.u64("Exec_Master_Log_Pos").unwrap_or(0),
            seconds_behind_master: row.u64("Seconds_Behind_Master"),
            io_running: row.yes("Slave_IO_Running"),
            sql_running: row.yes("Slave_SQL_Running"),
            using_gtid: row.string("Using_Gtid"),
            gtid_io_pos: GtidList::parse(gtid_io_pos)?,
            gtid_slave_pos: GtidList::parse(gtid_slave_pos)?,
            last_io_errno: row.u64("Last_IO_Errno").unwrap_or(0) as u32,
            last_io_error: row.string("Last_IO_Error"),
            last_sql_errno: row.u64("Last_SQL_Errno").unwrap_or(0) as u32,
            last_sql_error: row.string("Last_SQL_Error"),
            received_heartbeats: row.u64("Slave_received_heartbeats").unwrap_or(0),
            taken_at: Instant::now(),
        })
    }

    pub fn healthy(&self) -> bool {
        self.io_running && self.sql_running && self.last_io_errno == 0 && self.last_sql_errno == 0
    }

    /// The SQL thread runs without error.
    pub fn sql_healthy(&self) -> bool {
        self.sql_running && self.last_sql_errno == 0
    }

    /// The IO thread is only failing to reach its primary.
    pub fn io_connect_fault(&self) -> bool {
        IO_CONNECT_ERRNOS.contains(&self.last_io_errno)
    }

    pub fn points_at(&self, primary: &Endpoint) -> bool {
        primary.matches(&self.master_host, self.master_port)
    }

    /// Every received event was applied.
    pub fn relay_applied(&self) -> bool {
        self.master_log_file == self.relay_master_log_file
            && self.read_master_log_pos == self.exec_master_log_pos
    }

    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.taken_at.elapsed() <= max_age
    }
}

/// One row of `SHOW BINLOG EVENTS`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BinlogEvent {
    pub log_name: String,
    pub pos: u64,
    pub event_type: String,
    pub server_id: u64,
    pub end_log_pos: u64,
    pub info: String,
}

impl BinlogEvent {
    pub fn from_row(row: &Row) -> Self {
        Self {
            log_name: row.string("Log_name"),
            pos: row.u64("Pos").unwrap_or(0),
            event_type: row.string("Event_type"),
            server_id: row.u64("Server_id").unwrap_or(0),
            end_log_pos: row.u64("End_log_pos").unwrap_or(0),
            info: row.string("Info"),
        }
    }

    pub fn coord(&self) -> BinlogCoord {
        BinlogCoord::new(self.log_name.clone(), self.pos)
    }

    /// Events each server writes on its own, which do not map between binlogs.
    pub fn is_meta(&self) -> bool {
        matches!(
            self.event_type.as_str(),
            "Format_desc"
                | "Rotate"
                | "Previous_gtids"
                | "Binlog_checkpoint"
                | "Gtid_list"
                | "Stop"
                | "Start_encryption"
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GtidSets {
    pub executed: GtidList,
    /// `executed` in the server's own notation.
    pub executed_raw: String,
    pub purged: GtidList,
    pub io_received: GtidList,
}

/// `replicate_*` variables.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationFilters {
    pub do_table: String,
    pub ignore_table: String,
    pub wild_do_table: String,
    pub wild_ignore_table: String,
    pub do_db: String,
    pub ignore_db: String,
}

/// Global variables and status the evaluator needs, read in one snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerVariables {
    pub server_id: u64,
    pub server_uuid: String,
    pub log_bin: bool,
    pub log_slave_updates: bool,
    pub gtid_mode_on: bool,
    pub enforce_gtid_consistency: bool,
    pub read_only: bool,
    pub super_read_only: bool,
    pub event_scheduler_on: bool,
    pub semisync_master_on: bool,
    pub semisync_slave_on: bool,
    pub binlog_format: String,
    pub sync_binlog: bool,
    pub sync_innodb: bool,
    pub binlog_checksum: bool,
    pub binlog_compress: bool,
    pub filters: ReplicationFilters,
}

/// Variable names read by `ServerVariables::from_pairs`.
pub const VARIABLE_NAMES: &[&str] = &[
    "SERVER_ID",
    "SERVER_UUID",
    "LOG_BIN",
    "LOG_SLAVE_UPDATES",
    "GTID_MODE",
    "ENFORCE_GTID_CONSISTENCY",
    "READ_ONLY",
    "SUPER_READ_ONLY",
    "EVENT_SCHEDULER",
    "BINLOG_FORMAT",
    "SYNC_BINLOG",
    "INNODB_FLUSH_LOG_AT_TRX_COMMIT",
    "BINLOG_CHECKSUM",
    "LOG_BIN_COMPRESS",
    "REPLICATE_DO_TABLE",
    "REPLICATE_IGNORE_TABLE",
    "REPLICATE_WILD_DO_TABLE",
    "REPLICATE_WILD_IGNORE_TABLE",
    "REPLICATE_DO_DB",
    "REPLICATE_IGNORE_DB",
];

/// Status names read by `ServerVariables::from_pairs`.
pub const STATUS_NAMES: &[&str] = &[
    "RPL_SEMI_SYNC_MASTER_STATUS",
    "RPL_SEMI_SYNC_SOURCE_STATUS",
    "RPL_SEMI_SYNC_SLAVE_STATUS",
    "RPL_SEMI_SYNC_REPLICA_STATUS",
];

impl ServerVariables {
    /// Build from upper-cased `(name, value)` pairs of variables and status.
    pub fn from_pairs(
        cap: &CapabilityRecord,
        vars: &std::collections::HashMap<String, String>,
        status: &std::collections::HashMap<String, String>,
    ) -> Self {
        let v = |k: &str| vars.get(k).cloned().unwrap_or_default();
        let on = |k: &str| vars.get(k).map(|x| session::is_on(x)).unwrap_or(false);
        let st = |k: &str| status.get(k).map(|x| session::is_on(x)).unwrap_or(false);
        Self {
            server_id: v("SERVER_ID").parse().unwrap_or(0),
            server_uuid: v("SERVER_UUID"),
            log_bin: on("LOG_BIN"),
            log_slave_updates: on("LOG_SLAVE_UPDATES"),
            // GTID is always on for MariaDB.
            gtid_mode_on: cap.is_mariadb() || on("GTID_MODE"),
            enforce_gtid_consistency: on("ENFORCE_GTID_CONSISTENCY"),
            read_only: on("READ_ONLY"),
            super_read_only: on("SUPER_READ_ONLY"),
            event_scheduler_on: on("EVENT_SCHEDULER"),
            semisync_master_on: st("RPL_SEMI_SYNC_MASTER_STATUS")
                || st("RPL_SEMI_SYNC_SOURCE_STATUS"),
            semisync_slave_on: st("RPL_SEMI_SYNC_SLAVE_STATUS")
                || st("RPL_SEMI_SYNC_REPLICA_STATUS"),
            binlog_format: v("BINLOG_FORMAT").to_ascii_uppercase(),
            sync_binlog: v("SYNC_BINLOG") == "1",
            sync_innodb: v("INNODB_FLUSH_LOG_AT_TRX_COMMIT") == "1",
            binlog_checksum: v("BINLOG_CHECKSUM").eq_ignore_ascii_case("CRC32"),
            binlog_compress: on("LOG_BIN_COMPRESS"),
            filters: ReplicationFilters {
                do_table: v("REPLICATE_DO_TABLE"),
                ignore_table: v("REPLICATE_IGNORE_TABLE"),
                wild_do_table: v("REPLICATE_WILD_DO_TABLE"),
                wild_ignore_table: v("REPLICATE_WILD_IGNORE_TABLE"),
                do_db: v("REPLICATE_DO_DB"),
                ignore_db: v("REPLICATE_IGNORE_DB"),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMode {
    /// MariaDB `MASTER_USE_GTID=CURRENT_POS`.
    GtidCurrent,
    /// MariaDB `MASTER_USE_GTID=SLAVE_POS`.
    GtidSlave,
    /// Binlog file and position.
    Positional,
    /// Binlog file and position against a MaxScale binlog router.
    Mxs,
    /// MySQL `MASTER_AUTO_POSITION=1`.
    AutoPosition,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangePrimaryOpt {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub connect_retry: u32,
    pub heartbeat_period: u32,
    pub ssl: bool,
    pub mode: ReplicationMode,
    /// Required by positional modes.
    pub coord: Option<BinlogCoord>,
    pub channel: String,
}

/// Reads replication state from one server.
#[async_trait::async_trait]
pub trait ReplicationReader: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    async fn ping(&self) -> Result<()>;

    /// Probe flavor and version.
    async fn capability(&self) -> Result<CapabilityRecord>;

    async fn variables(&self) -> Result<ServerVariables>;

    /// `None` when binary logging is off.
    async fn primary_status(&self) -> Result<Option<PrimaryStatus>>;

    /// `None` when the channel is not configured.
    async fn replica_status(&self, channel: &str) -> Result<Option<ReplicaStatus>>;

    async fn all_replica_statuses(&self) -> Result<Vec<ReplicaStatus>>;

    /// `SHOW BINLOG EVENTS IN file [FROM pos] LIMIT n`.
    async fn binlog_events(
        &self,
        file: &str,
        from_pos: Option<u64>,
        limit: u64,
    ) -> Result<Vec<BinlogEvent>>;

    /// Binlog file names, oldest first.
    async fn binary_logs(&self) -> Result<Vec<String>>;

    async fn gtid_sets(&self) -> Result<GtidSets>;

    /// Non-SELECT sessions plus InnoDB transactions older than `threshold`.
    async fn long_writes(&self, threshold: Duration) -> Result<u64>;

    async fn received_heartbeats(&self, channel: &str) -> Result<u64>;

    /// The newest pseudo-GTID token visible on this server.
    async fn last_pseudo_gtid(&self) -> Result<Option<String>>;

    /// Locate the first event whose info contains `token`, starting at
    /// `starting_file` and walking back to older binlogs.
    async fn pseudo_gtid_scan(
        &self,
        token: &str,
        starting_file: &str,
    ) -> Result<Option<BinlogCoord>> {
        let logs = self.binary_logs().await?;
        let start = logs
            .iter()
            .position(|f| f == starting_file)
            .with_context(|| format!("binlog {starting_file} not found"))?;
        for file in logs[..=start].iter().rev().take(MAX_BINLOG_WALK) {
            let mut from = None;
            loop {
                let events = self.binlog_events(file, from, EVENT_PAGE).await?;
                if let Some(ev) = events.iter().find(|e| e.info.contains(token)) {
                    return Ok(Some(ev.coord()));
                }
                match events.last() {
                    Some(last) if events.len() as u64 == EVENT_PAGE => {
                        from = Some(last.end_log_pos)
                    }
                    _ => break,
                }
            }
        }
        Ok(None)
    }

    /// Number of data events written after `at`.
    async fn events_after(&self, at: &BinlogCoord) -> Result<u64> {
        let walk = walk_after(self, at, true, None).await?;
        Ok(walk.count)
    }

    /// Number of data events from `at` on, where `at` is a read position
    /// such as a replica's `Read_Master_Log_Pos`.
    async fn events_from(&self, at: &BinlogCoord) -> Result<u64> {
        let walk = walk_after(self, at, false, None).await?;
        Ok(walk.count)
    }

    /// Start position of the `(n+1)`th data event after `at`.
    /// Past the end of the binlogs, the end of the last event.
    async fn binlog_pos_after_skip(&self, at: &BinlogCoord, n: u64) -> Result<BinlogCoord> {
        let walk = walk_after(self, at, true, Some(n + 1)).await?;
        Ok(walk.hit.or(walk.end).unwrap_or_else(|| at.clone()))
    }
}

/// Changes replication state of one server.
///
/// A failed multi-statement operation restores the replication threads
/// and reports every step that failed.
#[async_trait::async_trait]
pub trait ReplicationMutator: Send + Sync {
    /// Point the replica at a new primary. Threads are left stopped on success.
    async fn change_primary(&self, opt: &ChangePrimaryOpt) -> Result<()>;
    async fn start_replica(&self, channel: &str) -> Result<()>;
    async fn stop_replica(&self, channel: &str) -> Result<()>;
    async fn reset_replica(&self, channel: &str, all: bool) -> Result<()>;
    async fn stop_io_thread(&self, channel: &str) -> Result<()>;
    async fn stop_sql_thread(&self, channel: &str) -> Result<()>;
    async fn skip_one_event(&self, channel: &str) -> Result<()>;
    async fn set_read_only(&self, on: bool) -> Result<()>;
    async fn set_super_read_only(&self, on: bool) -> Result<()>;
    async fn set_binlog_format(&self, format: &str) -> Result<()>;
    async fn set_sync_binlog(&self) -> Result<()>;
    async fn set_sync_innodb(&self) -> Result<()>;
    async fn set_binlog_checksum(&self) -> Result<()>;
    async fn set_binlog_compress(&self) -> Result<()>;
    async fn set_gtid_slave_pos(&self, gtid: &GtidList) -> Result<()>;
    /// Wait until `gtid` (in the server's notation) is applied. False on timeout.
    async fn wait_gtid(&self, gtid: &str, timeout: Duration) -> Result<bool>;
    async fn flush_tables(&self) -> Result<()>;
    async fn set_event_scheduler(&self, on: bool) -> Result<()>;
    async fn inject_pseudo_gtid(&self, token: &str) -> Result<()>;
}

/// A server the orchestrator can observe and change.
pub trait Instance: ReplicationReader + ReplicationMutator {}
impl<T: ReplicationReader + ReplicationMutator> Instance for T {}

/// Opens instances by endpoint.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, endpoint: &Endpoint) -> Arc<dyn Instance>;
}

const EVENT_PAGE: u64 = 1000;
const MAX_BINLOG_WALK: usize = 64;

struct Walk {
    count: u64,
    hit: Option<BinlogCoord>,
    end: Option<BinlogCoord>,
}

/// Walk data events after `at` across binlog files until the `stop_at`th
/// one. With `skip_at`, the event starting at `at` is not counted.
async fn walk_after<R: ReplicationReader + ?Sized>(
    r: &R,
    at: &BinlogCoord,
    skip_at: bool,
    stop_at: Option<u64>,
) -> Result<Walk> {
    let logs = r.binary_logs().await?;
    let start = logs
        .iter()
        .position(|f| f == &at.file)
        .with_context(|| format!("binlog {} not found", at.file))?;

    let mut walk = Walk {
        count: 0,
        hit: None,
        end: None,
    };
    for (i, file) in logs[start..].iter().enumerate() {
        let mut from = if i == 0 { Some(at.pos) } else { None };
        loop {
            let events = r.binlog_events(file, from, EVENT_PAGE).await?;
            for ev in &events {
                walk.end = Some(BinlogCoord::new(ev.log_name.clone(), ev.end_log_pos));
                if ev.is_meta() || (i == 0 && (ev.pos < at.pos || (skip_at && ev.pos == at.pos))) {
                    continue;
                }
                walk.count += 1;
                if Some(walk.count) == stop_at {
                    walk.hit = Some(ev.coord());
                    return Ok(walk);
                }
            }
            match events.last() {
                Some(last) if events.len() as u64 == EVENT_PAGE => from = Some(last.end_log_pos),
                _ => break,
            }
        }
    }
    Ok(walk)
}

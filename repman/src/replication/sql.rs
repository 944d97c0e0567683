use super::dialect::{self, Thread};
use super::*;

use crate::session::{MysqlDriver, Session};
use std::collections::HashMap;

/// An `Instance` speaking SQL over one session.
pub struct SqlInstance {
    endpoint: Endpoint,
    session: Session,
    /// Channels read on MySQL replicas.
    channels: Vec<String>,
    cap: spin::RwLock<Option<CapabilityRecord>>,
}

impl SqlInstance {
    pub fn new(endpoint: Endpoint, session: Session, channels: Vec<String>) -> Self {
        Self {
            endpoint,
            session,
            channels,
            cap: spin::RwLock::new(None),
        }
    }

    /// Last probed capability, probing if unknown.
    async fn cap(&self) -> Result<CapabilityRecord> {
        if let Some(cap) = self.cap.read().clone() {
            return Ok(cap);
        }
        self.capability().await
    }

    async fn pairs(&self, stmt: &str) -> Result<HashMap<String, String>> {
        let rows = self.session.select(stmt).await?;
        Ok(rows
            .iter()
            .map(|r| (r.string("variable_name"), r.string("value")))
            .collect())
    }

    async fn execute_all(&self, stmts: &[String]) -> Result<()> {
        for stmt in stmts {
            self.session.execute(stmt).await?;
        }
        Ok(())
    }

    async fn replica_running(&self, channel: &str) -> bool {
        match self.replica_status(channel).await {
            Ok(Some(st)) => st.io_running || st.sql_running,
            _ => false,
        }
    }

    /// Restore threads after a failed step and report both outcomes.
    async fn roll_back(
        &self,
        channel: &str,
        was_running: bool,
        step: &str,
        e: anyhow::Error,
    ) -> anyhow::Error {
        let second = if was_running {
            match self.start_replica(channel).await {
                Ok(()) => "START SLAVE ok".to_owned(),
                Err(e2) => format!("START SLAVE failed: {e2:#}"),
            }
        } else {
            "replication left stopped".to_owned()
        };
        warn!("{} {step} failed: {e:#}, {second}", self.endpoint);
        Error::Composite {
            first: format!("{step} failed: {e:#}"),
            second,
        }
        .into()
    }
}

#[async_trait::async_trait]
impl ReplicationReader for SqlInstance {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn ping(&self) -> Result<()> {
        self.session.ping().await
    }

    async fn capability(&self) -> Result<CapabilityRecord> {
        let row = self
            .session
            .query_row("SELECT @@version AS version, @@version_comment AS version_comment")
            .await?
            .context("empty version row")?;
        let cap = crate::version::probe(&row.string("version"), &row.string("version_comment"))?;
        *self.cap.write() = Some(cap.clone());
        Ok(cap)
    }

    async fn variables(&self) -> Result<ServerVariables> {
        let cap = self.cap().await?;
        let vars = self.pairs(&dialect::variables(&cap)).await?;
        let status = self.pairs(&dialect::status(&cap)).await?;
        Ok(ServerVariables::from_pairs(&cap, &vars, &status))
    }

    async fn primary_status(&self) -> Result<Option<PrimaryStatus>> {
        let row = self.session.query_row("SHOW MASTER STATUS").await?;
        Ok(row.as_ref().map(PrimaryStatus::from_row))
    }

    async fn replica_status(&self, channel: &str) -> Result<Option<ReplicaStatus>> {
        let cap = self.cap().await?;
        let rows = self
            .session
            .select(&dialect::show_replica_status(&cap, channel))
            .await?;
        for row in &rows {
            let st = ReplicaStatus::from_row(row, channel)?;
            if st.channel == channel {
                return Ok(Some(st));
            }
        }
        Ok(None)
    }

    async fn all_replica_statuses(&self) -> Result<Vec<ReplicaStatus>> {
        let cap = self.cap().await?;
        if let Some(stmt) = dialect::show_all_replicas(&cap) {
            let rows = self.session.select(stmt).await?;
            return rows
                .iter()
                .map(|r| ReplicaStatus::from_row(r, ""))
                .collect();
        }
        let mut out = vec![];
        for ch in &self.channels {
            if let Some(st) = self.replica_status(ch).await? {
                out.push(st);
            }
        }
        Ok(out)
    }

    async fn binlog_events(
        &self,
        file: &str,
        from_pos: Option<u64>,
        limit: u64,
    ) -> Result<Vec<BinlogEvent>> {
        let rows = self
            .session
            .select(&dialect::binlog_events(file, from_pos, limit))
            .await?;
        Ok(rows.iter().map(BinlogEvent::from_row).collect())
    }

    async fn binary_logs(&self) -> Result<Vec<String>> {
        let rows = self.session.select("SHOW BINARY LOGS").await?;
        Ok(rows.iter().map(|r| r.string("Log_name")).collect())
    }

    async fn gtid_sets(&self) -> Result<GtidSets> {
        let cap = self.cap().await?;
        let row = self
            .session
            .query_row(dialect::gtid_sets(&cap))
            .await?
            .context("empty gtid row")?;
        let executed_raw = row.string("executed");
        let mut io_received = GtidList::new();
        for st in self.all_replica_statuses().await? {
            io_received = io_received.merge_max(&st.gtid_io_pos);
        }
        Ok(GtidSets {
            executed: GtidList::parse(&executed_raw)?,
            purged: GtidList::parse(&row.string("purged"))?,
            executed_raw,
            io_received,
        })
    }

    async fn long_writes(&self, threshold: Duration) -> Result<u64> {
        let row = self
            .session
            .query_row(&dialect::long_writes(threshold))
            .await?;
        Ok(row.and_then(|r| r.u64("n")).unwrap_or(0))
    }

    async fn received_heartbeats(&self, channel: &str) -> Result<u64> {
        let cap = self.cap().await?;
        if cap.is_mariadb() {
            let st = self.replica_status(channel).await?;
            return Ok(st.map(|s| s.received_heartbeats).unwrap_or(0));
        }
        let row = self
            .session
            .query_row(&dialect::received_heartbeats(channel))
            .await?;
        Ok(row.and_then(|r| r.u64("n")).unwrap_or(0))
    }

    async fn last_pseudo_gtid(&self) -> Result<Option<String>> {
        let stmt = format!(
            "SELECT * FROM {}.pseudo_gtid_v",
            dialect::PSEUDO_GTID_SCHEMA
        );
        match self.session.query_row(&stmt).await {
            Ok(row) => Ok(row.and_then(|r| r.first().map(|s| s.to_owned()))),
            // The view does not exist until the first injection.
            Err(e) if matches!(Error::find(&e), Some(Error::Runtime { code: 1146, .. })) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait::async_trait]
impl ReplicationMutator for SqlInstance {
    async fn change_primary(&self, opt: &ChangePrimaryOpt) -> Result<()> {
        let cap = self.cap().await?;
        let stmt = dialect::change_primary(&cap, opt)?;
        let was_running = self.replica_running(&opt.channel).await;
        if was_running {
            self.stop_replica(&opt.channel).await?;
        }
        if let Err(e) = self.session.execute(&stmt).await {
            return Err(self
                .roll_back(&opt.channel, was_running, "CHANGE MASTER", e)
                .await);
        }
        info!(
            "{} replicates from {}:{} ({:?})",
            self.endpoint, opt.host, opt.port, opt.mode
        );
        Ok(())
    }

    async fn start_replica(&self, channel: &str) -> Result<()> {
        let cap = self.cap().await?;
        self.session
            .execute(&dialect::start_replica(&cap, channel, Thread::Both))
            .await
    }

    async fn stop_replica(&self, channel: &str) -> Result<()> {
        let cap = self.cap().await?;
        self.session
            .execute(&dialect::stop_replica(&cap, channel, Thread::Both))
            .await
    }

    async fn reset_replica(&self, channel: &str, all: bool) -> Result<()> {
        let cap = self.cap().await?;
        let was_running = self.replica_running(channel).await;
        if was_running {
            self.stop_replica(channel).await?;
        }
        if let Err(e) = self
            .session
            .execute(&dialect::reset_replica(&cap, channel, all))
            .await
        {
            return Err(self.roll_back(channel, was_running, "RESET SLAVE", e).await);
        }
        Ok(())
    }

    async fn stop_io_thread(&self, channel: &str) -> Result<()> {
        let cap = self.cap().await?;
        self.session
            .execute(&dialect::stop_replica(&cap, channel, Thread::Io))
            .await
    }

    async fn stop_sql_thread(&self, channel: &str) -> Result<()> {
        let cap = self.cap().await?;
        self.session
            .execute(&dialect::stop_replica(&cap, channel, Thread::Sql))
            .await
    }

    async fn skip_one_event(&self, channel: &str) -> Result<()> {
        let cap = self.cap().await?;
        let stop = dialect::stop_replica(&cap, channel, Thread::Sql);
        let mut stmts = vec![stop];
        stmts.extend(dialect::skip_one_event(&cap, channel));
        self.execute_all(&stmts).await?;
        self.session
            .execute(&dialect::start_replica(&cap, channel, Thread::Sql))
            .await
    }

    async fn set_read_only(&self, on: bool) -> Result<()> {
        self.session
            .execute(&dialect::set_global("read_only", on))
            .await
    }

    async fn set_super_read_only(&self, on: bool) -> Result<()> {
        let cap = self.cap().await?;
        if cap.is_mariadb() || !cap.at_least(5, 7) {
            return Ok(());
        }
        self.session
            .execute(&dialect::set_global("super_read_only", on))
            .await
    }

    async fn set_binlog_format(&self, format: &str) -> Result<()> {
        self.session
            .execute(&format!("SET GLOBAL binlog_format={}", dialect::quote(format)))
            .await
    }

    async fn set_sync_binlog(&self) -> Result<()> {
        self.session.execute("SET GLOBAL sync_binlog=1").await
    }

    async fn set_sync_innodb(&self) -> Result<()> {
        self.session
            .execute("SET GLOBAL innodb_flush_log_at_trx_commit=1")
            .await
    }

    async fn set_binlog_checksum(&self) -> Result<()> {
        self.session
            .execute("SET GLOBAL binlog_checksum='CRC32'")
            .await
    }

    async fn set_binlog_compress(&self) -> Result<()> {
        let cap = self.cap().await?;
        ensure!(
            cap.is_mariadb(),
            Error::Operator("binlog compression needs MariaDB".to_owned())
        );
        self.session.execute("SET GLOBAL log_bin_compress=1").await
    }

    async fn set_gtid_slave_pos(&self, gtid: &GtidList) -> Result<()> {
        let cap = self.cap().await?;
        ensure!(
            cap.is_mariadb(),
            Error::Operator("gtid_slave_pos needs MariaDB".to_owned())
        );
        self.session
            .execute(&format!(
                "SET GLOBAL gtid_slave_pos={}",
                dialect::quote(&gtid.render())
            ))
            .await
    }

    async fn wait_gtid(&self, gtid: &str, timeout: Duration) -> Result<bool> {
        let cap = self.cap().await?;
        let row = self
            .session
            .query_row(&dialect::wait_gtid(&cap, gtid, timeout))
            .await?;
        // 0 on success, -1 or 1 on timeout.
        Ok(row.and_then(|r| r.get("r").map(|v| v.trim() == "0")).unwrap_or(false))
    }

    async fn flush_tables(&self) -> Result<()> {
        self.session.execute("FLUSH TABLES").await
    }

    async fn set_event_scheduler(&self, on: bool) -> Result<()> {
        self.session
            .execute(&dialect::set_global("event_scheduler", on))
            .await
    }

    async fn inject_pseudo_gtid(&self, token: &str) -> Result<()> {
        self.session
            .execute(&format!(
                "CREATE DATABASE IF NOT EXISTS {}",
                dialect::PSEUDO_GTID_SCHEMA
            ))
            .await?;
        self.session
            .execute(&dialect::pseudo_gtid_view(token))
            .await
    }
}

/// Opens `SqlInstance`s with shared credentials, one per endpoint.
pub struct SqlConnector {
    user: String,
    password: String,
    deadline: Duration,
    channels: Vec<String>,
    cache: moka::sync::Cache<Endpoint, Arc<SqlInstance>>,
}

impl SqlConnector {
    pub fn new(user: &str, password: &str, deadline: Duration, channels: Vec<String>) -> Self {
        let cache = moka::sync::Cache::builder()
            .initial_capacity(3)
            .time_to_idle(Duration::from_secs(60))
            .build();
        Self {
            user: user.to_owned(),
            password: password.to_owned(),
            deadline,
            channels,
            cache,
        }
    }
}

impl Connector for SqlConnector {
    fn connect(&self, endpoint: &Endpoint) -> Arc<dyn Instance> {
        self.cache.get_with(endpoint.clone(), || {
            let driver = MysqlDriver::new(endpoint, &self.user, &self.password);
            let session = Session::new(Arc::new(driver), self.deadline);
            Arc::new(SqlInstance::new(
                endpoint.clone(),
                session,
                self.channels.clone(),
            ))
        })
    }
}

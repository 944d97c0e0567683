use super::*;

use crate::replication::dialect::quote;
use crate::session::{Isolation, MysqlDriver, Row, Session};

const TABLE: &str = "replication_manager_schema.heartbeat";

/// Arbitration store in a shared MariaDB/MySQL server.
///
/// Writes are kept out of the binary log of the store.
pub struct MysqlArbitrationStore {
    session: Session,
    fresh: Duration,
}

impl MysqlArbitrationStore {
    pub fn new(session: Session, fresh: Duration) -> Self {
        Self {
            session: session.with_binlog_suppressed(),
            fresh,
        }
    }

    pub fn connect(url: &str, fresh: Duration) -> Result<Self> {
        let driver = MysqlDriver::from_url(url)?;
        let session = Session::new(Arc::new(driver), Duration::from_secs(5));
        Ok(Self::new(session, fresh))
    }

    /// Create the schema and the table if missing.
    pub async fn init(&self) -> Result<()> {
        self.session
            .execute("CREATE DATABASE IF NOT EXISTS replication_manager_schema")
            .await?;
        self.session
            .execute(&format!(
                "CREATE TABLE IF NOT EXISTS {TABLE} (\
                 secret VARCHAR(64) NOT NULL, \
                 cluster VARCHAR(128) NOT NULL, \
                 uid INT NOT NULL, \
                 uuid VARCHAR(128), \
                 master VARCHAR(128), \
                 date TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 arbitration_date TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 status CHAR(1) DEFAULT 'U', \
                 hosts INT, \
                 failed INT, \
                 PRIMARY KEY (secret, cluster, uid))"
            ))
            .await
    }

    fn scope(secret: &str, cluster: &str) -> String {
        format!("secret={} AND cluster={}", quote(secret), quote(cluster))
    }

    fn upsert(me: &Member, obs: &Observation, status: Option<Status>) -> String {
        let (status, arbitration) = match status {
            Some(s) => (
                format!(", status='{}', arbitration_date=NOW()", s.as_char()),
                s.as_char(),
            ),
            None => (String::new(), 'U'),
        };
        format!(
            "INSERT INTO {TABLE} (secret, cluster, uid, uuid, master, date, arbitration_date, status, hosts, failed) \
             VALUES ({}, {}, {}, {}, {}, NOW(), NOW(), '{arbitration}', {}, {}) \
             ON DUPLICATE KEY UPDATE uuid=VALUES(uuid), master=VALUES(master), date=NOW(), \
             hosts=VALUES(hosts), failed=VALUES(failed){status}",
            quote(&me.secret),
            quote(&me.cluster),
            me.uid,
            quote(&me.uuid),
            quote(&obs.primary_str()),
            obs.hosts_seen,
            obs.hosts_failed,
        )
    }
}

fn count(row: Option<Row>) -> u64 {
    row.and_then(|r| r.u64("n")).unwrap_or(0)
}

#[async_trait::async_trait]
impl ArbitrationStore for MysqlArbitrationStore {
    async fn publish_heartbeat(&self, me: &Member, obs: &Observation) -> Result<()> {
        let scope = Self::scope(&me.secret, &me.cluster);
        let mut tx = self
            .session
            .transaction_with(Isolation::ReadCommitted)
            .await?;
        tx.execute(&Self::upsert(me, obs, None)).await?;
        let distinct = tx
            .query_row(&format!(
                "SELECT COUNT(DISTINCT master) AS n FROM {TABLE} WHERE {scope} \
                 AND date >= NOW() - INTERVAL {} SECOND",
                self.fresh.as_secs()
            ))
            .await?;
        if count(distinct) == 1 {
            tx.execute(&format!(
                "UPDATE {TABLE} SET status='U' WHERE {scope} AND status='E'"
            ))
            .await?;
        }
        tx.commit().await
    }

    /// The locking reads run under SERIALIZABLE so they also lock the gaps of
    /// the (secret, cluster) key range. Two managers electing at once then
    /// conflict even when no row matches, and the loser fails with a deadlock.
    async fn request_election(&self, me: &Member, obs: &Observation) -> Result<bool> {
        let scope = Self::scope(&me.secret, &me.cluster);
        let mut tx = self
            .session
            .transaction_with(Isolation::Serializable)
            .await?;
        let elected = tx
            .query_row(&format!(
                "SELECT COUNT(*) AS n FROM {TABLE} WHERE {scope} AND status='E' AND uid<>{} FOR UPDATE",
                me.uid
            ))
            .await?;
        if count(elected) > 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        let better = tx
            .query_row(&format!(
                "SELECT COUNT(*) AS n FROM {TABLE} WHERE {scope} AND status='U' AND uid<>{} AND failed < {} FOR UPDATE",
                me.uid, obs.hosts_failed
            ))
            .await?;
        if count(better) > 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.execute(&Self::upsert(me, obs, Some(Status::Elected)))
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn release(&self, me: &Member) -> Result<()> {
        self.session
            .execute(&format!(
                "UPDATE {TABLE} SET status='U' WHERE {} AND uid={}",
                Self::scope(&me.secret, &me.cluster),
                me.uid
            ))
            .await
    }

    async fn rows(&self, secret: &str, cluster: &str) -> Result<Vec<HeartbeatRow>> {
        let rows = self
            .session
            .select(&format!(
                "SELECT secret, cluster, uid, uuid, master, \
                 CAST(UNIX_TIMESTAMP(date) * 1000 AS UNSIGNED) AS date, \
                 CAST(UNIX_TIMESTAMP(arbitration_date) * 1000 AS UNSIGNED) AS arbitration_date, \
                 status, hosts, failed FROM {TABLE} WHERE {}",
                Self::scope(secret, cluster)
            ))
            .await?;
        Ok(rows
            .iter()
            .map(|r| HeartbeatRow {
                secret: r.string("secret"),
                cluster: r.string("cluster"),
                uid: r.u64("uid").unwrap_or(0) as u32,
                uuid: r.string("uuid"),
                primary: r.string("master"),
                date: r.u64("date").unwrap_or(0),
                arbitration_date: r.u64("arbitration_date").unwrap_or(0),
                status: Status::from_char(&r.string("status")),
                hosts: r.u64("hosts").unwrap_or(0) as u32,
                failed: r.u64("failed").unwrap_or(0) as u32,
            })
            .collect())
    }

    async fn forget(&self, secret: &str) -> Result<u64> {
        let mut tx = self.session.transaction().await?;
        tx.execute(&format!("DELETE FROM {TABLE} WHERE secret={}", quote(secret)))
            .await?;
        let n = count(tx.query_row("SELECT ROW_COUNT() AS n").await?);
        tx.commit().await?;
        Ok(n)
    }
}

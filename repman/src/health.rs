use super::*;

use crate::gtid::GtidList;
use crate::replication::{GtidSets, Instance, PrimaryStatus, ReplicaStatus, ServerVariables};
use crate::version::CapabilityRecord;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::time::Instant;

/// Everything read from one server in one pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub capability: CapabilityRecord,
    pub variables: ServerVariables,
    /// `None` when binary logging is off.
    pub primary_status: Option<PrimaryStatus>,
    pub replicas: Vec<ReplicaStatus>,
    pub gtid: GtidSets,
    pub taken_at: Instant,
}

impl Snapshot {
    pub fn replica(&self, channel: &str) -> Option<&ReplicaStatus> {
        self.replicas.iter().find(|r| r.channel == channel)
    }

    pub fn executed(&self) -> &GtidList {
        &self.gtid.executed
    }
}

/// Evaluation of one server at one tick.
///
/// When the pass fails after the ping, the previous snapshot is kept and
/// the record is marked stale. Predicates never look at a stale snapshot.
/// Long running writes are not part of the record: [`no_long_writes`]
/// scans the process list only when a switchover asks for it.
#[derive(Clone, Debug)]
pub struct HealthRecord {
    pub endpoint: Endpoint,
    pub reachable: bool,
    pub stale: bool,
    pub snapshot: Option<Snapshot>,
    pub last_error: Option<String>,
    pub last_fault: Option<Error>,
}

impl HealthRecord {
    fn unreachable(endpoint: Endpoint, e: &anyhow::Error, prev: Option<&HealthRecord>) -> Self {
        Self {
            endpoint,
            reachable: false,
            stale: true,
            snapshot: prev.and_then(|p| p.snapshot.clone()),
            last_error: Some(format!("{e:#}")),
            last_fault: Error::find(e).cloned(),
        }
    }

    /// The snapshot, if it was taken in this pass.
    pub fn fresh(&self) -> Option<&Snapshot> {
        if self.stale {
            None
        } else {
            self.snapshot.as_ref()
        }
    }

    pub fn binlog_enabled(&self) -> bool {
        self.fresh()
            .map(|s| s.variables.log_bin && s.primary_status.is_some())
            .unwrap_or(false)
    }

    pub fn prereq_ok(&self) -> bool {
        self.reachable && self.binlog_enabled()
    }

    /// Every channel runs both threads without error.
    pub fn replica_healthy(&self) -> bool {
        match self.fresh() {
            Some(s) => !s.replicas.is_empty() && s.replicas.iter().all(|r| r.healthy()),
            None => false,
        }
    }

    /// Like `replica_healthy`, but excuses IO threads that only fail to
    /// reach a primary known to be down.
    pub fn replica_healthy_without_primary(&self) -> bool {
        match self.fresh() {
            Some(s) => {
                !s.replicas.is_empty()
                    && s
                        .replicas
                        .iter()
                        .all(|r| r.healthy() || (r.sql_healthy() && r.io_connect_fault()))
            }
            None => false,
        }
    }

    pub fn filters_consistent_with(&self, other: &Snapshot) -> bool {
        let Some(s) = self.fresh() else {
            return false;
        };
        let binlog = match (&s.primary_status, &other.primary_status) {
            (Some(a), Some(b)) => a.same_binlog_filters(b),
            _ => true,
        };
        s.variables.filters == other.variables.filters && binlog
    }

    /// Executed set of this server covers the primary's.
    pub fn in_sync_with(&self, primary: &Snapshot) -> bool {
        self.fresh()
            .map(|s| s.executed().contains(primary.executed()))
            .unwrap_or(false)
    }

    pub fn semisync_replica_ok(&self, required: bool) -> bool {
        !required
            || self
                .fresh()
                .map(|s| s.variables.semisync_slave_on)
                .unwrap_or(false)
    }

    pub fn is_critical(&self) -> bool {
        self.last_fault
            .as_ref()
            .map(|f| f.is_critical())
            .unwrap_or(false)
    }

    /// The last fault is server-side and unrecoverable.
    pub fn unrecoverable(&self) -> bool {
        matches!(
            self.last_fault.as_ref().map(|f| f.kind()),
            Some(FaultKind::Runtime(FaultClass::Unrecoverable))
        )
    }

    /// Seconds behind the primary on `channel`, from the fresh snapshot.
    pub fn delay(&self, channel: &str) -> Option<u64> {
        self.fresh()
            .and_then(|s| s.replica(channel))
            .and_then(|r| r.seconds_behind_master)
    }
}

async fn snapshot(x: &dyn Instance) -> Result<Snapshot> {
    let capability = x.capability().await.context("capability")?;
    let variables = x.variables().await.context("variables")?;
    let primary_status = x.primary_status().await.context("primary status")?;
    let replicas = x.all_replica_statuses().await.context("replica status")?;
    let gtid = x.gtid_sets().await.context("gtid sets")?;
    Ok(Snapshot {
        capability,
        variables,
        primary_status,
        replicas,
        gtid,
        taken_at: Instant::now(),
    })
}

/// Ping then read a full snapshot of one server.
pub async fn evaluate(
    x: &dyn Instance,
    ping_timeout: Duration,
    prev: Option<&HealthRecord>,
) -> HealthRecord {
    let endpoint = x.endpoint().clone();
    let ping = match tokio::time::timeout(ping_timeout, x.ping()).await {
        Ok(r) => r,
        Err(_) => Err(Error::Connection(format!("ping timeout {ping_timeout:?}")).into()),
    };
    if let Err(e) = ping {
        debug!("{endpoint} unreachable: {e:#}");
        return HealthRecord::unreachable(endpoint, &e, prev);
    }
    match snapshot(x).await {
        Ok(s) => HealthRecord {
            endpoint,
            reachable: true,
            stale: false,
            snapshot: Some(s),
            last_error: None,
            last_fault: None,
        },
        Err(e) => {
            warn!("{endpoint} snapshot failed: {e:#}");
            let mut rec = HealthRecord::unreachable(endpoint, &e, prev);
            // A connection fault after the ping means the server went away.
            rec.reachable = Error::classify(&e) != FaultKind::Connection;
            rec
        }
    }
}

/// No session on `x` has been writing, and no InnoDB transaction has been
/// open, for `threshold` or longer.
pub async fn no_long_writes(x: &dyn Instance, threshold: Duration) -> Result<bool> {
    let n = x.long_writes(threshold).await?;
    if n > 0 {
        debug!("{} has {n} writes older than {threshold:?}", x.endpoint());
    }
    Ok(n == 0)
}

/// Evaluate every server with at most `concurrency` evaluations in flight.
pub async fn evaluate_all(
    instances: &[Arc<dyn Instance>],
    concurrency: usize,
    ping_timeout: Duration,
    prev: &HashMap<Endpoint, HealthRecord>,
) -> HashMap<Endpoint, HealthRecord> {
    let jobs: Vec<_> = instances
        .iter()
        .map(|x| (x.clone(), prev.get(x.endpoint()).cloned()))
        .map(|(x, prev): (Arc<dyn Instance>, Option<HealthRecord>)| async move {
            let rec = evaluate(x.as_ref(), ping_timeout, prev.as_ref()).await;
            (rec.endpoint.clone(), rec)
        })
        .collect();
    futures::stream::iter(jobs)
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await
}

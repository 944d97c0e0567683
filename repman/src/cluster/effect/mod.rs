use super::*;

/// Await `$op` once more after a jittered backoff if it failed with a
/// retryable or connection fault. `$op` is an expression building the
/// future, evaluated again for the second attempt.
macro_rules! retry_once {
    ($what:expr, $op:expr) => {
        match $op.await {
            Ok(x) => Ok(x),
            Err(e) => match $crate::cluster::effect::backoff($what, e).await {
                Ok(()) => {
                    anyhow::Context::with_context($op.await, || format!("{} failed twice", $what))
                }
                Err(e) => Err(e),
            },
        }
    };
}

pub mod candidates;
pub mod enforce;
pub mod failover;
pub mod rejoin;
pub mod switchover;

use crate::replication::{BinlogCoord, ChangePrimaryOpt, ReplicationMode};

use rand::Rng;

/// Sleep before a second attempt, or give `e` back if it is not worth one.
pub(crate) async fn backoff(what: &str, e: anyhow::Error) -> Result<()> {
    match Error::classify(&e) {
        FaultKind::Connection | FaultKind::Runtime(FaultClass::Retryable) => {
            warn!("{what} failed, retrying once: {e:#}");
            let backoff = Duration::from_millis(rand::thread_rng().gen_range(100..300));
            tokio::time::sleep(backoff).await;
            Ok(())
        }
        _ => Err(e),
    }
}

/// GTID-based mode for `replica` following `target`, if both sides can use it.
///
/// `current` picks `GtidCurrent` on MariaDB, which a demoted primary needs
/// because its own writes are not in its replica position.
pub(crate) fn gtid_mode(replica: &Snapshot, target: &Snapshot, current: bool) -> Option<ReplicationMode> {
    let same_flavor = replica.capability.is_mariadb() == target.capability.is_mariadb();
    if !(same_flavor && replica.variables.gtid_mode_on && target.variables.gtid_mode_on) {
        return None;
    }
    if !replica.capability.is_mariadb() {
        Some(ReplicationMode::AutoPosition)
    } else if current {
        Some(ReplicationMode::GtidCurrent)
    } else {
        Some(ReplicationMode::GtidSlave)
    }
}

pub(crate) fn change_opt(
    config: &ClusterConfig,
    target: &Endpoint,
    mode: ReplicationMode,
    coord: Option<BinlogCoord>,
) -> ChangePrimaryOpt {
    ChangePrimaryOpt {
        host: target.host().to_owned(),
        port: target.port(),
        user: config.replication_user.clone(),
        password: config.replication_password.clone(),
        connect_retry: config.connect_retry_secs,
        heartbeat_period: config.heartbeat_period_secs,
        ssl: config.ssl,
        mode,
        coord,
        channel: config.channel.clone(),
    }
}

/// Point `x` at a new primary and start replication.
pub(crate) async fn attach(x: &dyn Instance, opt: &ChangePrimaryOpt, read_only: bool) -> Result<()> {
    retry_once!("change primary", x.change_primary(opt))?;
    retry_once!("start replica", x.start_replica(&opt.channel))?;
    if read_only {
        retry_once!("set read only", x.set_read_only(true))?;
    }
    Ok(())
}

/// Make `x` a writable primary. Replication state is dropped.
pub(crate) async fn promote(x: &dyn Instance, channel: &str, event_scheduler: bool) -> Result<()> {
    retry_once!("stop replica", x.stop_replica(channel))?;
    retry_once!("reset replica", x.reset_replica(channel, true))?;
    retry_once!("clear super read only", x.set_super_read_only(false))?;
    retry_once!("clear read only", x.set_read_only(false))?;
    if event_scheduler {
        retry_once!("start event scheduler", x.set_event_scheduler(true))?;
    }
    info!("{} promoted", x.endpoint());
    Ok(())
}

/// Coordinates on `target` of the event `replica` stopped after, found
/// through the newest pseudo-GTID token both binlogs hold.
pub(crate) async fn pseudo_gtid_coord(replica: &dyn Instance, target: &dyn Instance) -> Result<BinlogCoord> {
    let token = replica
        .last_pseudo_gtid()
        .await?
        .with_context(|| format!("no pseudo-GTID token on {}", replica.endpoint()))?;
    let rfile = replica
        .primary_status()
        .await?
        .with_context(|| format!("binary log is off on {}", replica.endpoint()))?
        .file;
    let at_r = replica
        .pseudo_gtid_scan(&token, &rfile)
        .await?
        .with_context(|| format!("token {token} not in binlogs of {}", replica.endpoint()))?;
    let n = replica.events_after(&at_r).await?;

    let tfile = target
        .primary_status()
        .await?
        .with_context(|| format!("binary log is off on {}", target.endpoint()))?
        .file;
    let at_t = target
        .pseudo_gtid_scan(&token, &tfile)
        .await?
        .with_context(|| format!("token {token} not in binlogs of {}", target.endpoint()))?;
    let coord = target.binlog_pos_after_skip(&at_t, n).await?;
    debug!(
        "{} resumes on {} at {coord} ({n} events after {token})",
        replica.endpoint(),
        target.endpoint()
    );
    Ok(coord)
}

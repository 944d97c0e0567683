use super::*;

use crate::replication::BinlogCoord;
use crate::topology::elect;

/// Operator-requested primary change with a live primary.
///
/// Writes are frozen on the old primary, every replica catches up to its
/// final position, then the candidate is promoted and the old primary is
/// re-attached below it within the same transition.
pub struct Effect<'a> {
    pub cluster: &'a mut Cluster,
}

/// Where the frozen primary stopped.
struct Target {
    gtid: Option<String>,
    coord: BinlogCoord,
}

impl Effect<'_> {
    pub async fn exec(self, preferred: Option<Endpoint>) -> Result<Endpoint> {
        let c = self.cluster;
        let old = c
            .topology
            .primary()
            .cloned()
            .ok_or_else(|| Error::Operator("no primary".to_owned()))?;
        let psnap = c
            .fresh_of(&old)
            .ok_or_else(|| Error::Operator(format!("primary {old} is not reachable")))?;
        ensure!(
            !c.in_cooldown(),
            Error::Operator("primary change cooldown in effect".to_owned())
        );
        let p = c.instance(&old)?;
        ensure!(
            crate::health::no_long_writes(p.as_ref(), c.config.longwrite_threshold()).await?,
            Error::Operator(format!("long running writes on {old}"))
        );

        let cands = candidates::switchover_candidates(c, &old)?;
        let winner = match preferred {
            Some(ep) => {
                ensure!(
                    cands.iter().any(|x| x.endpoint == ep),
                    Error::Operator(format!("{ep} is not an eligible switchover target"))
                );
                ep
            }
            None => {
                elect(&cands)
                    .ok_or_else(|| Error::Operator("no switchover candidate".to_owned()))?
                    .winner
            }
        };
        if !c.acquire_lease().await {
            bail!(Error::ElectionInconclusive(
                "lease not held for switchover".to_owned()
            ));
        }

        c.transition(
            ClusterState::Switchover,
            format!("operator switchover from {old} to {winner}"),
        );
        if let Some(script) = c.config.pre_failover_script.clone() {
            hooks::run(&script, c.name(), &old, &winner).await;
        }

        let target = match freeze(c, p.as_ref()).await {
            Ok(t) => t,
            Err(e) => return restore(c, p.as_ref(), &psnap, format!("freeze failed: {e:#}")).await,
        };
        let followers: Vec<Endpoint> = c
            .topology
            .others()
            .filter(|s| {
                s.fresh()
                    .and_then(|snap| snap.replica(&c.config.channel))
                    .map(|r| r.points_at(&old))
                    .unwrap_or(false)
            })
            .map(|s| s.endpoint.clone())
            .collect();
        if let Err(e) = catch_up(c, &followers, &target).await {
            return restore(c, p.as_ref(), &psnap, format!("{e:#}")).await;
        }

        let w = c.instance(&winner)?;
        let channel = c.config.channel.clone();
        let mut rec = CrashRecord::new(old.clone());
        if let Ok(Some(rs)) = w.replica_status(&channel).await {
            rec.old_binlog_file = rs.master_log_file.clone();
            rec.old_binlog_pos = rs.read_master_log_pos;
            rec.io_gtid = rs.gtid_io_pos.render();
        }
        if let Some(snap) = c.fresh_of(&winner) {
            rec.semisync_was_on = snap.variables.semisync_slave_on;
            if !snap.capability.is_mariadb() {
                rec.io_gtid = target.gtid.clone().unwrap_or_default();
            }
        }
        let new_coord = match w.primary_status().await {
            Ok(Some(ps)) => ps.coord(),
            Ok(None) => BinlogCoord::default(),
            Err(e) => {
                return restore(c, p.as_ref(), &psnap, format!("{winner} binlog position unknown: {e:#}")).await
            }
        };
        rec.new_binlog_file = new_coord.file.clone();
        rec.new_binlog_pos = new_coord.pos;

        if let Err(e) = promote(w.as_ref(), &channel, c.config.move_event_scheduler).await {
            if let Err(e) = w.start_replica(&channel).await {
                warn!("failed to restart replication on {winner}: {e:#}");
            }
            return restore(c, p.as_ref(), &psnap, format!("promotion of {winner} failed: {e:#}")).await;
        }

        c.topology.set_primary(winner.clone());
        c.last_change = Some(Instant::now());
        c.publish(EventBody::PrimaryChanged {
            old: Some(old.clone()),
            new: winner.clone(),
        });

        let mut rest: Vec<Endpoint> = followers.into_iter().filter(|ep| ep != &winner).collect();
        rest.push(old.clone());
        for ep in rest {
            if let Err(e) = follow(c, &ep, &winner, &old, &new_coord).await {
                if ep == old {
                    warn!("old primary {old} not re-attached, rejoin later: {e:#}");
                    rec.warnings.push(format!("{old}: {e:#}"));
                    if let Some(s) = c.topology.get_mut(&old) {
                        s.pending_rejoin = true;
                    }
                } else {
                    warn!("cluster {} could not re-attach {ep}: {e:#}", c.name());
                    rec.orphans.push(ep.clone());
                    rec.warnings.push(format!("{ep}: {e:#}"));
                    if let Some(s) = c.topology.get_mut(&ep) {
                        s.orphan = true;
                    }
                    c.publish(EventBody::ReplicaOrphaned {
                        endpoint: ep.clone(),
                        error: format!("{e:#}"),
                    });
                }
            }
        }

        rec.elected_primary = Some(winner.clone());
        if !rec.orphans.is_empty() {
            rec.marker = Some(Marker::Partial);
        }
        c.record_crash(&rec).await;
        if let Some(script) = c.config.post_failover_script.clone() {
            hooks::run(&script, c.name(), &old, &winner).await;
        }
        c.transition(
            ClusterState::Rejoin,
            format!("switchover from {old} to {winner} done"),
        );
        Ok(winner)
    }
}

/// Stop writes on the primary and read where it stopped.
async fn freeze(c: &Cluster, p: &dyn Instance) -> Result<Target> {
    if c.config.switchover_flush_tables {
        retry_once!("flush tables", p.flush_tables())?;
    }
    retry_once!("set super read only", p.set_super_read_only(true))?;
    retry_once!("set read only", p.set_read_only(true))?;
    if c.config.move_event_scheduler {
        retry_once!("stop event scheduler", p.set_event_scheduler(false))?;
    }
    let vars = p.variables().await?;
    let gtid = if vars.gtid_mode_on {
        Some(p.gtid_sets().await?.executed_raw)
    } else {
        None
    };
    let coord = p
        .primary_status()
        .await?
        .context("binary log is off on the primary")?
        .coord();
    info!("{} frozen at {coord}", p.endpoint());
    Ok(Target { gtid, coord })
}

/// Wait for every follower to apply up to `target`, all at once.
async fn catch_up(c: &Cluster, followers: &[Endpoint], target: &Target) -> Result<()> {
    let timeout = c.config.catchup_timeout();
    let channel = c.config.channel.as_str();
    let mut futs = vec![];
    for ep in followers {
        let x = c.instance(ep)?;
        futs.push(async move {
            let done = match &target.gtid {
                Some(g) => x.wait_gtid(g, timeout).await?,
                None => wait_coord(x.as_ref(), channel, &target.coord, timeout).await,
            };
            ensure!(done, "{} did not catch up within {timeout:?}", x.endpoint());
            Ok::<(), anyhow::Error>(())
        });
    }
    for r in futures::future::join_all(futs).await {
        r?;
    }
    Ok(())
}

async fn wait_coord(x: &dyn Instance, channel: &str, coord: &BinlogCoord, timeout: Duration) -> bool {
    let poll = async {
        loop {
            if let Ok(Some(rs)) = x.replica_status(channel).await {
                if rs.relay_master_log_file == coord.file && rs.exec_master_log_pos >= coord.pos {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    tokio::time::timeout(timeout, poll).await.is_ok()
}

/// Give writes back to the old primary and return to Monitor.
async fn restore(c: &mut Cluster, p: &dyn Instance, psnap: &Snapshot, why: String) -> Result<Endpoint> {
    warn!("cluster {} switchover aborted: {why}", c.name());
    if let Err(e) = p.set_read_only(false).await {
        error!("failed to restore writes on {}: {e:#}", p.endpoint());
    }
    if !psnap.variables.super_read_only {
        if let Err(e) = p.set_super_read_only(false).await {
            error!("failed to clear super read only on {}: {e:#}", p.endpoint());
        }
    }
    if c.config.move_event_scheduler && psnap.variables.event_scheduler_on {
        if let Err(e) = p.set_event_scheduler(true).await {
            warn!("failed to restart event scheduler on {}: {e:#}", p.endpoint());
        }
    }
    c.report
        .open(code::SWITCHOVER_ABORTED, None, why.clone());
    c.transition(ClusterState::Monitor, format!("switchover aborted: {why}"));
    bail!(Error::Operator(format!("switchover aborted: {why}")))
}

/// Point a former follower, or the old primary, at the new primary.
async fn follow(
    c: &Cluster,
    ep: &Endpoint,
    winner: &Endpoint,
    old: &Endpoint,
    at: &BinlogCoord,
) -> Result<()> {
    let x = c.instance(ep)?;
    let snap = c.fresh_of(ep).context("no fresh snapshot")?;
    let wsnap = c.fresh_of(winner).context("no fresh snapshot of the new primary")?;
    let opt = match gtid_mode(&snap, &wsnap, ep == old) {
        Some(mode) => change_opt(&c.config, winner, mode, None),
        None => change_opt(&c.config, winner, ReplicationMode::Positional, Some(at.clone())),
    };
    let read_only = ep == old || c.config.read_only_replicas;
    attach(x.as_ref(), &opt, read_only).await
}

use super::*;

use crate::topology::{elect, Candidate};

/// Replace a dead primary with the best candidate.
///
/// The primary change is not rolled back once the candidate is promoted.
/// Replicas that cannot follow the new primary become orphans and are
/// reported in the crash record.
pub struct Effect<'a> {
    pub cluster: &'a mut Cluster,
}

impl Effect<'_> {
    pub async fn exec(self, old: Endpoint, mut cands: Vec<Candidate>) -> Result<()> {
        let c = self.cluster;
        let deadline = Instant::now() + c.config.failover_max();
        let channel = c.config.channel.clone();
        c.transition(ClusterState::Failover, format!("primary {old} is dead"));

        // Stop every replica from advancing further.
        let replicas: Vec<Endpoint> = c
            .topology
            .others()
            .filter(|s| s.fresh().is_some())
            .map(|s| s.endpoint.clone())
            .collect();
        for ep in &replicas {
            let x = c.instance(ep)?;
            if let Err(e) = retry_once!("stop io thread", x.stop_io_thread(&channel)) {
                warn!("failed to stop io thread on {ep}: {e:#}");
            }
        }

        // Elect on what the candidates have executed by now.
        for cand in &mut cands {
            let x = c.instance(&cand.endpoint)?;
            match x.gtid_sets().await {
                Ok(g) => cand.executed = g.executed,
                Err(e) => warn!("{} gtid read failed, using last snapshot: {e:#}", cand.endpoint),
            }
        }
        let Some(election) = elect(&cands) else {
            return abort(c, &replicas, "no candidate left").await;
        };
        let winner = election.winner.clone();
        for ep in &election.diverged {
            if let Some(s) = c.topology.get_mut(ep) {
                warn!("{ep} has transactions {winner} lacks, marked diverged");
                s.diverged = true;
            }
        }
        info!("cluster {} elects {winner} to replace {old}", c.name());
        if let Some(script) = c.config.pre_failover_script.clone() {
            hooks::run(&script, c.name(), &old, &winner).await;
        }

        let w = c.instance(&winner)?;
        let mut rec = CrashRecord::new(old.clone());
        if !wait_relay_applied(w.as_ref(), &channel, c.config.relay_apply_timeout()).await {
            rec.warnings
                .push(format!("{winner} promoted before its relay log was applied"));
        }
        let wsnap = c.fresh_of(&winner);
        if let Ok(Some(rs)) = w.replica_status(&channel).await {
            rec.old_binlog_file = rs.master_log_file.clone();
            rec.old_binlog_pos = rs.read_master_log_pos;
            rec.io_gtid = rs.gtid_io_pos.render();
        }
        if let Some(snap) = &wsnap {
            rec.semisync_was_on = snap.variables.semisync_slave_on;
            if !snap.capability.is_mariadb() {
                rec.io_gtid = snap.gtid.executed_raw.clone();
            }
        }
        match w.primary_status().await {
            Ok(Some(ps)) => {
                rec.new_binlog_file = ps.file;
                rec.new_binlog_pos = ps.pos;
            }
            Ok(None) => {}
            Err(e) => warn!("{winner} binlog position unknown: {e:#}"),
        }

        if let Err(e) = promote(w.as_ref(), &channel, c.config.move_event_scheduler).await {
            error!("promotion of {winner} failed: {e:#}");
            return abort(c, &replicas, &format!("promotion of {winner} failed: {e:#}")).await;
        }

        c.topology.set_primary(winner.clone());
        if let Some(s) = c.topology.get_mut(&old) {
            s.pending_rejoin = true;
        }
        c.last_change = Some(Instant::now());
        c.failover_count += 1;
        c.last_failover_at = Some(unix_millis());
        c.publish(EventBody::PrimaryChanged {
            old: Some(old.clone()),
            new: winner.clone(),
        });

        let others: Vec<Endpoint> = replicas.into_iter().filter(|ep| ep != &winner).collect();
        for ep in others {
            let res = if Instant::now() >= deadline {
                Err(anyhow::anyhow!("failover deadline passed"))
            } else if c.topology.get(&ep).map(|s| s.diverged).unwrap_or(false) {
                Err(anyhow::anyhow!("has transactions {winner} lacks"))
            } else {
                reattach(c, &ep, &winner).await
            };
            if let Err(e) = res {
                orphan(c, &ep, &mut rec, format!("{e:#}"));
            }
        }
        let unreachable: Vec<Endpoint> = c
            .topology
            .others()
            .filter(|s| s.endpoint != old && s.fresh().is_none() && !s.ignored)
            .map(|s| s.endpoint.clone())
            .collect();
        for ep in unreachable {
            orphan(c, &ep, &mut rec, "unreachable".to_owned());
        }
        for ep in rec.orphans.clone() {
            if let Some(s) = c.topology.get_mut(&ep) {
                s.orphan = true;
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
            format!("failover from {old} to {winner} done"),
        );
        Ok(())
    }
}

/// Restart the stopped replicas and fall back to Suspect.
async fn abort(c: &mut Cluster, replicas: &[Endpoint], why: &str) -> Result<()> {
    let channel = c.config.channel.clone();
    for ep in replicas {
        let x = c.instance(ep)?;
        if let Err(e) = x.start_replica(&channel).await {
            warn!("failed to restart replica {ep}: {e:#}");
        }
    }
    c.transition(ClusterState::Suspect, format!("failover aborted: {why}"));
    bail!("failover aborted: {why}")
}

fn orphan(c: &mut Cluster, ep: &Endpoint, rec: &mut CrashRecord, error: String) {
    warn!("cluster {} could not re-attach {ep}: {error}", c.name());
    rec.orphans.push(ep.clone());
    rec.warnings.push(format!("{ep}: {error}"));
    c.publish(EventBody::ReplicaOrphaned {
        endpoint: ep.clone(),
        error,
    });
}

/// Point a replica of the dead primary at the winner.
async fn reattach(c: &Cluster, ep: &Endpoint, winner: &Endpoint) -> Result<()> {
    let x = c.instance(ep)?;
    let w = c.instance(winner)?;
    let rsnap = c.fresh_of(ep).context("no fresh snapshot")?;
    let wsnap = c.fresh_of(winner).context("no fresh snapshot of the new primary")?;
    let opt = match gtid_mode(&rsnap, &wsnap, false) {
        Some(mode) => change_opt(&c.config, winner, mode, None),
        None => {
            let coord = pseudo_gtid_coord(x.as_ref(), w.as_ref()).await?;
            change_opt(&c.config, winner, ReplicationMode::Positional, Some(coord))
        }
    };
    attach(x.as_ref(), &opt, c.config.read_only_replicas).await
}

/// Wait until the replica applied what it received. False on timeout.
async fn wait_relay_applied(x: &dyn Instance, channel: &str, timeout: Duration) -> bool {
    let poll = async {
        loop {
            match x.replica_status(channel).await {
                Ok(Some(rs)) if rs.relay_applied() => return,
                Ok(None) => return,
                _ => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    };
    tokio::time::timeout(timeout, poll).await.is_ok()
}

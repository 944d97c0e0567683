use super::*;

use crate::replication::BinlogCoord;

/// Re-attach a demoted primary as a replica of the current primary.
///
/// A demoted primary holding transactions the new primary lacks, or
/// filtering differently, is never re-attached. Without GTIDs, that is a
/// binlog written past the coordinates the new primary had read. It is flagged for manual
/// intervention and a divergent crash record is written instead.
pub struct Effect<'a> {
    pub cluster: &'a mut Cluster,
}

impl Effect<'_> {
    pub async fn exec(self, ep: &Endpoint) -> Result<()> {
        let c = self.cluster;
        let Some(snap) = c.fresh_of(ep) else {
            c.report
                .open(code::REJOIN_DEFERRED, Some(ep), "rejoin waits for the server");
            return Ok(());
        };
        let primary = c.topology.primary().cloned();
        let Some((primary, psnap)) = primary.and_then(|p| c.fresh_of(&p).map(|s| (p, s))) else {
            c.report.open(
                code::REJOIN_DEFERRED,
                Some(ep),
                "rejoin waits for a reachable primary",
            );
            return Ok(());
        };

        if !psnap.executed().contains(snap.executed()) {
            let (extra, _) = snap.executed().diff(psnap.executed());
            let reason = format!("has transactions {primary} lacks: {extra}");
            return divergent(c, ep, &primary, reason).await;
        }
        let binlog_filters = match (&snap.primary_status, &psnap.primary_status) {
            (Some(a), Some(b)) => a.same_binlog_filters(b),
            _ => true,
        };
        if !binlog_filters || snap.variables.filters != psnap.variables.filters {
            let reason = format!("filters differ from {primary}");
            return divergent(c, ep, &primary, reason).await;
        }

        let x = c.instance(ep)?;
        let opt = match gtid_mode(&snap, &psnap, true) {
            Some(mode) => change_opt(&c.config, &primary, mode, None),
            None => {
                let rec = c.journal.last_demotion_of(ep).await?;
                let Some(rec) =
                    rec.filter(|r| !r.new_binlog_file.is_empty() && !r.old_binlog_file.is_empty())
                else {
                    return manual(c, ep, "no crash record with binlog coordinates".to_owned());
                };
                // Events logged past what the new primary had read never reached it.
                let read = BinlogCoord::new(rec.old_binlog_file, rec.old_binlog_pos);
                let lost = x.events_from(&read).await?;
                if lost > 0 {
                    let reason = format!("logged {lost} events past {read}, the last read by {primary}");
                    return divergent(c, ep, &primary, reason).await;
                }
                let coord = BinlogCoord::new(rec.new_binlog_file, rec.new_binlog_pos);
                change_opt(&c.config, &primary, ReplicationMode::Positional, Some(coord))
            }
        };
        retry_once!("set read only", x.set_read_only(true))?;
        attach(x.as_ref(), &opt, false).await?;
        if let Some(s) = c.topology.get_mut(ep) {
            s.pending_rejoin = false;
        }
        info!("cluster {} rejoined {ep} below {primary}", c.name());
        Ok(())
    }
}

fn manual(c: &mut Cluster, ep: &Endpoint, reason: String) -> Result<()> {
    warn!("cluster {} leaves {ep} to the operator: {reason}", c.name());
    if let Some(s) = c.topology.get_mut(ep) {
        s.pending_rejoin = false;
        s.needs_manual_intervention = true;
    }
    c.publish(EventBody::NeedsManualIntervention {
        endpoint: ep.clone(),
        reason,
    });
    Ok(())
}

async fn divergent(c: &mut Cluster, ep: &Endpoint, primary: &Endpoint, reason: String) -> Result<()> {
    let mut rec = CrashRecord::new(ep.clone()).with_marker(Marker::Divergent);
    rec.warnings.push(format!("primary {primary}: {reason}"));
    c.record_crash(&rec).await;
    manual(c, ep, reason)
}

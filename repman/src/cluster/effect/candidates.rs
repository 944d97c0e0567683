use super::*;

use crate::config::FailoverMode;
use crate::topology::{Candidate, Server};

/// A failover gate that held, with the state code to open.
pub type Blocked = (&'static str, String);

fn candidate(c: &Cluster, s: &Server) -> Option<Candidate> {
    let h = s.health.as_ref()?;
    let snap = h.fresh()?;
    let delay = h
        .delay(&c.config.channel)
        .or_else(|| c.delays.get(&s.endpoint).copied());
    Some(Candidate {
        endpoint: s.endpoint.clone(),
        executed: snap.executed().clone(),
        semisync: snap.variables.semisync_slave_on,
        delay,
        rank: s.rank,
    })
}

/// Why `s` cannot take over from a dead primary.
fn failover_exclusion(c: &Cluster, s: &Server, old: &Endpoint) -> Option<String> {
    if s.ignored {
        return Some("ignored".to_owned());
    }
    if s.diverged || s.orphan || s.needs_manual_intervention || s.pending_rejoin {
        return Some("flagged".to_owned());
    }
    let Some(h) = s.health.as_ref().filter(|h| h.fresh().is_some()) else {
        return Some("no fresh snapshot".to_owned());
    };
    if !h.prereq_ok() {
        return Some("binary log is off".to_owned());
    }
    if !h.replica_healthy_without_primary() {
        return Some("replication is broken".to_owned());
    }
    let follows = h
        .fresh()
        .and_then(|snap| snap.replica(&c.config.channel))
        .map(|r| r.points_at(old))
        .unwrap_or(false);
    if !follows {
        return Some(format!("does not replicate from {old}"));
    }
    if let Some(p) = c.topology.get(old).and_then(|p| p.last_snapshot()) {
        if s.fresh().map(|snap| snap.variables.filters != p.variables.filters).unwrap_or(true) {
            return Some("replication filters differ".to_owned());
        }
    }
    if !h.semisync_replica_ok(c.config.require_semisync_failover) {
        return Some("not a semi-sync replica".to_owned());
    }
    let max = c.config.max_delay_secs;
    if max > 0 {
        let delay = h
            .delay(&c.config.channel)
            .or_else(|| c.delays.get(&s.endpoint).copied());
        match delay {
            Some(d) if d <= max => {}
            Some(d) => return Some(format!("{d}s behind")),
            None => return Some("delay unknown".to_owned()),
        }
    }
    None
}

/// True if some replica still hears from `old`.
fn primary_still_alive(c: &Cluster, old: &Endpoint) -> Option<String> {
    for s in c.topology.others() {
        let Some(r) = s.fresh().and_then(|snap| snap.replica(&c.config.channel)) else {
            continue;
        };
        if !r.points_at(old) {
            continue;
        }
        if r.io_running && r.last_io_errno == 0 {
            return Some(format!("{} still reads from {old}", s.endpoint));
        }
        let before = c.heartbeats.get(&s.endpoint).copied().unwrap_or(u64::MAX);
        if r.received_heartbeats > before {
            return Some(format!("{} still receives heartbeats from {old}", s.endpoint));
        }
    }
    None
}

/// Evaluate the failover gates in order and return the candidates.
pub fn failover_candidates(c: &Cluster, old: &Endpoint) -> std::result::Result<Vec<Candidate>, Blocked> {
    if c.config.failover_mode == FailoverMode::Manual {
        return Err((code::MANUAL_MODE, "failover mode is manual".to_owned()));
    }
    let limit = c.config.failover_limit;
    if limit > 0 && c.failover_count >= limit {
        return Err((
            code::FAILOVER_LIMIT,
            format!("failover limit {limit} reached"),
        ));
    }
    if c.config.false_positive_check {
        if let Some(why) = primary_still_alive(c, old) {
            return Err((code::FALSE_POSITIVE, why));
        }
    }
    let mut out = vec![];
    let mut skipped = vec![];
    for s in c.topology.others() {
        match failover_exclusion(c, s, old) {
            None => out.extend(candidate(c, s)),
            Some(why) => skipped.push(format!("{}: {why}", s.endpoint)),
        }
    }
    if out.is_empty() {
        return Err((
            code::NO_CANDIDATE,
            format!("no failover candidate ({})", skipped.join(", ")),
        ));
    }
    for why in &skipped {
        debug!("cluster {} skips {why}", c.name());
    }
    Ok(out)
}

/// Replicas of the live primary `old` that can take over.
pub fn switchover_candidates(c: &Cluster, old: &Endpoint) -> Result<Vec<Candidate>> {
    let psnap = c
        .fresh_of(old)
        .ok_or_else(|| Error::Operator(format!("primary {old} has no fresh snapshot")))?;
    let mut out = vec![];
    for s in c.topology.others() {
        if s.ignored || s.diverged || s.orphan || s.needs_manual_intervention {
            continue;
        }
        let Some(h) = &s.health else { continue };
        let ok = h.prereq_ok()
            && h.replica_healthy()
            && h.filters_consistent_with(&psnap)
            && h.fresh()
                .and_then(|snap| snap.replica(&c.config.channel))
                .map(|r| r.points_at(old))
                .unwrap_or(false);
        if ok {
            out.extend(candidate(c, s));
        }
    }
    ensure!(
        !out.is_empty(),
        Error::Operator("no switchover candidate".to_owned())
    );
    Ok(out)
}

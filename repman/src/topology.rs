use super::*;

use crate::config::ClusterConfig;
use crate::gtid::GtidList;
use crate::health::{HealthRecord, Snapshot};
use crate::replication::GtidSets;
use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
pub enum Role {
    #[display("primary")]
    Primary,
    #[display("replica")]
    Replica,
    #[display("standalone")]
    Standalone,
    #[display("unknown")]
    Unknown,
    #[display("failed")]
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
pub enum Shape {
    #[display("single-tier")]
    SingleTier,
    #[display("multi-source")]
    MultiSource,
    #[display("relay-chain")]
    RelayChain,
    #[display("unknown")]
    Unknown,
    #[display("split-brain")]
    InSplitBrain,
}

#[derive(Clone, Debug)]
pub struct Server {
    pub endpoint: Endpoint,
    pub rank: i32,
    pub ignored: bool,
    pub role: Role,
    pub health: Option<HealthRecord>,
    /// Executed set ahead of the primary's.
    pub diverged: bool,
    /// Could not be re-attached during a failover.
    pub orphan: bool,
    pub needs_manual_intervention: bool,
    /// Demoted primary waiting to be rejoined.
    pub pending_rejoin: bool,
}

impl Server {
    pub fn fresh(&self) -> Option<&Snapshot> {
        self.health.as_ref().and_then(|h| h.fresh())
    }

    /// Last good snapshot, possibly stale.
    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.health.as_ref().and_then(|h| h.snapshot.as_ref())
    }

    pub fn reachable(&self) -> bool {
        self.health.as_ref().map(|h| h.reachable).unwrap_or(false)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.health.as_ref().and_then(|h| h.last_error.as_deref())
    }

    /// Endpoints this server replicates from, per fresh snapshot.
    fn upstreams(&self) -> Vec<(String, u16)> {
        match self.fresh() {
            Some(s) => s
                .replicas
                .iter()
                .map(|r| (r.master_host.clone(), r.master_port))
                .collect(),
            None => vec![],
        }
    }
}

/// Value copy of a server for readers outside the worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerView {
    pub endpoint: Endpoint,
    pub role: Role,
    pub reachable: bool,
    pub stale: bool,
    pub last_error: Option<String>,
    pub executed_gtid: String,
    pub delay: Option<u64>,
    pub read_only: bool,
    pub diverged: bool,
    pub orphan: bool,
    pub needs_manual_intervention: bool,
    pub ignored: bool,
}

/// Broken topology invariant.
#[derive(Clone, Debug, PartialEq, Eq, derive_more::Display)]
pub enum Violation {
    #[display("more than one primary: {_0:?}")]
    SplitBrain(Vec<Endpoint>),
    #[display("{_0} does not replicate from the primary")]
    Detached(Endpoint),
    #[display("{_0} replicates from {_1}")]
    WrongPrimary(Endpoint, String),
    #[display("{_0} is ahead of the primary")]
    Ahead(Endpoint),
}

impl Violation {
    /// Stable code for the state log.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SplitBrain(_) => "ERR00021",
            Self::Detached(_) => "ERR00022",
            Self::WrongPrimary(..) => "ERR00023",
            Self::Ahead(_) => "ERR00024",
        }
    }
}

/// In-memory graph of one cluster.
///
/// Edges are not stored. They are read from the `(Master_Host, Master_Port)`
/// of each replica status.
pub struct Topology {
    servers: Vec<Server>,
    index: HashMap<Endpoint, usize>,
    primary: Option<Endpoint>,
    shape: Shape,
    relay_allowed: bool,
}

impl Topology {
    pub fn new(config: &ClusterConfig) -> Self {
        let servers: Vec<Server> = config
            .servers
            .iter()
            .map(|s| Server {
                endpoint: s.endpoint.clone(),
                rank: s.rank,
                ignored: s.ignored,
                role: Role::Unknown,
                health: None,
                diverged: false,
                orphan: false,
                needs_manual_intervention: false,
                pending_rejoin: false,
            })
            .collect();
        let index = servers
            .iter()
            .enumerate()
            .map(|(i, s)| (s.endpoint.clone(), i))
            .collect();
        Self {
            servers,
            index,
            primary: None,
            shape: Shape::Unknown,
            relay_allowed: config.relay_topology,
        }
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<&Server> {
        self.index.get(endpoint).map(|&i| &self.servers[i])
    }

    pub fn get_mut(&mut self, endpoint: &Endpoint) -> Option<&mut Server> {
        self.index.get(endpoint).map(|&i| &mut self.servers[i])
    }

    pub fn primary(&self) -> Option<&Endpoint> {
        self.primary.as_ref()
    }

    pub fn primary_server(&self) -> Option<&Server> {
        self.primary.as_ref().and_then(|p| self.get(p))
    }

    pub fn set_primary(&mut self, endpoint: Endpoint) {
        if let Some(old) = self.primary.take() {
            if let Some(s) = self.get_mut(&old) {
                if s.role == Role::Primary {
                    s.role = Role::Unknown;
                }
            }
        }
        if let Some(s) = self.get_mut(&endpoint) {
            s.role = Role::Primary;
            s.orphan = false;
            s.pending_rejoin = false;
        }
        self.primary = Some(endpoint);
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Servers other than the primary.
    pub fn others(&self) -> impl Iterator<Item = &Server> {
        let primary = self.primary.clone();
        self.servers
            .iter()
            .filter(move |s| Some(&s.endpoint) != primary.as_ref())
    }

    fn pointed_at(&self, target: &Endpoint) -> bool {
        self.servers.iter().any(|s| {
            s.endpoint != *target
                && s
                    .upstreams()
                    .iter()
                    .any(|(h, p)| target.matches(h, *p))
        })
    }

    fn find_endpoint(&self, host: &str, port: u16) -> Option<&Server> {
        self.servers.iter().find(|s| s.endpoint.matches(host, port))
    }

    /// Take a new round of health records and derive roles and shape.
    pub fn observe(&mut self, mut records: HashMap<Endpoint, HealthRecord>) {
        for s in &mut self.servers {
            if let Some(rec) = records.remove(&s.endpoint) {
                s.health = Some(rec);
            }
        }

        let roles: Vec<Role> = self
            .servers
            .iter()
            .map(|s| self.derive_role(s))
            .collect();
        for (s, role) in self.servers.iter_mut().zip(roles) {
            s.role = role;
        }

        if self.primary.is_none() {
            let roots: Vec<Endpoint> = self
                .servers
                .iter()
                .filter(|s| s.role == Role::Primary)
                .map(|s| s.endpoint.clone())
                .collect();
            if let [root] = roots.as_slice() {
                info!("discovered primary {root}");
                self.primary = Some(root.clone());
            }
        }

        self.clear_settled_flags();
        self.shape = self.classify();
    }

    fn derive_role(&self, s: &Server) -> Role {
        let Some(h) = &s.health else {
            return Role::Unknown;
        };
        if !h.reachable {
            return Role::Failed;
        }
        let Some(snap) = h.fresh() else {
            return s.role;
        };
        if !snap.replicas.is_empty() {
            return Role::Replica;
        }
        let is_known = self.primary.as_ref() == Some(&s.endpoint);
        if is_known || self.pointed_at(&s.endpoint) {
            Role::Primary
        } else if self.primary.is_none() && !snap.variables.read_only {
            Role::Primary
        } else {
            Role::Standalone
        }
    }

    /// Flags an operator repaired are cleared once the server is a healthy
    /// replica of the primary again.
    fn clear_settled_flags(&mut self) {
        let Some(primary) = self.primary.clone() else {
            return;
        };
        let Some(pexec) = self
            .get(&primary)
            .and_then(|p| p.fresh())
            .map(|s| s.executed().clone())
        else {
            return;
        };
        for s in &mut self.servers {
            if s.endpoint == primary {
                continue;
            }
            let Some(h) = &s.health else { continue };
            let settled = h.replica_healthy()
                && h.fresh()
                    .map(|snap| {
                        snap.replicas.iter().all(|r| r.points_at(&primary))
                            && pexec.contains(snap.executed())
                    })
                    .unwrap_or(false);
            if settled && (s.orphan || s.diverged || s.needs_manual_intervention) {
                info!("{} is a healthy replica again", s.endpoint);
                s.orphan = false;
                s.diverged = false;
                s.needs_manual_intervention = false;
            }
        }
    }

    fn classify(&self) -> Shape {
        let roots: Vec<&Server> = self
            .servers
            .iter()
            .filter(|s| s.role != Role::Replica && self.pointed_at(&s.endpoint))
            .collect();
        if roots.len() > 1 {
            return Shape::InSplitBrain;
        }

        let replicas: Vec<&Server> = self
            .servers
            .iter()
            .filter(|s| s.role == Role::Replica)
            .collect();
        let multi = replicas.iter().any(|s| {
            let mut ups = s.upstreams();
            ups.sort();
            ups.dedup();
            ups.len() > 1
        });
        if multi {
            return Shape::MultiSource;
        }
        let relay = replicas.iter().any(|s| {
            s.upstreams().iter().any(|(h, p)| {
                self.find_endpoint(h, *p)
                    .map(|up| up.role == Role::Replica)
                    .unwrap_or(false)
            })
        });
        if relay {
            return Shape::RelayChain;
        }
        match roots.as_slice() {
            [root] if replicas
                .iter()
                .all(|s| s.upstreams().iter().all(|(h, p)| root.endpoint.matches(h, *p))) =>
            {
                Shape::SingleTier
            }
            _ => Shape::Unknown,
        }
    }

    /// Check the settled-state invariants. Replicas ahead of the primary
    /// are marked diverged.
    pub fn check(&mut self) -> Vec<Violation> {
        let mut out = vec![];
        let primaries: Vec<Endpoint> = self
            .servers
            .iter()
            .filter(|s| s.role == Role::Primary)
            .map(|s| s.endpoint.clone())
            .collect();
        if primaries.len() > 1 || self.shape == Shape::InSplitBrain {
            out.push(Violation::SplitBrain(primaries));
        }

        let Some(primary) = self.primary.clone() else {
            return out;
        };
        if self.get(&primary).and_then(|p| p.fresh()).is_none() {
            return out;
        }

        let relay_allowed = self.relay_allowed;
        for s in self.others() {
            if s.ignored || s.orphan || s.needs_manual_intervention || s.pending_rejoin {
                continue;
            }
            let Some(snap) = s.fresh() else { continue };
            if s.role == Role::Replica {
                for r in &snap.replicas {
                    if r.points_at(&primary) {
                        continue;
                    }
                    let via_relay = relay_allowed
                        && self
                            .find_endpoint(&r.master_host, r.master_port)
                            .map(|up| up.role == Role::Replica)
                            .unwrap_or(false);
                    if !via_relay {
                        out.push(Violation::WrongPrimary(
                            s.endpoint.clone(),
                            format!("{}:{}", r.master_host, r.master_port),
                        ));
                    }
                }
            } else if s.role == Role::Standalone {
                out.push(Violation::Detached(s.endpoint.clone()));
            }
        }
        for e in self.replicas_ahead() {
            if let Some(s) = self.get_mut(&e) {
                if !s.diverged {
                    warn!("{e} is ahead of the primary, marked diverged");
                }
                s.diverged = true;
            }
            out.push(Violation::Ahead(e));
        }
        out
    }

    /// Watched replicas whose executed set the primary's does not cover.
    pub fn replicas_ahead(&self) -> Vec<Endpoint> {
        let Some(pexec) = self
            .primary_server()
            .and_then(|p| p.fresh())
            .map(|s| s.executed())
        else {
            return vec![];
        };
        self.others()
            .filter(|s| {
                s.role == Role::Replica
                    && !(s.ignored || s.orphan || s.needs_manual_intervention || s.pending_rejoin)
            })
            .filter(|s| {
                s.fresh()
                    .map(|snap| !pexec.contains(snap.executed()))
                    .unwrap_or(false)
            })
            .map(|s| s.endpoint.clone())
            .collect()
    }

    /// Replace the GTID sets of the primary's fresh snapshot with a later read.
    pub fn refresh_primary_gtid(&mut self, gtid: GtidSets) {
        let Some(primary) = self.primary.clone() else {
            return;
        };
        let snap = self
            .get_mut(&primary)
            .and_then(|s| s.health.as_mut())
            .filter(|h| !h.stale)
            .and_then(|h| h.snapshot.as_mut());
        if let Some(snap) = snap {
            snap.gtid = gtid;
        }
    }

    pub fn views(&self) -> Vec<ServerView> {
        let channel_delay = |s: &Server| {
            s.fresh()
                .and_then(|snap| snap.replicas.first())
                .and_then(|r| r.seconds_behind_master)
        };
        self.servers
            .iter()
            .map(|s| ServerView {
                endpoint: s.endpoint.clone(),
                role: s.role,
                reachable: s.reachable(),
                stale: s.health.as_ref().map(|h| h.stale).unwrap_or(true),
                last_error: s.last_error().map(|e| e.to_owned()),
                executed_gtid: s
                    .last_snapshot()
                    .map(|snap| snap.executed().render())
                    .unwrap_or_default(),
                delay: channel_delay(s),
                read_only: s
                    .last_snapshot()
                    .map(|snap| snap.variables.read_only)
                    .unwrap_or(false),
                diverged: s.diverged,
                orphan: s.orphan,
                needs_manual_intervention: s.needs_manual_intervention,
                ignored: s.ignored,
            })
            .collect()
    }
}

/// What candidate selection needs to know about one server.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub endpoint: Endpoint,
    pub executed: GtidList,
    pub semisync: bool,
    pub delay: Option<u64>,
    pub rank: i32,
}

/// Outcome of candidate selection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Election {
    pub winner: Endpoint,
    /// Candidates with transactions the winner lacks.
    pub diverged: Vec<Endpoint>,
}

/// Pick the candidate with the greatest executed set.
///
/// Candidates strictly contained in another are dropped first. The rest are
/// ordered by sequence sum, semi-sync, delay, rank and endpoint.
pub fn elect(cands: &[Candidate]) -> Option<Election> {
    let dominated = |c: &Candidate| {
        cands
            .iter()
            .any(|o| o.executed.compare(&c.executed) == Some(Ordering::Greater))
    };
    let winner = cands
        .iter()
        .filter(|c| !dominated(c))
        .min_by_key(|c| {
            (
                Reverse(c.executed.seq_sum()),
                Reverse(c.semisync),
                c.delay.unwrap_or(u64::MAX),
                c.rank,
                c.endpoint.to_string(),
            )
        })?;
    let diverged = cands
        .iter()
        .filter(|c| c.endpoint != winner.endpoint && !winner.executed.contains(&c.executed))
        .map(|c| c.endpoint.clone())
        .collect();
    Some(Election {
        winner: winner.endpoint.clone(),
        diverged,
    })
}

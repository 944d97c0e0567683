use super::*;

use crate::arbitration::{Arbitrator, Observation};
use crate::bus::{Bus, Event, EventBody};
use crate::config::ClusterConfig;
use crate::health::{self, HealthRecord, Snapshot};
use crate::journal::{CrashRecord, Journal, Marker};
use crate::replication::{Connector, Instance};
use crate::topology::{Role, ServerView, Shape, Topology, Violation};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::Instant;

pub mod effect;
mod hooks;
mod statelog;
pub mod thread;

pub use statelog::{code, OpenState, Report, StateLog};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
pub enum ClusterState {
    #[display("monitor")]
    Monitor,
    #[display("suspect")]
    Suspect,
    #[display("failover")]
    Failover,
    #[display("switchover")]
    Switchover,
    #[display("rejoin")]
    Rejoin,
    #[display("frozen")]
    Frozen,
}

pub type SwitchoverResult = std::result::Result<Endpoint, Error>;

/// Completion of an accepted switchover.
pub type SwitchoverTicket = oneshot::Receiver<SwitchoverResult>;

pub(crate) enum Command {
    Freeze,
    Unfreeze,
    Switchover {
        preferred: Option<Endpoint>,
        reply: oneshot::Sender<SwitchoverResult>,
    },
}

/// Value copy of a cluster, published after every tick.
#[derive(Clone, Debug, Serialize)]
pub struct ClusterStatus {
    pub name: String,
    pub state: ClusterState,
    pub reason: String,
    pub elected_primary: Option<Endpoint>,
    pub lease_holder_uid: Option<u32>,
    /// Unix millis.
    pub last_transition_at: u64,
    pub shape: Shape,
    pub servers: Vec<ServerView>,
    pub open_states: Vec<OpenState>,
    pub failover_count: u32,
    pub last_failover_at: Option<u64>,
}

impl ClusterStatus {
    fn initial(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            state: ClusterState::Monitor,
            reason: "starting".to_owned(),
            elected_primary: None,
            lease_holder_uid: None,
            last_transition_at: unix_millis(),
            shape: Shape::Unknown,
            servers: vec![],
            open_states: vec![],
            failover_count: 0,
            last_failover_at: None,
        }
    }
}

/// Part of a cluster visible outside its worker.
pub struct ClusterShared {
    name: String,
    status: spin::RwLock<ClusterStatus>,
    observation: spin::RwLock<Option<Observation>>,
    commands: spin::Mutex<VecDeque<Command>>,
    switchover_busy: AtomicBool,
}

impl ClusterShared {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            status: spin::RwLock::new(ClusterStatus::initial(name)),
            observation: spin::RwLock::new(None),
            commands: spin::Mutex::new(VecDeque::new()),
            switchover_busy: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ClusterStatus {
        self.status.read().clone()
    }

    /// What the worker last saw, unless the cluster is frozen.
    pub fn observation(&self) -> Option<Observation> {
        self.observation.read().clone()
    }

    pub fn freeze(&self) {
        self.commands.lock().push_back(Command::Freeze);
    }

    pub fn unfreeze(&self) {
        self.commands.lock().push_back(Command::Unfreeze);
    }

    /// Queue a switchover. Fails with `Busy` while another one is pending.
    pub fn switchover(&self, preferred: Option<Endpoint>) -> Result<SwitchoverTicket> {
        if self
            .switchover_busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            bail!(Error::Busy(format!("switchover of {} in progress", self.name)));
        }
        let (tx, rx) = oneshot::channel();
        self.commands.lock().push_back(Command::Switchover {
            preferred,
            reply: tx,
        });
        Ok(rx)
    }
}

/// Collaborators of a cluster worker.
#[derive(Clone)]
pub struct Deps {
    pub connector: Arc<dyn Connector>,
    pub arbitrator: Arc<Arbitrator>,
    pub journal: Arc<Journal>,
    pub bus: Arc<Bus>,
}

/// State of one cluster, owned by its worker.
///
/// Every transition happens inside `tick`, so transitions of one cluster
/// are totally ordered.
pub struct Cluster {
    config: ClusterConfig,
    instances: HashMap<Endpoint, Arc<dyn Instance>>,
    topology: Topology,
    state: ClusterState,
    reason: String,
    last_transition_at: u64,

    /// Consecutive ticks the primary was seen down.
    fail_count: u32,
    /// Ticks spent in Suspect.
    suspect_ticks: u32,
    /// Last primary change, for the cooldown.
    last_change: Option<Instant>,
    rejoin_since: Option<Instant>,
    failover_count: u32,
    last_failover_at: Option<u64>,
    /// Received heartbeats per replica at the last tick.
    heartbeats: HashMap<Endpoint, u64>,
    /// Last known replication delay per replica.
    delays: HashMap<Endpoint, u64>,
    lease_holder: Option<u32>,
    pending_switchover: Option<(Option<Endpoint>, oneshot::Sender<SwitchoverResult>)>,

    statelog: StateLog,
    report: Report,

    arbitrator: Arc<Arbitrator>,
    journal: Arc<Journal>,
    bus: Arc<Bus>,
    shared: Arc<ClusterShared>,
}

impl Cluster {
    pub fn new(config: ClusterConfig, deps: Deps) -> Self {
        let instances = config
            .servers
            .iter()
            .map(|s| (s.endpoint.clone(), deps.connector.connect(&s.endpoint)))
            .collect();
        let topology = Topology::new(&config);
        let shared = Arc::new(ClusterShared::new(&config.name));
        Self {
            instances,
            topology,
            state: ClusterState::Monitor,
            reason: "starting".to_owned(),
            last_transition_at: unix_millis(),
            fail_count: 0,
            suspect_ticks: 0,
            last_change: None,
            rejoin_since: None,
            failover_count: 0,
            last_failover_at: None,
            heartbeats: HashMap::new(),
            delays: HashMap::new(),
            lease_holder: None,
            pending_switchover: None,
            statelog: StateLog::default(),
            report: Report::default(),
            arbitrator: deps.arbitrator,
            journal: deps.journal,
            bus: deps.bus,
            shared,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn shared(&self) -> Arc<ClusterShared> {
        self.shared.clone()
    }

    pub fn state(&self) -> ClusterState {
        self.state
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn arbitrator(&self) -> Arc<Arbitrator> {
        self.arbitrator.clone()
    }

    fn instance(&self, endpoint: &Endpoint) -> Result<Arc<dyn Instance>> {
        self.instances
            .get(endpoint)
            .cloned()
            .ok_or_else(|| Error::ServerNotFound(endpoint.clone()).into())
    }

    fn publish(&self, body: EventBody) {
        self.bus.publish(Event::new(self.name(), body));
    }

    fn transition(&mut self, to: ClusterState, reason: impl Into<String>) {
        let reason = reason.into();
        let from = self.state;
        if from == to {
            self.reason = reason;
            return;
        }
        info!("cluster {} state -> {to} ({reason})", self.name());
        self.state = to;
        self.reason = reason.clone();
        self.last_transition_at = unix_millis();
        match to {
            ClusterState::Suspect => self.suspect_ticks = 0,
            ClusterState::Rejoin => self.rejoin_since = Some(Instant::now()),
            ClusterState::Monitor => self.fail_count = 0,
            _ => {}
        }
        self.publish(EventBody::Transition { from, to, reason });
        self.publish_status();
    }

    fn publish_status(&self) {
        let status = ClusterStatus {
            name: self.name().to_owned(),
            state: self.state,
            reason: self.reason.clone(),
            elected_primary: self.topology.primary().cloned(),
            lease_holder_uid: self.lease_holder,
            last_transition_at: self.last_transition_at,
            shape: self.topology.shape(),
            servers: self.topology.views(),
            open_states: self.statelog.open_states(),
            failover_count: self.failover_count,
            last_failover_at: self.last_failover_at,
        };
        *self.shared.status.write() = status;
    }

    fn in_cooldown(&self) -> bool {
        self.last_change
            .map(|t| t.elapsed() < self.config.cooldown())
            .unwrap_or(false)
    }

    fn observation(&self) -> Observation {
        let servers = self.topology.servers();
        let seen = servers.iter().filter(|s| s.reachable()).count() as u32;
        Observation {
            hosts_seen: seen,
            hosts_failed: servers.len() as u32 - seen,
            primary: self.topology.primary().cloned(),
        }
    }

    /// Health of the primary: (up, unrecoverable fault, critical fault).
    fn primary_health(&self) -> (bool, bool, bool) {
        let Some(h) = self
            .topology
            .primary_server()
            .and_then(|s| s.health.as_ref())
        else {
            return (false, false, false);
        };
        let up = h.reachable && h.fresh().is_some();
        (up, h.unrecoverable(), h.is_critical())
    }

    /// Publish the heartbeat and ask for the lease in the same tick.
    async fn acquire_lease(&mut self) -> bool {
        let obs = self.observation();
        self.arbitrator.publish_heartbeat(&obs).await;
        match self.arbitrator.request_election(&obs).await {
            Ok(()) => true,
            Err(e) => {
                debug!("cluster {} lease not granted: {e:#}", self.name());
                self.report
                    .open(code::NO_LEASE, None, format!("lease not held: {e:#}"));
                false
            }
        }
    }

    fn drain_commands(&mut self) {
        let cmds: Vec<Command> = self.shared.commands.lock().drain(..).collect();
        for cmd in cmds {
            match cmd {
                Command::Freeze => {
                    if self.state != ClusterState::Frozen {
                        self.transition(ClusterState::Frozen, "operator freeze");
                    }
                }
                Command::Unfreeze => {
                    if self.state == ClusterState::Frozen {
                        self.transition(ClusterState::Monitor, "operator unfreeze");
                    }
                }
                Command::Switchover { preferred, reply } => {
                    self.pending_switchover = Some((preferred, reply));
                }
            }
        }
    }

    /// One round of observation and decision.
    pub async fn tick(&mut self) {
        self.report = Report::default();
        self.drain_commands();

        let prev: HashMap<Endpoint, HealthRecord> = self
            .topology
            .servers()
            .iter()
            .filter_map(|s| s.health.clone().map(|h| (s.endpoint.clone(), h)))
            .collect();
        let instances: Vec<Arc<dyn Instance>> = self.instances.values().cloned().collect();
        let records = health::evaluate_all(
            &instances,
            self.config.probe_concurrency,
            self.config.ping_timeout(),
            &prev,
        )
        .await;
        self.topology.observe(records);
        self.reread_primary_gtid().await;
        let violations = self.topology.check();
        self.note_servers(&violations);

        match self.state {
            ClusterState::Frozen => {
                self.report.open(code::FROZEN, None, "cluster is frozen");
            }
            ClusterState::Monitor => self.on_monitor(violations).await,
            ClusterState::Suspect => self.on_suspect().await,
            ClusterState::Rejoin => self.on_rejoin().await,
            // Both run to completion inside the tick that started them.
            ClusterState::Failover | ClusterState::Switchover => {
                self.transition(ClusterState::Rejoin, "resume after interrupted transition");
            }
        }

        if let Some((preferred, reply)) = self.pending_switchover.take() {
            let res = if self.state == ClusterState::Monitor {
                effect::switchover::Effect { cluster: self }
                    .exec(preferred)
                    .await
            } else {
                Err(Error::Operator(format!("cluster is {}", self.state)).into())
            };
            let res = res.map_err(|e| match Error::find(&e) {
                Some(x) => x.clone(),
                None => Error::Operator(format!("{e:#}")),
            });
            if let Err(e) = &res {
                warn!("cluster {} switchover rejected: {e}", self.name());
            }
            reply.send(res).ok();
            self.shared.switchover_busy.store(false, Ordering::SeqCst);
        }

        self.remember_replicas();
        *self.shared.observation.write() = if self.state == ClusterState::Frozen {
            None
        } else {
            Some(self.observation())
        };
        self.lease_holder = match self.arbitrator.lease_holder().await {
            Ok(x) => x,
            Err(e) => {
                debug!("cluster {} lease holder unknown: {e:#}", self.name());
                None
            }
        };
        self.flush_report();
        self.publish(EventBody::Tick { state: self.state });
        self.publish_status();
    }

    fn flush_report(&mut self) {
        let report = std::mem::take(&mut self.report);
        let (opened, resolved) = self.statelog.update(report);
        for st in opened {
            if st.code.starts_with("ERR") {
                warn!("cluster {} {st}", self.name());
            } else {
                info!("cluster {} {st}", self.name());
            }
            self.publish(EventBody::StateOpened {
                code: st.code.clone(),
                message: st.to_string(),
            });
        }
        for st in resolved {
            info!("cluster {} resolved {st}", self.name());
            self.publish(EventBody::StateResolved { code: st.code });
        }
    }

    /// Servers are read concurrently, so a replica can hold a transaction
    /// the primary committed after its own read. Read the primary again
    /// before any replica is judged ahead of it.
    async fn reread_primary_gtid(&mut self) {
        if self.topology.replicas_ahead().is_empty() {
            return;
        }
        let Some(primary) = self.topology.primary().cloned() else {
            return;
        };
        let Ok(x) = self.instance(&primary) else {
            return;
        };
        match x.gtid_sets().await {
            Ok(gtid) => self.topology.refresh_primary_gtid(gtid),
            Err(e) => debug!("cluster {} cannot re-read {primary}: {e:#}", self.name()),
        }
    }

    /// Per-server states: reachability, replica health and flags.
    fn note_servers(&mut self, violations: &[Violation]) {
        let primary = self.topology.primary().cloned();
        let psnap = self.topology.primary_server().and_then(|s| s.fresh()).cloned();
        for s in self.topology.servers() {
            let ep = Some(&s.endpoint);
            if !s.reachable() && s.health.is_some() {
                let msg = s.last_error().unwrap_or("unreachable").to_owned();
                if primary.as_ref() == ep {
                    self.report.open(code::PRIMARY_DOWN, ep, msg);
                } else {
                    self.report.open(code::SERVER_DOWN, ep, msg);
                }
            }
            if s.orphan {
                self.report.open(code::ORPHAN, ep, "not re-attached after failover");
            }
            if s.needs_manual_intervention {
                self.report
                    .open(code::MANUAL_INTERVENTION, ep, "needs manual intervention");
            }
            if s.pending_rejoin && !s.reachable() {
                self.report
                    .open(code::REJOIN_DEFERRED, ep, "rejoin waits for the server");
            }
            if s.role == Role::Replica {
                if let Some(h) = &s.health {
                    if !h.replica_healthy() {
                        self.report
                            .open(code::REPLICA_UNHEALTHY, ep, "replication is not running");
                    }
                    if let Some(p) = &psnap {
                        if h.fresh().is_some() && !h.filters_consistent_with(p) {
                            self.report
                                .open(code::FILTERS_DIFFER, ep, "filters differ from the primary");
                        }
                    }
                }
            }
        }
        for v in violations {
            let subject = match v {
                Violation::SplitBrain(_) => None,
                Violation::Detached(e) | Violation::WrongPrimary(e, _) | Violation::Ahead(e) => {
                    Some(e)
                }
            };
            self.report.open(v.code(), subject, v.to_string());
        }
    }

    fn remember_replicas(&mut self) {
        let ch = self.config.channel.clone();
        for s in self.topology.servers() {
            let Some(r) = s.fresh().and_then(|snap| snap.replica(&ch)) else {
                continue;
            };
            self.heartbeats
                .insert(s.endpoint.clone(), r.received_heartbeats);
            if let Some(d) = r.seconds_behind_master {
                self.delays.insert(s.endpoint.clone(), d);
            }
        }
    }

    async fn on_monitor(&mut self, violations: Vec<Violation>) {
        let Some(primary) = self.topology.primary().cloned() else {
            self.report.open(code::NO_PRIMARY, None, "no primary discovered");
            return;
        };
        let (up, fault, critical) = self.primary_health();
        if up && !fault {
            self.fail_count = 0;
            let read_only = self
                .topology
                .primary_server()
                .and_then(|s| s.fresh())
                .map(|snap| snap.variables.read_only)
                .unwrap_or(false);
            if read_only {
                self.report.open(
                    code::PRIMARY_READ_ONLY,
                    Some(&primary),
                    "primary is read only",
                );
            }
            self.acquire_lease().await;
            if self.on_violations(&primary, violations).await {
                return;
            }
            self.rejoin_pending().await;
            effect::enforce::Effect { cluster: self }.exec().await;
            return;
        }

        if fault {
            let msg = self
                .topology
                .primary_server()
                .and_then(|s| s.last_error())
                .unwrap_or("unrecoverable fault")
                .to_owned();
            self.report.open(code::PRIMARY_FAULT, Some(&primary), msg.clone());
            if critical || !self.in_cooldown() {
                self.transition(
                    ClusterState::Suspect,
                    format!("unrecoverable fault on primary {primary}: {msg}"),
                );
                return;
            }
        } else {
            self.fail_count += 1;
            debug!(
                "cluster {} primary {primary} down for {} ticks",
                self.name(),
                self.fail_count
            );
        }
        if self.in_cooldown() && !critical {
            self.report
                .open(code::COOLDOWN, None, "primary change cooldown in effect");
            return;
        }
        if self.fail_count >= self.config.n_suspect {
            self.transition(
                ClusterState::Suspect,
                format!(
                    "primary {primary} unreachable for {} ticks",
                    self.fail_count
                ),
            );
        }
    }

    /// A newly broken invariant forces Suspect and writes a suspect record.
    async fn on_violations(&mut self, primary: &Endpoint, violations: Vec<Violation>) -> bool {
        let fresh = violations.into_iter().find(|v| {
            let subject = match v {
                Violation::SplitBrain(_) => None,
                Violation::Detached(e) | Violation::WrongPrimary(e, _) | Violation::Ahead(e) => {
                    Some(e)
                }
            };
            !self.statelog.is_open(v.code(), subject)
        });
        let Some(v) = fresh else {
            return false;
        };
        warn!("cluster {} consistency fault: {v}", self.name());
        let mut rec = CrashRecord::new(primary.clone()).with_marker(Marker::Suspect);
        rec.warnings.push(v.to_string());
        self.record_crash(&rec).await;
        self.transition(ClusterState::Suspect, format!("consistency fault: {v}"));
        true
    }

    pub(crate) async fn record_crash(&mut self, rec: &CrashRecord) {
        match self.journal.append(rec).await {
            Ok(name) => self.publish(EventBody::CrashRecorded {
                name,
                marker: rec.marker,
            }),
            Err(e) => {
                error!("cluster {} failed to write crash record: {e:#}", self.name());
                self.report
                    .open(code::JOURNAL, None, format!("crash journal: {e:#}"));
            }
        }
    }

    async fn on_suspect(&mut self) {
        let Some(primary) = self.topology.primary().cloned() else {
            self.transition(ClusterState::Monitor, "no primary to watch");
            return;
        };
        let (up, fault, critical) = self.primary_health();
        if up && !fault {
            let read_only = self
                .topology
                .primary_server()
                .and_then(|s| s.fresh())
                .map(|snap| snap.variables.read_only)
                .unwrap_or(true);
            if !read_only {
                self.transition(ClusterState::Monitor, format!("primary {primary} is back"));
            } else {
                self.report.open(
                    code::PRIMARY_READ_ONLY,
                    Some(&primary),
                    "primary is back but read only",
                );
            }
            return;
        }
        if let Some(other) = self.followed_primary(&primary) {
            info!(
                "cluster {} replicas follow {other}, adopting it as primary",
                self.name()
            );
            self.topology.set_primary(other.clone());
            if let Some(s) = self.topology.get_mut(&primary) {
                s.pending_rejoin = true;
            }
            self.transition(
                ClusterState::Rejoin,
                format!("primary moved to {other} by another manager"),
            );
            return;
        }

        if !fault {
            self.fail_count += 1;
        }
        self.suspect_ticks += 1;
        if self.suspect_ticks < self.config.n_failover {
            self.report.open(
                code::WAITING_FAILOVER,
                Some(&primary),
                format!(
                    "failover after {} more ticks",
                    self.config.n_failover - self.suspect_ticks
                ),
            );
            return;
        }
        if self.in_cooldown() && !critical {
            self.report
                .open(code::COOLDOWN, None, "primary change cooldown in effect");
            return;
        }

        let cands = match effect::candidates::failover_candidates(self, &primary) {
            Ok(x) => x,
            Err((c, msg)) => {
                warn!("cluster {} failover blocked: {msg}", self.name());
                self.report.open(c, None, msg);
                return;
            }
        };
        if !self.acquire_lease().await {
            return;
        }
        if let Err(e) = (effect::failover::Effect { cluster: self })
            .exec(primary, cands)
            .await
        {
            error!("cluster {} failover failed: {e:#}", self.name());
            self.report
                .open(code::FAILOVER_ABORTED, None, format!("{e:#}"));
        }
    }

    /// A reachable server that every reachable replica now follows.
    fn followed_primary(&self, old: &Endpoint) -> Option<Endpoint> {
        let mut target: Option<Endpoint> = None;
        let mut followers = 0;
        for s in self.topology.others() {
            let Some(r) = s.fresh().and_then(|snap| snap.replica(&self.config.channel)) else {
                continue;
            };
            if r.points_at(old) {
                return None;
            }
            let up = self
                .topology
                .servers()
                .iter()
                .find(|x| x.endpoint.matches(&r.master_host, r.master_port))?;
            match &target {
                Some(t) if t != &up.endpoint => return None,
                _ => target = Some(up.endpoint.clone()),
            }
            followers += 1;
        }
        let target = target?;
        let alive = self
            .topology
            .get(&target)
            .map(|s| s.fresh().is_some() && s.role == Role::Primary)
            .unwrap_or(false);
        (alive && followers > 0).then_some(target)
    }

    async fn on_rejoin(&mut self) {
        self.rejoin_pending().await;
        let Some(primary) = self.topology.primary().cloned() else {
            self.transition(ClusterState::Monitor, "no primary");
            return;
        };
        let waiting: Vec<Endpoint> = self
            .topology
            .others()
            .filter(|s| {
                !(s.ignored
                    || s.orphan
                    || s.needs_manual_intervention
                    || s.pending_rejoin
                    || s.diverged)
            })
            .filter(|s| {
                let settled = s.health.as_ref().map(|h| h.replica_healthy()).unwrap_or(false)
                    && s.fresh()
                        .map(|snap| snap.replicas.iter().all(|r| r.points_at(&primary)))
                        .unwrap_or(false);
                !settled
            })
            .map(|s| s.endpoint.clone())
            .collect();
        if waiting.is_empty() {
            self.transition(
                ClusterState::Monitor,
                format!("replicas follow {primary}"),
            );
            return;
        }
        let expired = self
            .rejoin_since
            .map(|t| t.elapsed() >= self.config.failover_max())
            .unwrap_or(true);
        if expired {
            warn!(
                "cluster {} rejoin deadline passed, still waiting for {waiting:?}",
                self.name()
            );
            self.transition(ClusterState::Monitor, "rejoin deadline passed");
            return;
        }
        self.report.open(
            code::REJOIN_WAIT,
            None,
            format!("waiting for {} replicas", waiting.len()),
        );
    }

    /// Rejoin every demoted primary that is reachable again.
    async fn rejoin_pending(&mut self) {
        let ready: Vec<Endpoint> = self
            .topology
            .servers()
            .iter()
            .filter(|s| s.pending_rejoin && s.fresh().is_some())
            .map(|s| s.endpoint.clone())
            .collect();
        for ep in ready {
            if let Err(e) = (effect::rejoin::Effect { cluster: self }).exec(&ep).await {
                warn!("cluster {} rejoin of {ep} failed: {e:#}", self.name());
            }
        }
    }

    /// Release the lease. Called once the worker stopped ticking.
    pub async fn shutdown(&mut self) {
        info!("cluster {} worker stopped", self.name());
        self.arbitrator.release().await;
        if let Some((_, reply)) = self.pending_switchover.take() {
            reply
                .send(Err(Error::Operator("manager is shutting down".to_owned())))
                .ok();
            self.shared.switchover_busy.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) fn fresh_of(&self, endpoint: &Endpoint) -> Option<Snapshot> {
        self.topology.get(endpoint).and_then(|s| s.fresh()).cloned()
    }
}

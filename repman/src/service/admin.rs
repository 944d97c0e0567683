use super::*;

use crate::bus::EventBody;
use crate::cluster::ClusterStatus;
use crate::journal;
use crate::manager::StatusReport;
use futures::Stream;
use proto::admin_server::{Admin, AdminServer};
use std::pin::Pin;

/// Create an admin service backed by a `Manager`.
pub fn new(manager: Arc<Manager>) -> AdminServer<impl Admin> {
    AdminServer::new(AdminService { manager })
}

#[doc(hidden)]
pub struct AdminService {
    manager: Arc<Manager>,
}

fn server_flags(s: &crate::topology::ServerView) -> Vec<String> {
    let mut out = vec![];
    if s.read_only {
        out.push("read_only".to_owned());
    }
    if s.diverged {
        out.push("diverged".to_owned());
    }
    if s.orphan {
        out.push("orphan".to_owned());
    }
    if s.needs_manual_intervention {
        out.push("needs_manual_intervention".to_owned());
    }
    if s.ignored {
        out.push("ignored".to_owned());
    }
    out
}

impl From<StatusReport> for proto::ClusterStatus {
    fn from(x: StatusReport) -> Self {
        let StatusReport {
            status,
            counters,
            dropped_events,
        } = x;
        let ClusterStatus {
            name,
            state,
            reason,
            elected_primary,
            lease_holder_uid,
            last_transition_at,
            shape,
            servers,
            open_states,
            failover_count,
            ..
        } = status;
        Self {
            name,
            state: state.to_string(),
            reason,
            elected_primary: elected_primary.map(|x| x.to_string()),
            lease_holder_uid,
            last_transition_at,
            topology: shape.to_string(),
            servers: servers
                .iter()
                .map(|s| proto::ServerStatus {
                    endpoint: s.endpoint.to_string(),
                    role: s.role.to_string(),
                    reachable: s.reachable,
                    stale: s.stale,
                    last_error: s.last_error.clone().unwrap_or_default(),
                    executed_gtid: s.executed_gtid.clone(),
                    flags: server_flags(s),
                })
                .collect(),
            open_states: open_states
                .into_iter()
                .map(|x| proto::OpenState {
                    code: x.code.clone(),
                    message: x.to_string(),
                })
                .collect(),
            counters: Some(proto::Counters {
                ticks: counters.ticks,
                transitions: counters.transitions,
                failovers: counters.failovers,
                switchovers: counters.switchovers,
                orphans: counters.orphans,
                dropped_events,
            }),
            failover_count: failover_count as u64,
        }
    }
}

fn into_record(name: String, x: journal::CrashRecord) -> proto::CrashRecord {
    proto::CrashRecord {
        name,
        old_primary: x.old_primary.to_string(),
        elected_primary: x.elected_primary.map(|e| e.to_string()).unwrap_or_default(),
        old_binlog_file: x.old_binlog_file,
        old_binlog_pos: x.old_binlog_pos,
        new_binlog_file: x.new_binlog_file,
        new_binlog_pos: x.new_binlog_pos,
        semisync_was_on: x.semisync_was_on,
        io_gtid: x.io_gtid,
        marker: x.marker.map(|m| m.to_string()),
        timestamp: x.timestamp,
        warnings: x.warnings,
    }
}

#[tonic::async_trait]
impl Admin for AdminService {
    async fn list_clusters(
        &self,
        _: tonic::Request<()>,
    ) -> std::result::Result<tonic::Response<proto::ClusterList>, tonic::Status> {
        let names = self.manager.cluster_names();
        Ok(tonic::Response::new(proto::ClusterList { names }))
    }

    async fn get_cluster_status(
        &self,
        req: tonic::Request<proto::ClusterName>,
    ) -> std::result::Result<tonic::Response<proto::ClusterStatus>, tonic::Status> {
        let name = req.into_inner().name;
        let report = self.manager.status(&name).map_err(into_status)?;
        Ok(tonic::Response::new(report.into()))
    }

    async fn switchover(
        &self,
        req: tonic::Request<proto::SwitchoverRequest>,
    ) -> std::result::Result<tonic::Response<proto::SwitchoverResponse>, tonic::Status> {
        let req = req.into_inner();
        let preferred = match req.preferred {
            Some(s) => Some(
                s.parse::<Endpoint>()
                    .map_err(|e| tonic::Status::invalid_argument(format!("{e:#}")))?,
            ),
            None => None,
        };
        let ticket = match self.manager.switchover(&req.cluster, preferred) {
            Ok(t) => t,
            Err(e) => {
                if let Some(Error::Busy(msg)) = Error::find(&e) {
                    return Ok(tonic::Response::new(proto::SwitchoverResponse {
                        accepted: false,
                        message: msg.clone(),
                    }));
                }
                return Err(into_status(e));
            }
        };
        let res = ticket
            .await
            .map_err(|_| tonic::Status::aborted("cluster worker stopped"))?;
        match res {
            Ok(primary) => Ok(tonic::Response::new(proto::SwitchoverResponse {
                accepted: true,
                message: format!("primary is now {primary}"),
            })),
            Err(e) => Err(into_status(e.into())),
        }
    }

    async fn freeze(
        &self,
        req: tonic::Request<proto::ClusterName>,
    ) -> std::result::Result<tonic::Response<()>, tonic::Status> {
        let name = req.into_inner().name;
        self.manager.freeze(&name).map_err(into_status)?;
        Ok(tonic::Response::new(()))
    }

    async fn unfreeze(
        &self,
        req: tonic::Request<proto::ClusterName>,
    ) -> std::result::Result<tonic::Response<()>, tonic::Status> {
        let name = req.into_inner().name;
        self.manager.unfreeze(&name).map_err(into_status)?;
        Ok(tonic::Response::new(()))
    }

    async fn forget_arbitration(
        &self,
        req: tonic::Request<proto::ForgetArbitrationRequest>,
    ) -> std::result::Result<tonic::Response<()>, tonic::Status> {
        let secret = req.into_inner().secret;
        self.manager
            .forget_arbitration(&secret)
            .await
            .map_err(into_status)?;
        Ok(tonic::Response::new(()))
    }

    async fn list_crash_records(
        &self,
        req: tonic::Request<proto::ClusterName>,
    ) -> std::result::Result<tonic::Response<proto::CrashRecordList>, tonic::Status> {
        let name = req.into_inner().name;
        let records = self
            .manager
            .crash_records(&name)
            .await
            .map_err(into_status)?
            .into_iter()
            .map(|(name, rec)| into_record(name, rec))
            .collect();
        Ok(tonic::Response::new(proto::CrashRecordList { records }))
    }

    type WatchEventsStream =
        Pin<Box<dyn Stream<Item = Result<proto::Event, tonic::Status>> + Send>>;

    async fn watch_events(
        &self,
        req: tonic::Request<proto::ClusterName>,
    ) -> std::result::Result<tonic::Response<Self::WatchEventsStream>, tonic::Status> {
        let name = req.into_inner().name;
        if !name.is_empty() {
            self.manager.status(&name).map_err(into_status)?;
        }
        let watch = self.manager.watch();
        let st = async_stream::try_stream! {
            loop {
                for e in watch.next_batch(Duration::from_secs(1)).await {
                    if !name.is_empty() && e.cluster != name {
                        continue;
                    }
                    if matches!(e.body, EventBody::Tick { .. }) {
                        continue;
                    }
                    yield proto::Event {
                        cluster: e.cluster,
                        kind: e.body.kind().to_owned(),
                        detail: e.body.to_string(),
                        timestamp: e.timestamp,
                    };
                }
            }
        };
        Ok(tonic::Response::new(Box::pin(st)))
    }
}

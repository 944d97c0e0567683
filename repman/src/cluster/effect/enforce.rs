use super::*;

use crate::replication::ServerVariables;

/// Corrections one server needs.
fn drift(
    force: &crate::config::DurabilityConfig,
    vars: &ServerVariables,
    mariadb: bool,
) -> Vec<Setting> {
    let mut out = vec![];
    if force.sync_binlog && !vars.sync_binlog {
        out.push(Setting::SyncBinlog);
    }
    if force.sync_innodb && !vars.sync_innodb {
        out.push(Setting::SyncInnodb);
    }
    if force.binlog_checksum && !vars.binlog_checksum {
        out.push(Setting::BinlogChecksum);
    }
    if force.binlog_compress && mariadb && !vars.binlog_compress {
        out.push(Setting::BinlogCompress);
    }
    if let Some(f) = &force.binlog_format {
        if !f.eq_ignore_ascii_case(&vars.binlog_format) {
            out.push(Setting::BinlogFormat(f.to_ascii_uppercase()));
        }
    }
    out
}

#[derive(Clone, Debug, PartialEq, Eq, derive_more::Display)]
enum Setting {
    #[display("sync_binlog")]
    SyncBinlog,
    #[display("innodb_flush_log_at_trx_commit")]
    SyncInnodb,
    #[display("binlog_checksum")]
    BinlogChecksum,
    #[display("log_bin_compress")]
    BinlogCompress,
    #[display("binlog_format={_0}")]
    BinlogFormat(String),
}

async fn apply(x: &dyn Instance, s: &Setting) -> Result<()> {
    match s {
        Setting::SyncBinlog => x.set_sync_binlog().await,
        Setting::SyncInnodb => x.set_sync_innodb().await,
        Setting::BinlogChecksum => x.set_binlog_checksum().await,
        Setting::BinlogCompress => x.set_binlog_compress().await,
        Setting::BinlogFormat(f) => x.set_binlog_format(f).await,
    }
}

/// Keep durability settings and replica read-only as configured.
pub struct Effect<'a> {
    pub cluster: &'a mut Cluster,
}

impl Effect<'_> {
    pub async fn exec(self) {
        let c = self.cluster;
        let primary = c.topology.primary().cloned();
        let mut work = vec![];
        for s in c.topology.servers() {
            let Some(snap) = s.fresh() else { continue };
            let fix = drift(&c.config.force, &snap.variables, snap.capability.is_mariadb());
            let make_read_only = c.config.read_only_replicas
                && Some(&s.endpoint) != primary.as_ref()
                && s.role == Role::Replica
                && !snap.variables.read_only;
            if !fix.is_empty() || make_read_only {
                work.push((s.endpoint.clone(), fix, make_read_only));
            }
        }

        for (ep, fix, make_read_only) in work {
            let Ok(x) = c.instance(&ep) else { continue };
            for setting in fix {
                match apply(x.as_ref(), &setting).await {
                    Ok(()) => info!("{ep}: enforced {setting}"),
                    Err(e) => c.report.open(
                        code::DURABILITY,
                        Some(&ep),
                        format!("cannot enforce {setting}: {e:#}"),
                    ),
                }
            }
            if make_read_only {
                match x.set_read_only(true).await {
                    Ok(()) => info!("{ep}: replica set read only"),
                    Err(e) => c.report.open(
                        code::REPLICA_WRITABLE,
                        Some(&ep),
                        format!("replica is writable: {e:#}"),
                    ),
                }
            }
        }
    }
}

//! Statement text per flavor.

use super::*;

/// Single-quoted SQL string literal.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Thread {
    Both,
    Io,
    Sql,
}

impl Thread {
    fn word(&self) -> &'static str {
        match self {
            Self::Both => "",
            Self::Io => " IO_THREAD",
            Self::Sql => " SQL_THREAD",
        }
    }
}

/// Suffix naming a MySQL channel.
fn for_channel(cap: &CapabilityRecord, channel: &str) -> String {
    if cap.has_channel_syntax() && !channel.is_empty() {
        format!(" FOR CHANNEL {}", quote(channel))
    } else {
        String::new()
    }
}

/// Infix naming a MariaDB connection.
fn connection(cap: &CapabilityRecord, channel: &str) -> String {
    if cap.is_mariadb() && !channel.is_empty() {
        format!(" {}", quote(channel))
    } else {
        String::new()
    }
}

fn control(cap: &CapabilityRecord, verb: &str, channel: &str, thread: Thread) -> String {
    format!(
        "{verb} SLAVE{}{}{}",
        connection(cap, channel),
        thread.word(),
        for_channel(cap, channel)
    )
}

pub fn start_replica(cap: &CapabilityRecord, channel: &str, thread: Thread) -> String {
    control(cap, "START", channel, thread)
}

pub fn stop_replica(cap: &CapabilityRecord, channel: &str, thread: Thread) -> String {
    control(cap, "STOP", channel, thread)
}

pub fn reset_replica(cap: &CapabilityRecord, channel: &str, all: bool) -> String {
    let all = if all { " ALL" } else { "" };
    format!(
        "RESET SLAVE{}{all}{}",
        connection(cap, channel),
        for_channel(cap, channel)
    )
}

pub fn show_replica_status(cap: &CapabilityRecord, channel: &str) -> String {
    if cap.is_mariadb() && !channel.is_empty() {
        format!("SHOW SLAVE {} STATUS", quote(channel))
    } else {
        format!("SHOW SLAVE STATUS{}", for_channel(cap, channel))
    }
}

pub fn show_all_replicas(cap: &CapabilityRecord) -> Option<&'static str> {
    cap.is_mariadb().then_some("SHOW ALL SLAVES STATUS")
}

pub fn skip_one_event(cap: &CapabilityRecord, channel: &str) -> Vec<String> {
    let mut out = vec![];
    if cap.is_mariadb() {
        out.push(format!("SET @@default_master_connection={}", quote(channel)));
    }
    out.push("SET GLOBAL sql_slave_skip_counter=1".to_owned());
    out
}

pub fn change_primary(cap: &CapabilityRecord, opt: &ChangePrimaryOpt) -> Result<String> {
    let mut s = format!(
        "CHANGE MASTER{} TO master_host={}, master_port={}, master_user={}, master_password={}, master_connect_retry={}, master_heartbeat_period={}",
        connection(cap, &opt.channel),
        quote(&opt.host),
        opt.port,
        quote(&opt.user),
        quote(&opt.password),
        opt.connect_retry,
        opt.heartbeat_period,
    );
    let positional = |s: &mut String| -> Result<()> {
        let coord = opt
            .coord
            .as_ref()
            .with_context(|| format!("{:?} mode needs binlog coordinates", opt.mode))?;
        s.push_str(&format!(
            ", master_log_file={}, master_log_pos={}",
            quote(&coord.file),
            coord.pos
        ));
        Ok(())
    };
    match opt.mode {
        ReplicationMode::GtidCurrent | ReplicationMode::GtidSlave => {
            ensure!(
                cap.is_mariadb(),
                Error::Syntax(format!("{:?} needs MariaDB", opt.mode))
            );
            let pos = if opt.mode == ReplicationMode::GtidCurrent {
                "CURRENT_POS"
            } else {
                "SLAVE_POS"
            };
            s.push_str(&format!(", MASTER_USE_GTID={pos}"));
        }
        ReplicationMode::Positional => {
            positional(&mut s)?;
            if cap.is_mariadb() {
                s.push_str(", MASTER_USE_GTID=NO");
            } else if cap.at_least(5, 6) {
                s.push_str(", MASTER_AUTO_POSITION=0");
            }
        }
        ReplicationMode::Mxs => positional(&mut s)?,
        ReplicationMode::AutoPosition => {
            ensure!(
                !cap.is_mariadb(),
                Error::Syntax("auto position needs MySQL".to_owned())
            );
            s.push_str(", MASTER_AUTO_POSITION=1");
        }
    }
    if opt.ssl {
        s.push_str(", MASTER_SSL=1");
    }
    s.push_str(&for_channel(cap, &opt.channel));
    Ok(s)
}

pub fn variables(cap: &CapabilityRecord) -> String {
    pairs_query(cap, "global_variables", super::VARIABLE_NAMES)
}

pub fn status(cap: &CapabilityRecord) -> String {
    pairs_query(cap, "global_status", super::STATUS_NAMES)
}

fn pairs_query(cap: &CapabilityRecord, table: &str, names: &[&str]) -> String {
    let names = names.iter().map(|n| quote(n)).collect::<Vec<_>>().join(",");
    format!(
        "SELECT UPPER(Variable_name) AS variable_name, Variable_Value AS value FROM {}.{table} WHERE UPPER(Variable_name) IN ({names})",
        cap.variable_source.schema()
    )
}

pub fn gtid_sets(cap: &CapabilityRecord) -> &'static str {
    if cap.is_mariadb() {
        "SELECT @@GLOBAL.gtid_current_pos AS executed, '' AS purged"
    } else {
        "SELECT @@GLOBAL.gtid_executed AS executed, @@GLOBAL.gtid_purged AS purged"
    }
}

pub fn binlog_events(file: &str, from_pos: Option<u64>, limit: u64) -> String {
    match from_pos {
        Some(pos) => format!("SHOW BINLOG EVENTS IN {} FROM {pos} LIMIT {limit}", quote(file)),
        None => format!("SHOW BINLOG EVENTS IN {} LIMIT {limit}", quote(file)),
    }
}

pub fn long_writes(threshold: Duration) -> String {
    let t = threshold.as_secs();
    format!(
        "SELECT SUM(ct) AS n FROM (\
         SELECT COUNT(*) AS ct FROM information_schema.processlist \
         WHERE command='Query' AND time >= {t} AND info NOT LIKE 'select%' \
         UNION ALL \
         SELECT COUNT(*) FROM information_schema.INNODB_TRX trx \
         WHERE trx.trx_started < CURRENT_TIMESTAMP - INTERVAL {t} SECOND) A"
    )
}

pub fn received_heartbeats(channel: &str) -> String {
    format!(
        "SELECT COUNT_RECEIVED_HEARTBEATS AS n FROM performance_schema.replication_connection_status WHERE CHANNEL_NAME={}",
        quote(channel)
    )
}

pub fn wait_gtid(cap: &CapabilityRecord, gtid: &str, timeout: Duration) -> String {
    let f = if cap.is_mariadb() {
        "MASTER_GTID_WAIT"
    } else {
        "WAIT_FOR_EXECUTED_GTID_SET"
    };
    format!("SELECT {f}({}, {}) AS r", quote(gtid), timeout.as_secs())
}

pub fn set_global(name: &str, on: bool) -> String {
    format!("SET GLOBAL {name}={}", if on { 1 } else { 0 })
}

pub const PSEUDO_GTID_SCHEMA: &str = "replication_manager_schema";

pub fn pseudo_gtid_view(token: &str) -> String {
    format!(
        "CREATE OR REPLACE VIEW {PSEUDO_GTID_SCHEMA}.pseudo_gtid_v AS SELECT {} FROM dual",
        quote(token)
    )
}

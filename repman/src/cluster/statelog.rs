use super::*;

use std::collections::BTreeMap;

/// Identifiers of open states.
pub mod code {
    pub const NO_PRIMARY: &str = "ERR00010";
    pub const PRIMARY_DOWN: &str = "ERR00011";
    pub const PRIMARY_FAULT: &str = "ERR00012";
    pub const FAILOVER_ABORTED: &str = "ERR00013";
    pub const SWITCHOVER_ABORTED: &str = "ERR00014";
    // ERR00021..ERR00024 are topology violations.

    pub const PRIMARY_READ_ONLY: &str = "WARN0010";
    pub const SERVER_DOWN: &str = "WARN0011";
    pub const REPLICA_UNHEALTHY: &str = "WARN0012";
    pub const FILTERS_DIFFER: &str = "WARN0013";
    pub const DURABILITY: &str = "WARN0014";
    pub const REPLICA_WRITABLE: &str = "WARN0015";

    pub const COOLDOWN: &str = "WARN0040";
    pub const MANUAL_MODE: &str = "WARN0041";
    pub const FAILOVER_LIMIT: &str = "WARN0042";
    pub const FALSE_POSITIVE: &str = "WARN0043";
    pub const NO_CANDIDATE: &str = "WARN0044";
    pub const NO_LEASE: &str = "WARN0045";
    pub const WAITING_FAILOVER: &str = "WARN0046";

    pub const ORPHAN: &str = "WARN0050";
    pub const MANUAL_INTERVENTION: &str = "WARN0051";
    pub const REJOIN_DEFERRED: &str = "WARN0052";
    pub const REJOIN_WAIT: &str = "WARN0053";
    pub const JOURNAL: &str = "WARN0054";

    pub const FROZEN: &str = "WARN0060";
}

/// An open warning or error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenState {
    pub code: String,
    /// Server the state is about.
    pub subject: Option<Endpoint>,
    pub message: String,
}

impl std::fmt::Display for OpenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.subject {
            Some(s) => write!(f, "{} {s}: {}", self.code, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

type Key = (String, Option<Endpoint>);

/// States raised during one tick.
#[derive(Default)]
pub struct Report {
    states: BTreeMap<Key, OpenState>,
}

impl Report {
    pub fn open(&mut self, code: &str, subject: Option<&Endpoint>, message: impl Into<String>) {
        let st = OpenState {
            code: code.to_owned(),
            subject: subject.cloned(),
            message: message.into(),
        };
        self.states
            .insert((st.code.clone(), st.subject.clone()), st);
    }

    pub fn contains(&self, code: &str) -> bool {
        self.states.keys().any(|(c, _)| c == code)
    }
}

/// States open as of the last tick.
#[derive(Default)]
pub struct StateLog {
    open: BTreeMap<Key, OpenState>,
}

impl StateLog {
    pub fn is_open(&self, code: &str, subject: Option<&Endpoint>) -> bool {
        self.open
            .contains_key(&(code.to_owned(), subject.cloned()))
    }

    /// Replace the open set with `report`. Returns the opened and the
    /// resolved states.
    pub fn update(&mut self, report: Report) -> (Vec<OpenState>, Vec<OpenState>) {
        let new = report.states;
        let opened = new
            .iter()
            .filter(|(k, _)| !self.open.contains_key(*k))
            .map(|(_, v)| v.clone())
            .collect();
        let resolved = self
            .open
            .iter()
            .filter(|(k, _)| !new.contains_key(*k))
            .map(|(_, v)| v.clone())
            .collect();
        self.open = new;
        (opened, resolved)
    }

    pub fn open_states(&self) -> Vec<OpenState> {
        self.open.values().cloned().collect()
    }
}

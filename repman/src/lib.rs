#![deny(unused_must_use)]

/// Fault taxonomy shared by every layer.
mod error;
pub use error::{Error, FaultClass, FaultKind};

/// Manager and cluster configuration.
pub mod config;

/// Flavor and capability probe.
pub mod version;

/// Sessions to database servers.
pub mod session;

/// GTID list arithmetic.
pub mod gtid;

/// Replication reader and mutator.
pub mod replication;

/// Per-server health evaluation.
pub mod health;

/// In-memory topology of a cluster.
pub mod topology;

/// Election between manager processes.
pub mod arbitration;

/// Persisted records of primary demotions.
pub mod journal;

/// Fan-out of cluster events to observers.
pub mod bus;

/// Per-cluster orchestrator.
pub mod cluster;

/// Implementation of `Manager` running multiple clusters.
pub mod manager;
pub use manager::Manager;

/// Implementation of gRPC services.
pub mod service;

mod thread;

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Identifier of a database server (`host:port`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// True if a replica configured with `(host, port)` points at this endpoint.
    pub fn matches(&self, host: &str, port: u16) -> bool {
        self.port == port && self.host.eq_ignore_ascii_case(host)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .with_context(|| format!("endpoint `{s}` must be host:port"))?;
        ensure!(!host.is_empty(), "endpoint `{s}` has an empty host");
        let port = port
            .parse()
            .with_context(|| format!("endpoint `{s}` has a bad port"))?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Endpoint> for String {
    fn from(x: Endpoint) -> Self {
        x.to_string()
    }
}

/// Milliseconds since the unix epoch.
pub(crate) fn unix_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

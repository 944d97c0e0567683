use super::*;
use thiserror::Error;

/// How a server-side runtime fault should be handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultClass {
    /// Retried once with backoff inside the current transition.
    Retryable,
    /// Aborts the current transition.
    Unrecoverable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    Connection,
    Auth,
    Syntax,
    Runtime(FaultClass),
    Consistency,
    ElectionInconclusive,
    Operator,
    NotFound,
    Other,
}

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("connection fault: {0}")]
    Connection(String),
    #[error("authentication fault: {0}")]
    Auth(String),
    #[error("syntax fault: {0}")]
    Syntax(String),
    #[error("runtime fault (code={code}): {message}")]
    Runtime { code: u16, message: String },
    #[error("consistency fault: {0}")]
    Consistency(String),
    #[error("election inconclusive: {0}")]
    ElectionInconclusive(String),
    #[error("operator fault: {0}")]
    Operator(String),
    #[error("busy: {0}")]
    Busy(String),
    #[error("row not found")]
    NotFound,
    #[error("{first}, then {second}")]
    Composite { first: String, second: String },
    #[error("cluster {0} not found")]
    ClusterNotFound(String),
    #[error("server {0} not found")]
    ServerNotFound(Endpoint),
}

/// Server error codes retried once within a transition.
const RETRYABLE_CODES: &[u16] = &[
    1040, // too many connections
    1158, 1159, 1160, 1161, // network read/write
    1205, // lock wait timeout
    1213, // deadlock
    1317, // query interrupted
];

/// Server error codes that mean the server cannot keep serving writes.
const CRITICAL_CODES: &[u16] = &[
    1021, // disk full
    1030, // storage engine error
    1037, // out of memory
    1038, // out of sort memory
    1041, // out of resources
];

impl Error {
    pub fn runtime(code: u16, message: impl Into<String>) -> Self {
        Self::Runtime {
            code,
            message: message.into(),
        }
    }

    pub fn class_of(code: u16) -> FaultClass {
        if RETRYABLE_CODES.contains(&code) {
            FaultClass::Retryable
        } else {
            FaultClass::Unrecoverable
        }
    }

    pub fn kind(&self) -> FaultKind {
        match self {
            Self::Connection(_) => FaultKind::Connection,
            Self::Auth(_) => FaultKind::Auth,
            Self::Syntax(_) => FaultKind::Syntax,
            Self::Runtime { code, .. } => FaultKind::Runtime(Self::class_of(*code)),
            Self::Composite { .. } => FaultKind::Runtime(FaultClass::Unrecoverable),
            Self::Consistency(_) => FaultKind::Consistency,
            Self::ElectionInconclusive(_) => FaultKind::ElectionInconclusive,
            Self::Operator(_) | Self::Busy(_) => FaultKind::Operator,
            Self::NotFound => FaultKind::NotFound,
            Self::ClusterNotFound(_) | Self::ServerNotFound(_) => FaultKind::Operator,
        }
    }

    /// A runtime fault that bypasses the failover cooldown.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Runtime { code, .. } if CRITICAL_CODES.contains(code))
    }

    /// Find the first `Error` in the chain of `e`.
    pub fn find(e: &anyhow::Error) -> Option<&Error> {
        e.chain().find_map(|x| x.downcast_ref::<Error>())
    }

    pub fn classify(e: &anyhow::Error) -> FaultKind {
        Self::find(e).map(|x| x.kind()).unwrap_or(FaultKind::Other)
    }
}

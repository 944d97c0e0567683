use super::*;

mod proto {
    tonic::include_proto!("repman");
}

/// Operator commands and status.
pub mod admin;

/// Server reflection for `grpcurl` and friends.
pub mod reflection;

/// Map a failure of the manager to a gRPC status.
fn into_status(e: anyhow::Error) -> tonic::Status {
    let msg = format!("{e:#}");
    match Error::find(&e) {
        Some(Error::ClusterNotFound(_) | Error::ServerNotFound(_) | Error::NotFound) => {
            tonic::Status::not_found(msg)
        }
        Some(Error::Operator(_) | Error::Consistency(_)) => {
            tonic::Status::failed_precondition(msg)
        }
        Some(Error::Busy(_)) => tonic::Status::aborted(msg),
        Some(Error::ElectionInconclusive(_) | Error::Connection(_)) => {
            tonic::Status::unavailable(msg)
        }
        Some(Error::Syntax(_)) => tonic::Status::invalid_argument(msg),
        _ => tonic::Status::internal(msg),
    }
}

//! The crate error type. Server statuses are translated into rich error
//! kinds once, at the node send pipeline; retry orchestration consumes
//! the kinds rather than raw statuses.

use crate::errormap::ErrorMap;
use crate::options::ServiceType;
use crate::protocol::{ProtocolError, Status};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("document not found")]
    NotFound,

    #[error("document already exists")]
    Exists,

    #[error("cas mismatch")]
    CasMismatch,

    #[error("value too large")]
    ValueTooLarge,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("temporary failure")]
    Temporary,

    #[error("document is locked")]
    Locked,

    /// `ambiguous` is true when the operation was a mutation that may or
    /// may not have been applied before the deadline fired.
    #[error("operation timed out (ambiguous: {ambiguous})")]
    Timeout { ambiguous: bool },

    #[error("operation cancelled")]
    Cancelled,

    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),

    #[error("invalid durability level")]
    DurabilityInvalidLevel,

    #[error("durability requirement impossible on the current topology")]
    DurabilityImpossible,

    #[error("a durable write is already in progress on this key")]
    SyncWriteInProgress,

    #[error("durable write outcome is ambiguous")]
    SyncWriteAmbiguous,

    #[error("sub-document path failure at spec {index}: {status:?}")]
    SubdocPath { index: usize, status: Status },

    #[error("vbucket is owned by another node")]
    NotMyVbucket,

    #[error("collection id is outdated")]
    CollectionOutdated,

    #[error("circuit breaker is open")]
    CircuitBreakerOpen,

    #[error("no node offers the {0:?} service")]
    ServiceMissing(ServiceType),

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("connection is dead")]
    ConnectionDead,

    #[error("connection is closing")]
    ConnectionClosing,

    #[error("connection pool is disposed")]
    PoolDisposed,

    #[error("no connection could be established to {0}")]
    Bootstrap(String),

    #[error("cluster is not bootstrapped")]
    NotBootstrapped,

    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("invalid cluster configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server status {status:?}: {message}")]
    Server { status: Status, message: String },
}

impl Error {
    /// The fixed status-to-kind table, refined by the server error map
    /// for statuses without a dedicated kind.
    pub fn from_status(status: Status, cas_op: bool, error_map: Option<&ErrorMap>) -> Error {
        match status {
            Status::KeyNotFound => Error::NotFound,
            Status::KeyExists if cas_op => Error::CasMismatch,
            Status::KeyExists => Error::Exists,
            Status::ValueTooLarge => Error::ValueTooLarge,
            Status::InvalidArguments => Error::InvalidArgument(
                "the server rejected one or more arguments of the request".into(),
            ),
            Status::TemporaryFailure | Status::Busy | Status::OutOfMemory => Error::Temporary,
            Status::Locked => Error::Locked,
            Status::NotMyVbucket => Error::NotMyVbucket,
            Status::UnknownCollection | Status::UnknownScope => Error::CollectionOutdated,
            Status::DurabilityInvalidLevel => Error::DurabilityInvalidLevel,
            Status::DurabilityImpossible => Error::DurabilityImpossible,
            Status::SyncWriteInProgress | Status::SyncWriteReCommitInProgress => {
                Error::SyncWriteInProgress
            }
            Status::SyncWriteAmbiguous => Error::SyncWriteAmbiguous,
            status if status.is_auth_failure() => {
                Error::AuthenticationFailure(format!("{:?}", status))
            }
            status => {
                let message = error_map
                    .and_then(|map| map.lookup(u16::from(status)))
                    .map(|code| format!("{}: {}", code.name, code.description))
                    .unwrap_or_else(|| "unknown status".into());
                Error::Server { status, message }
            }
        }
    }

    /// Whether the orchestrator may retry the operation at all. Statuses
    /// the error map marks retriable come through [`Error::Server`] and
    /// are qualified by the map's retry strategy at the call site.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::Temporary
                | Error::Locked
                | Error::NotMyVbucket
                | Error::CollectionOutdated
                | Error::SyncWriteInProgress
        )
    }
}

#[cfg(test)]
mod tests {
    use super::Error;
    use crate::protocol::Status;

    #[test]
    fn test_cas_refinement() {
        assert!(matches!(
            Error::from_status(Status::KeyExists, true, None),
            Error::CasMismatch
        ));
        assert!(matches!(
            Error::from_status(Status::KeyExists, false, None),
            Error::Exists
        ));
    }

    #[test]
    fn test_retriable_kinds() {
        assert!(Error::from_status(Status::TemporaryFailure, false, None).is_retriable());
        assert!(Error::from_status(Status::NotMyVbucket, false, None).is_retriable());
        assert!(!Error::from_status(Status::KeyNotFound, false, None).is_retriable());
        assert!(!Error::Cancelled.is_retriable());
    }
}

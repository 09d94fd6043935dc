//! Error types for meshkv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Transport Errors ===
    #[error("Unknown peer: {0:x}")]
    UnknownPeer(u64),

    // === Request Errors ===
    #[error("Request too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Request canceled: {0}")]
    Canceled(String),

    #[error("Store was stopped")]
    Stopped,

    // === Store Errors ===
    #[error("Required revision is a future revision")]
    FutureRevision,

    #[error("Required revision has been compacted")]
    Compacted,

    #[error("Lease not found: {0}")]
    LeaseNotFound(i64),

    #[error("Lease already exists: {0}")]
    LeaseExists(i64),

    /// Kept for wire compatibility; write transactions are borrow-scoped so
    /// the local store never produces it.
    #[error("Transaction ID mismatch")]
    TxnIdMismatch,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    // === Raft Errors ===
    #[error("Raft error: {0}")]
    Raft(#[from] raft::Error),

    // === Cluster Errors ===
    #[error("Removed from the cluster")]
    Removed,

    #[error("Cluster shrunk below minimum: {have} peers, need {min}")]
    Shrunk { have: usize, min: usize },

    #[error("Terminated by user")]
    Terminated,

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Canceled(_) | Error::UnknownPeer(_))
    }

    /// Does this error end the life of the local peer?
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Removed | Error::Shrunk { .. } | Error::Terminated)
    }

    /// Symbolic kind carried on the wire instead of the full message
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::UnknownPeer(_) => "transport",
            Error::TooLarge { .. } => "request_too_large",
            Error::Canceled(_) => "request_canceled",
            Error::Stopped => "stopped",
            Error::FutureRevision => "future_revision",
            Error::Compacted => "compacted",
            Error::LeaseNotFound(_) => "lease_not_found",
            Error::LeaseExists(_) => "lease_exists",
            Error::TxnIdMismatch => "txn_id_mismatch",
            Error::Backend(_) | Error::RocksDb(_) => "backend",
            Error::Codec(_) => "codec",
            Error::Raft(_) => "raft",
            Error::Removed => "removed",
            Error::Shrunk { .. } => "cluster_shrunk",
            Error::Terminated => "terminated",
            Error::InvalidConfig(_) => "invalid_config",
            Error::Internal(_) | Error::Other(_) => "internal",
        }
    }

    /// Convert to gRPC status for RPC responses
    pub fn to_grpc_status(&self) -> tonic::Status {
        use tonic::Code;
        let code = match self {
            Error::TooLarge { .. } | Error::InvalidConfig(_) => Code::InvalidArgument,
            Error::FutureRevision | Error::Compacted => Code::OutOfRange,
            Error::LeaseNotFound(_) => Code::NotFound,
            Error::LeaseExists(_) => Code::AlreadyExists,
            Error::Canceled(_) => Code::Cancelled,
            Error::TxnIdMismatch => Code::FailedPrecondition,
            Error::Stopped | Error::Removed | Error::Shrunk { .. } | Error::Terminated => {
                Code::Unavailable
            }
            _ => Code::Internal,
        };
        tonic::Status::new(code, self.kind())
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::InvalidConfig(_) | Error::Codec(_) => StatusCode::BAD_REQUEST,
            Error::FutureRevision | Error::Compacted => StatusCode::BAD_REQUEST,
            Error::LeaseNotFound(_) => StatusCode::NOT_FOUND,
            Error::LeaseExists(_) | Error::TxnIdMismatch => StatusCode::CONFLICT,
            Error::Canceled(_) => StatusCode::REQUEST_TIMEOUT,
            Error::Stopped | Error::Removed | Error::Shrunk { .. } | Error::Terminated => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<protobuf::ProtobufError> for Error {
    fn from(e: protobuf::ProtobufError) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

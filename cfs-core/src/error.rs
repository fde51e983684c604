use std::fmt;
use thiserror::Error;

/// Status code reported by a metadata or volume-manager call.
///
/// The numeric values are the ones the services put on the wire; `0` means
/// success and never turns into a `Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NotAllowed,
    NotFound,
    AlreadyExists,
    Failed(i32),
}

impl Status {
    pub const OK: i32 = 0;

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            Self::OK => None,
            1 => Some(Self::NotAllowed),
            2 => Some(Self::NotFound),
            17 => Some(Self::AlreadyExists),
            other => Some(Self::Failed(other)),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::NotAllowed => 1,
            Self::NotFound => 2,
            Self::AlreadyExists => 17,
            Self::Failed(code) => *code,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAllowed => write!(f, "not allowed"),
            // the services reuse code 2 for a missing parent path
            Self::NotFound => write!(f, "not found or no parent path"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::Failed(code) => write!(f, "failed with code {}", code),
        }
    }
}

#[derive(Debug, Error)]
pub enum CfsError {
    #[error("{op} returned {status}")]
    Status { op: &'static str, status: Status },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("operation not allowed: {0}")]
    NotAllowed(String),

    #[error(
        "all {attempts} replicas failed for chunk {chunk_id} (offset={offset} len={len})"
    )]
    ReplicasExhausted {
        chunk_id: u64,
        offset: u64,
        len: u64,
        attempts: usize,
    },

    #[error("read of chunk #{index} (id={chunk_id}) at offset {offset} failed: {source}")]
    ChunkRead {
        index: usize,
        chunk_id: u64,
        offset: u64,
        source: Box<CfsError>,
    },

    #[error("flush of chunk {chunk_id} for {path} failed: {source}")]
    FlushFailed {
        path: String,
        chunk_id: u64,
        source: Box<CfsError>,
    },

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CfsError {
    pub fn status(op: &'static str, status: Status) -> Self {
        Self::Status { op, status }
    }

    /// Whether the failure came from reaching a peer rather than from what
    /// the peer said. Only these are retried against the next replica.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Numeric code for front ends that report collaborator error codes.
    /// Collaborator statuses pass through unchanged, everything else is `-1`.
    pub fn code(&self) -> i32 {
        match self {
            Self::Status { status, .. } => status.code(),
            Self::ChunkRead { source, .. } | Self::FlushFailed { source, .. } => source.code(),
            _ => -1,
        }
    }
}

pub type Result<T> = std::result::Result<T, CfsError>;

/// Turn a collaborator's `ret` field into a `Result`.
pub fn check_status(op: &'static str, ret: i32) -> Result<()> {
    match Status::from_code(ret) {
        None => Ok(()),
        Some(status) => Err(CfsError::status(op, status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        assert_eq!(Status::from_code(0), None);
        assert_eq!(Status::from_code(1), Some(Status::NotAllowed));
        assert_eq!(Status::from_code(2), Some(Status::NotFound));
        assert_eq!(Status::from_code(17), Some(Status::AlreadyExists));
        assert_eq!(Status::from_code(-5), Some(Status::Failed(-5)));
        assert_eq!(Status::AlreadyExists.code(), 17);
    }

    #[test]
    fn test_error_code_passes_collaborator_status_through() {
        let err = check_status("create_file", 17).unwrap_err();
        assert_eq!(err.code(), 17);

        let wrapped = CfsError::FlushFailed {
            path: "/a".to_string(),
            chunk_id: 3,
            source: Box::new(CfsError::status("sync_chunk", Status::NotAllowed)),
        };
        assert_eq!(wrapped.code(), 1);
        assert_eq!(CfsError::Transport("down".to_string()).code(), -1);
    }
}

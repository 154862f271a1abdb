use thiserror::Error;

/// Error taxonomy for the core.
///
/// Connection-level failures tear the whole session down; task-level
/// failures abort the current operation and leave the connection healthy.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bind/listen/dial/recv/send failure. Always connection-fatal.
    #[error("connection error: {0}")]
    Connection(#[source] std::io::Error),

    /// Undecodable or malformed frame. Stream framing can no longer be
    /// trusted, so this is connection-fatal too.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Missing file or permission failure during a listing or transfer.
    /// Task-fatal only.
    #[error("filesystem error: {0}")]
    FileSystem(#[source] std::io::Error),

    /// Digest mismatch after a receive. Task-fatal; the received file is
    /// kept on disk for inspection.
    #[error("checksum mismatch for {name}: expected {expected}, got {actual}")]
    Checksum {
        name: String,
        expected: String,
        actual: String,
    },

    /// Transfer rejected before any bytes went on the wire.
    #[error("{0}")]
    IntegrityPolicy(String),
}

/// Machine-readable category of a [`CoreError`], carried on the event
/// channel so the UI can map conditions to friendlier messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Protocol,
    FileSystem,
    Checksum,
    IntegrityPolicy,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Connection(_) => ErrorKind::Connection,
            CoreError::Protocol(_) => ErrorKind::Protocol,
            CoreError::FileSystem(_) => ErrorKind::FileSystem,
            CoreError::Checksum { .. } => ErrorKind::Checksum,
            CoreError::IntegrityPolicy(_) => ErrorKind::IntegrityPolicy,
        }
    }

    /// Whether this failure invalidates the whole connection rather than
    /// just the operation that hit it.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, CoreError::Connection(_) | CoreError::Protocol(_))
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        CoreError::Protocol(msg.into())
    }
}

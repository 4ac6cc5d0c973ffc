use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock acquisition timed out")]
    LockTimeout,
    #[error("timed out waiting for save")]
    SaveTimeout,
    #[error("operation cancelled")]
    Cancelled,
    #[error("lock promotion contended")]
    PromoteContended,
    #[error("external timestamp {external_ns} is ahead of now {now_ns}")]
    FutureTimestamp { external_ns: u64, now_ns: u64 },
    #[error("external id must be non-zero for unique append")]
    ZeroExternalId,
    #[error("block {0} is evicted")]
    BlockEvicted(u64),
    #[error("block {0} has unsaved changes")]
    NotSaved(u64),
    #[error("block {0} is not marked for delete")]
    NotPendingDelete(u64),
    #[error("unknown storage tier: {0}")]
    UnknownTier(String),
    #[error("storage {op} failed for {name}: {source}")]
    Storage {
        op: &'static str,
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("compression error: {0}")]
    Compression(String),
}

impl Error {
    /// Wraps a collaborator failure with the operation and object name.
    pub fn storage(
        op: &'static str,
        name: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error::Storage {
            op,
            name: name.into(),
            source: source.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout | Error::SaveTimeout | Error::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

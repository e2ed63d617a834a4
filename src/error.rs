use thiserror::Error;

/// Why a connection attempt failed, classified from the innermost cause.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("wrong username")]
    WrongUsername,
    #[error("wrong password")]
    WrongPassword,
    #[error("invalid server address")]
    InvalidServerAddress,
    #[error("invalid server port")]
    InvalidServerPort,
    #[error("connection failed: {0}")]
    Unknown(String),
}

/// Why a folder could not be resolved and opened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FolderError {
    #[error("no folder matching {0:?} exists")]
    FolderDoesNotExist(String),
    #[error("could not open folder read-only: {0}")]
    CouldNotOpenStore(String),
    #[error("could not connect: {0}")]
    CouldNotConnect(#[from] ConnectError),
    #[error("unexpected folder error: {0}")]
    Unexpected(String),
}

/// Why a fetch operation failed. Surfaced through the error field of the
/// terminal [`FetchResult`](crate::FetchResult), never thrown across the
/// asynchronous boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Folder(#[from] FolderError),
    /// A single message could not be mapped. Non-fatal in chunked id-set
    /// fetches, fatal in window fetches.
    #[error("could not map message: {0}")]
    Parse(String),
    #[error("fetch failed: {0}")]
    Protocol(String),
}

// src/server/error.rs

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Sentinel returned by `serve` whenever shutdown was requested,
    /// regardless of the accept error that triggered the check.
    #[error("lineserve: server closed")]
    ServerClosed,

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

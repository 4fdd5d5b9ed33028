use thiserror::Error;

/// Failures reported by the remote data source seams.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("remote request failed: {0}")]
    Remote(String),

    #[error("remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed remote payload: {0}")]
    Decode(String),

    #[error("not authenticated")]
    Unauthenticated,

    #[error("realtime connection closed")]
    Closed,
}

#[derive(Debug, Clone, Error)]
pub enum FeedError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("no channel is active")]
    NoActiveChannel,

    /// The channel was switched while the operation was in flight; its
    /// result was discarded.
    #[error("channel {0} is no longer active")]
    Superseded(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

use tower::BoxError;

/// Errors surfaced by the middleware itself.
///
/// Everything else the middleware touches (handler failures, persistence
/// failures) is either forwarded untouched or logged and swallowed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The inbound body could not be read. The handler was not invoked.
    #[error("failed to read request body: {0}")]
    BodyRead(#[source] BoxError),

    #[error("invalid configuration for {key}: {reason}")]
    Config { key: &'static str, reason: String },
}

/// Failure of a single persistence attempt.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store write exceeded its deadline")]
    Timeout,

    #[error("store rejected the document with status {status}")]
    Rejected { status: u16 },

    /// Anything the HTTP client reports that is not a timeout, including
    /// failures to encode the request.
    #[error("store transport failed: {0}")]
    Transport(#[source] BoxError),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StoreError::Timeout
        } else {
            StoreError::Transport(Box::new(err))
        }
    }
}

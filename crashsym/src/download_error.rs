/// The error type for a single download attempt from a single mirror. Passed
/// to [`SymbolicationObserver::on_fetch_failed`](crate::SymbolicationObserver::on_fetch_failed).
#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    /// Creating the reqwest Client failed.
    #[error("Creating the reqwest client failed: {0}")]
    ClientCreationFailed(String),

    /// Opening the request failed, e.g. because the connection was refused.
    #[error("Opening the request failed: {0}")]
    OpenFailed(Box<dyn std::error::Error + Send + Sync>),

    /// The download timed out.
    #[error("The download timed out")]
    Timeout,

    /// The server returned a non-success status code.
    #[error("The server returned status code {0}")]
    StatusError(u16),

    /// An error occurred when reading the response body.
    #[error("Error when reading the download stream: {0}")]
    StreamRead(Box<dyn std::error::Error + Send + Sync>),

    /// Redirect-related error.
    #[error("Redirect-related error: {0}")]
    Redirect(Box<dyn std::error::Error + Send + Sync>),

    /// Other error.
    #[error("Other error: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl DownloadError {
    /// Whether the mirror told us it doesn't have the file.
    ///
    /// Object stores answer 403 for keys that don't exist, so all 4xx
    /// statuses count, except for 408 and 429 which ask us to come back later.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DownloadError::StatusError(status)
                if (400..500).contains(status) && *status != 408 && *status != 429
        )
    }

    /// Whether trying again has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            DownloadError::StatusError(status) => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            DownloadError::OpenFailed(_)
            | DownloadError::Timeout
            | DownloadError::StreamRead(_)
            | DownloadError::Other(_) => true,
            DownloadError::ClientCreationFailed(_) | DownloadError::Redirect(_) => false,
        }
    }
}

/// The error type for [`SymbolSource::fetch`](crate::SymbolSource::fetch).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Every mirror answered that it doesn't have the file. This result is
    /// cached as `Missing`.
    #[error("The symbol file was not found on any symbol server")]
    NotFoundAtAnyMirror,

    /// At least one mirror could not be reached or kept failing. Nothing is
    /// cached, so that a later request can try again.
    #[error("The symbol servers could not be reached: {0}")]
    TransportError(String),
}

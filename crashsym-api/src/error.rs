use crashsym::crashsym_table::ModuleKeyError;
use thiserror::Error;

/// A request that could not be understood. Symbolication failures are not
/// errors; they show up as unsymbolicated frames in the response.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Couldn't parse request: {0}")]
    ParseRequestErrorSerde(#[from] serde_json::error::Error),

    #[error("Malformed request JSON: {0}")]
    ParseRequestErrorContents(&'static str),

    #[error("Unsupported API version {0}")]
    UnsupportedVersion(u64),

    #[error("Invalid module {debug_file}/{debug_id}: {source}")]
    InvalidModule {
        debug_file: String,
        debug_id: String,
        #[source]
        source: ModuleKeyError,
    },

    #[error("Unrecognized URL {0}")]
    UnrecognizedUrl(String),

    #[error("Couldn't serialize response: {0}")]
    SerializeResponse(#[source] serde_json::error::Error),
}

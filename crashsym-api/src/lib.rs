//! This crate implements the JSON symbolication API on top of a
//! [`Symbolicator`]. It understands two request shapes:
//!
//!  - version 4, one implicit job:
//!    `{"memoryMap": [["xul.pdb", "<DEBUG_ID>"]], "stacks": [[[0, 4096]]], "version": 4}`,
//!    answered with `{"symbolicatedStacks": [...], "knownModules": [...]}`
//!  - version 5, a list of jobs:
//!    `{"jobs": [{"memoryMap": [...], "stacks": [...]}], "version": 5}`,
//!    answered with `{"results": [{"stacks": [...], "found_modules": {...}}]}`
//!
//! The `version` field is optional; without it, the shape decides.
//!
//! # Example
//!
//! ```rust,no_run
//! use crashsym_api::crashsym::{Symbolicator, SymbolicatorConfig};
//! use crashsym_api::Api;
//!
//! async fn run_query() -> String {
//!     let config = SymbolicatorConfig::new().cache_dir("/tmp/crashsym-cache");
//!     let symbolicator = Symbolicator::new(&config).unwrap();
//!     let api = Api::new(&symbolicator);
//!     api.query_api(
//!         "/symbolicate/v4",
//!         r#"{
//!             "memoryMap": [
//!               [
//!                 "firefox.pdb",
//!                 "AA152DEB2D9B76084C4C44205044422E1"
//!               ]
//!             ],
//!             "stacks": [
//!               [
//!                 [0, 204776],
//!                 [0, 129423]
//!               ]
//!             ],
//!             "version": 4
//!           }"#,
//!     ).await
//! }
//! ```

pub use crashsym;

use crashsym::Symbolicator;
use serde_json::json;

mod error;
mod symbolicate;

pub use error::ApiError;
pub use symbolicate::request_json::{ApiVersion, JobDocument, Request};

#[derive(Clone, Copy)]
pub struct Api<'a> {
    symbolicator: &'a Symbolicator,
}

impl<'a> Api<'a> {
    /// Create a [`Api`] instance which uses the provided [`Symbolicator`].
    pub fn new(symbolicator: &'a Symbolicator) -> Self {
        Self { symbolicator }
    }

    /// This is the main API of this crate. The return value is a JSON string;
    /// malformed requests get `{"error": "<message>"}`.
    ///
    /// The following "URLs" are supported:
    ///  - `/symbolicate/v4` and `/symbolicate/v5`: the request's `version`
    ///    field, if present, has to match the URL.
    ///  - `/symbolicate`: the version comes from the request document.
    pub async fn query_api(self, request_url: &str, request_json: &str) -> String {
        match self.query_api_result(request_url, request_json).await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Rejected {} request: {}", request_url, e);
                json!({ "error": e.to_string() }).to_string()
            }
        }
    }

    /// Like [`Api::query_api`], but returns malformed requests as an
    /// [`ApiError`].
    pub async fn query_api_result(
        self,
        request_url: &str,
        request_json: &str,
    ) -> Result<String, ApiError> {
        let url_version = match request_url {
            "/symbolicate" => None,
            "/symbolicate/v4" => Some(ApiVersion::V4),
            "/symbolicate/v5" => Some(ApiVersion::V5),
            _ => return Err(ApiError::UnrecognizedUrl(request_url.to_string())),
        };
        symbolicate::query_api_json(request_json, url_version, self.symbolicator).await
    }

    /// Symbolicates a request document, taking the version from the document.
    pub async fn symbolicate(self, request_json: &str) -> Result<String, ApiError> {
        symbolicate::query_api_json(request_json, None, self.symbolicator).await
    }
}

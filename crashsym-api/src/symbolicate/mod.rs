use crashsym::Symbolicator;
use futures_util::future::join_all;

use crate::error::ApiError;

pub mod request_json;
pub mod response_json;

use request_json::{ApiVersion, Request};
use response_json::{LegacyResponse, ModernResponse};

/// Parses `request_json`, resolves its jobs, and serializes the response in
/// the shape that matches the request's version.
///
/// The jobs of a version 5 request are resolved concurrently, and each one
/// only sees its own memory map.
pub async fn query_api_json(
    request_json: &str,
    url_version: Option<ApiVersion>,
    symbolicator: &Symbolicator,
) -> Result<String, ApiError> {
    let request = Request::parse(request_json, url_version)?;
    let jobs = request.to_jobs()?;
    let results = join_all(jobs.iter().map(|job| symbolicator.resolve(job))).await;

    let response = match request.version() {
        ApiVersion::V4 => match results.first() {
            Some(result) => serde_json::to_string(&LegacyResponse { result }),
            None => {
                return Err(ApiError::ParseRequestErrorContents(
                    "version 4 requests need stacks and memoryMap",
                ))
            }
        },
        ApiVersion::V5 => serde_json::to_string(&ModernResponse {
            jobs: &jobs,
            results: &results,
        }),
    };
    response.map_err(ApiError::SerializeResponse)
}

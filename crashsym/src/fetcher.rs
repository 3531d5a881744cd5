use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crashsym_table::ModuleKey;

use crate::config::RetryPolicy;
use crate::download_error::{DownloadError, FetchError};
use crate::observer::SymbolicationObserver;

pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Bytes, FetchError>> + Send + 'a>>;

/// Something that can produce the raw bytes of a symbol file.
///
/// The [`Symbolicator`](crate::Symbolicator) only talks to symbol servers
/// through this trait; [`HttpFetcher`] is the production implementation.
pub trait SymbolSource: Send + Sync + 'static {
    fn fetch<'a>(&'a self, key: &'a ModuleKey) -> FetchFuture<'a>;
}

/// Downloads symbol files from an ordered list of HTTP mirrors.
///
/// Mirrors are tried in order and the first successful download wins. A
/// "not found" answer moves on to the next mirror right away; transient
/// failures are retried with exponential backoff first.
pub struct HttpFetcher {
    reqwest_client: Result<reqwest::Client, reqwest::Error>,
    mirrors: Vec<String>,
    retry_policy: RetryPolicy,
    observer: Option<Arc<dyn SymbolicationObserver>>,
}

enum MirrorFailure {
    NotFound,
    Transport(DownloadError),
}

impl HttpFetcher {
    pub fn new(mirrors: Vec<String>, attempt_timeout: Duration, retry_policy: RetryPolicy) -> Self {
        let reqwest_client = reqwest::Client::builder()
            .timeout(attempt_timeout)
            .user_agent(concat!("crashsym/", env!("CARGO_PKG_VERSION")))
            .build();
        if let Err(e) = &reqwest_client {
            log::error!("Could not create the HTTP client: {}", e);
        }
        Self {
            reqwest_client,
            mirrors,
            retry_policy,
            observer: None,
        }
    }

    pub fn set_observer(&mut self, observer: Option<Arc<dyn SymbolicationObserver>>) {
        self.observer = observer;
    }

    pub fn mirrors(&self) -> &[String] {
        &self.mirrors
    }

    /// `<base_url without trailing '/'>/<debug_file>/<DEBUG_ID>/<sym_file>`
    pub fn url_for(base_url: &str, key: &ModuleKey) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), key.sym_path())
    }

    pub async fn fetch_from_mirrors(&self, key: &ModuleKey) -> Result<Bytes, FetchError> {
        let mut transport_error = None;
        for mirror in &self.mirrors {
            let url = Self::url_for(mirror, key);
            match self.fetch_from_mirror(key, &url).await {
                Ok(bytes) => return Ok(bytes),
                Err(MirrorFailure::NotFound) => {}
                Err(MirrorFailure::Transport(e)) => {
                    transport_error = Some(format!("{url}: {e}"));
                }
            }
        }
        match transport_error {
            Some(message) => Err(FetchError::TransportError(message)),
            None => Err(FetchError::NotFoundAtAnyMirror),
        }
    }

    async fn fetch_from_mirror(&self, key: &ModuleKey, url: &str) -> Result<Bytes, MirrorFailure> {
        let mut attempt = 1;
        loop {
            let ts_before_connect = Instant::now();
            let error = match self.download_once(url).await {
                Ok(bytes) => {
                    if let Some(observer) = &self.observer {
                        observer.on_fetch_succeeded(
                            key,
                            url,
                            bytes.len() as u64,
                            ts_before_connect.elapsed(),
                        );
                    }
                    return Ok(bytes);
                }
                Err(e) => e,
            };
            if let Some(observer) = &self.observer {
                observer.on_fetch_failed(key, url, &error);
            }

            if error.is_not_found() {
                return Err(MirrorFailure::NotFound);
            }
            if !error.is_transient() || attempt >= self.retry_policy.max_attempts_per_mirror {
                return Err(MirrorFailure::Transport(error));
            }
            let delay = self.retry_policy.delay_before_retry(attempt);
            log::debug!(
                "Attempt {} at {} failed ({}), retrying in {:?}",
                attempt,
                url,
                error,
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn download_once(&self, url: &str) -> Result<Bytes, DownloadError> {
        let reqwest_client = match self.reqwest_client.as_ref() {
            Ok(client) => client,
            Err(e) => return Err(DownloadError::ClientCreationFailed(e.to_string())),
        };

        // Send the request and wait for the headers.
        let response_result = reqwest_client.get(url).send().await;

        // Check the HTTP status code.
        let response_result = response_result.and_then(|response| response.error_for_status());

        let response = match response_result {
            Ok(response) => response,
            Err(e) => return Err(classify_reqwest_error(e)),
        };

        // The body is gzip-decoded by reqwest if the server compressed it.
        response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                DownloadError::Timeout
            } else {
                DownloadError::StreamRead(e.into())
            }
        })
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> DownloadError {
    if let Some(status) = e.status() {
        return DownloadError::StatusError(status.as_u16());
    }
    if e.is_timeout() {
        DownloadError::Timeout
    } else if e.is_redirect() {
        DownloadError::Redirect(e.into())
    } else if e.is_connect() || e.is_request() {
        DownloadError::OpenFailed(e.into())
    } else {
        DownloadError::Other(e.into())
    }
}

impl SymbolSource for HttpFetcher {
    fn fetch<'a>(&'a self, key: &'a ModuleKey) -> FetchFuture<'a> {
        Box::pin(self.fetch_from_mirrors(key))
    }
}

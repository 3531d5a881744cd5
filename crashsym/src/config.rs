use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bytesize::ByteSize;

pub const DEFAULT_SYMBOLS_URL: &str = "https://symbols.mozilla.org/try/";
pub const DEFAULT_CACHE_DIR: &str = "/tmp/cache";

/// The error type for [`SymbolicatorConfig::from_env`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} does not contain any URLs")]
    NoSymbolUrls(&'static str),

    #[error("Invalid retry policy: {0}")]
    InvalidRetryPolicy(String),
}

/// How often, and how patiently, a single mirror is retried after transient
/// failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Includes the first attempt.
    pub max_attempts_per_mirror: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts_per_mirror: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Checks the policy. `backoff_factor` has to be finite and at least 1.
    pub fn new(
        max_attempts_per_mirror: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
    ) -> Result<Self, ConfigError> {
        let policy = Self {
            max_attempts_per_mirror,
            base_delay,
            max_delay,
            backoff_factor,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::InvalidRetryPolicy(format!(
                "backoff factor {} is not a finite number >= 1",
                self.backoff_factor
            )));
        }
        if self.max_attempts_per_mirror == 0 {
            return Err(ConfigError::InvalidRetryPolicy(
                "max_attempts_per_mirror must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The delay before retry number `retry` (starting at 1), capped at
    /// `max_delay`. Delays that don't fit a `Duration` are capped too.
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_factor.powi(exponent);
        match Duration::try_from_secs_f64(self.base_delay.as_secs_f64() * factor) {
            Ok(delay) => delay.min(self.max_delay),
            Err(_) => self.max_delay,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SymbolicatorConfig {
    pub(crate) symbol_urls: Vec<String>,
    pub(crate) cache_dir: PathBuf,
    pub(crate) cache_max_size: Option<u64>,
    pub(crate) cache_max_age: Option<Duration>,
    pub(crate) negative_ttl: Duration,
    pub(crate) job_timeout: Option<Duration>,
    pub(crate) attempt_timeout: Duration,
    pub(crate) retry_policy: RetryPolicy,
}

impl Default for SymbolicatorConfig {
    fn default() -> Self {
        Self {
            symbol_urls: vec![DEFAULT_SYMBOLS_URL.to_string()],
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            cache_max_size: Some(ByteSize::gib(20).as_u64()),
            cache_max_age: None,
            negative_ttl: Duration::from_secs(60 * 60),
            job_timeout: Some(Duration::from_secs(60)),
            attempt_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl SymbolicatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the symbol server base URLs, in the order in which they are tried.
    ///
    /// A URL is combined with a module's symbol path, e.g.
    /// `<url>/xul.pdb/44E4EC8C2F41492B9369D6B9A059577C2/xul.sym`.
    pub fn symbol_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbol_urls = urls.into_iter().map(Into::into).collect();
        self
    }

    /// The directory under which the cache keeps its `staging` and `committed`
    /// directories.
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn cache_max_size(mut self, max_size_bytes: Option<u64>) -> Self {
        self.cache_max_size = max_size_bytes;
        self
    }

    pub fn cache_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.cache_max_age = max_age;
        self
    }

    /// How long "not found" and "invalid" results are remembered.
    pub fn negative_ttl(mut self, negative_ttl: Duration) -> Self {
        self.negative_ttl = negative_ttl;
        self
    }

    /// The time budget for resolving one job. Modules that haven't been loaded
    /// when it runs out are reported as timed out, and their frames stay
    /// unsymbolicated.
    pub fn job_timeout(mut self, job_timeout: Option<Duration>) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    /// The timeout for a single request to a single mirror.
    pub fn attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    /// Use [`RetryPolicy::new`] to build a checked policy. An unchecked
    /// policy is checked again when the [`Symbolicator`](crate::Symbolicator)
    /// is created.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Reads the configuration from `CRASHSYM_*` environment variables.
    /// Variables that aren't set keep their defaults.
    ///
    ///  - `CRASHSYM_SYMBOLS_URLS`: comma-separated mirror URLs
    ///  - `CRASHSYM_CACHE_DIR`
    ///  - `CRASHSYM_CACHE_MAX_SIZE`: bytes, or a size like `40 GiB`
    ///  - `CRASHSYM_NEGATIVE_TTL_SECS`
    ///  - `CRASHSYM_JOB_TIMEOUT_SECS`: 0 disables the job timeout
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = var("CRASHSYM_SYMBOLS_URLS") {
            let urls: Vec<String> = value
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(ToOwned::to_owned)
                .collect();
            if urls.is_empty() {
                return Err(ConfigError::NoSymbolUrls("CRASHSYM_SYMBOLS_URLS"));
            }
            config.symbol_urls = urls;
        }
        if let Some(value) = var("CRASHSYM_CACHE_DIR") {
            config.cache_dir = PathBuf::from(value);
        }
        if let Some(value) = var("CRASHSYM_CACHE_MAX_SIZE") {
            let size = ByteSize::from_str(value.trim()).map_err(|reason| {
                ConfigError::InvalidValue {
                    var: "CRASHSYM_CACHE_MAX_SIZE",
                    value: value.clone(),
                    reason: reason.to_string(),
                }
            })?;
            config.cache_max_size = Some(size.as_u64());
        }
        if let Some(value) = var("CRASHSYM_NEGATIVE_TTL_SECS") {
            config.negative_ttl = parse_secs("CRASHSYM_NEGATIVE_TTL_SECS", &value)?;
        }
        if let Some(value) = var("CRASHSYM_JOB_TIMEOUT_SECS") {
            let timeout = parse_secs("CRASHSYM_JOB_TIMEOUT_SECS", &value)?;
            config.job_timeout = (!timeout.is_zero()).then_some(timeout);
        }
        Ok(config)
    }
}

fn parse_secs(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| ConfigError::InvalidValue {
            var,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

//! Symbolicates crash stacks with Breakpad symbol files.
//!
//! A [`Symbolicator`] takes a [`Job`] (a list of modules plus stacks of
//! module-relative offsets) and returns the function name, source file, line
//! and inline frames for every frame it can resolve. Symbol files are
//! downloaded from an ordered list of mirrors, parsed, and kept in an on-disk
//! cache shared by all jobs. Concurrent jobs that need the same module share
//! one download.
//!
//! ```rust,no_run
//! use crashsym::{FrameRequest, Job, Symbolicator, SymbolicatorConfig};
//! use crashsym::crashsym_table::ModuleKey;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SymbolicatorConfig::from_env()?;
//! let symbolicator = Symbolicator::new(&config)?;
//! let job = Job::new(
//!     vec![ModuleKey::new("xul.pdb", "44E4EC8C2F41492B9369D6B9A059577C2")?],
//!     vec![vec![FrameRequest::new(Some(0), 0x1010), FrameRequest::new(None, 0x40)]],
//! );
//! let result = symbolicator.resolve(&job).await;
//! for frame in &result.stacks[0] {
//!     println!("{:?} {:?}", frame.module, frame.function);
//! }
//! # Ok(())
//! # }
//! ```

pub use crashsym_cache;
pub use crashsym_table;

mod config;
mod download_error;
mod fetcher;
mod job;
pub mod metrics;
mod observer;
mod resolver;

pub use config::{
    ConfigError, RetryPolicy, SymbolicatorConfig, DEFAULT_CACHE_DIR, DEFAULT_SYMBOLS_URL,
};
pub use download_error::{DownloadError, FetchError};
pub use fetcher::{FetchFuture, HttpFetcher, SymbolSource};
pub use job::{FrameRequest, InlineFrame, Job, JobResult, ModuleStatus, ResolvedFrame};
pub use metrics::{MetricsObserver, MetricsSink};
pub use observer::{LoggingObserver, SymbolicationObserver};
pub use resolver::{SetupError, Symbolicator};

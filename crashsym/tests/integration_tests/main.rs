use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use crashsym::crashsym_cache::{DiskCache, DiskCacheConfig, SymbolArtifact};
use crashsym::crashsym_table::ModuleKey;
use crashsym::{
    ConfigError, FetchError, FetchFuture, FrameRequest, HttpFetcher, InlineFrame, Job,
    MetricsObserver, MetricsSink, ModuleStatus, RetryPolicy, SetupError, SymbolSource,
    Symbolicator, SymbolicatorConfig,
};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DEBUG_ID: &str = "AA152DEB2D9B76084C4C44205044422E1";
const SYM_PATH: &str = "/example.pdb/AA152DEB2D9B76084C4C44205044422E1/example.sym";
const CVT_S: &str = "mozilla::PrintfTarget::cvt_s(const char*, int, int, int)";

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn example_sym() -> Vec<u8> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("fixtures")
        .join("breakpad")
        .join("example.sym");
    std::fs::read(path).unwrap()
}

fn example_key() -> ModuleKey {
    ModuleKey::new("example.pdb", DEBUG_ID).unwrap()
}

fn fast_retries() -> RetryPolicy {
    RetryPolicy {
        max_attempts_per_mirror: 3,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        backoff_factor: 2.0,
    }
}

fn config(cache_dir: &TempDir, mirrors: &[&MockServer]) -> SymbolicatorConfig {
    SymbolicatorConfig::new()
        .symbol_urls(mirrors.iter().map(|server| server.uri()))
        .cache_dir(cache_dir.path())
        .attempt_timeout(Duration::from_secs(5))
        .retry_policy(fast_retries())
        .job_timeout(Some(Duration::from_secs(10)))
}

fn single_frame_job(module_offset: u64) -> Job {
    Job::new(
        vec![example_key()],
        vec![vec![FrameRequest::new(Some(0), module_offset)]],
    )
}

async fn serve_example(server: &MockServer, expected_requests: u64) {
    Mock::given(method("GET"))
        .and(path(SYM_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(example_sym()))
        .expect(expected_requests)
        .mount(server)
        .await;
}

async fn respond_with_status(server: &MockServer, status: u16, expected_requests: u64) {
    Mock::given(method("GET"))
        .and(path(SYM_PATH))
        .respond_with(ResponseTemplate::new(status))
        .expect(expected_requests)
        .mount(server)
        .await;
}

#[tokio::test]
async fn symbolicates_frames_with_inlines() {
    init_logger();
    let server = MockServer::start().await;
    serve_example(&server, 1).await;
    let cache_dir = TempDir::new().unwrap();
    let symbolicator = Symbolicator::new(&config(&cache_dir, &[&server])).unwrap();

    let job = Job::new(
        vec![example_key()],
        vec![vec![
            FrameRequest::new(Some(0), 0x101a),
            FrameRequest::new(Some(0), 0x10b0),
            FrameRequest::new(None, 0x40),
            FrameRequest::new(Some(7), 0x40),
            FrameRequest::new(Some(0), 0x5000),
        ]],
    );
    let result = symbolicator.resolve(&job).await;
    assert_eq!(result.modules, [ModuleStatus::Found]);

    let frames = &result.stacks[0];
    assert_eq!(frames.len(), 5);

    assert_eq!(frames[0].frame, 0);
    assert_eq!(frames[0].module.as_deref(), Some("example.pdb"));
    assert_eq!(
        frames[0].function.as_deref(),
        Some("mozilla::PrintfTarget::vprint(const char*, va_list)")
    );
    assert_eq!(frames[0].function_offset, Some(0x1a));
    assert_eq!(
        frames[0].file.as_deref(),
        Some("hg:hg.mozilla.org/mozilla-central:mozglue/misc/Printf.cpp:2e3f6e1ab3b4")
    );
    assert_eq!(frames[0].line, Some(210));
    assert_eq!(
        frames[0].inlines,
        [
            InlineFrame {
                function: "mozilla::Span<const char>::Length() const".to_string(),
                file: Some(
                    "/builds/worker/workspace/obj-build/dist/include/mozilla/Span.h".to_string()
                ),
                line: Some(412),
            },
            InlineFrame {
                function:
                    "mozilla::Vector<char,0,mozilla::MallocAllocPolicy>::append(const char*, size_t)"
                        .to_string(),
                file: Some(
                    "hg:hg.mozilla.org/mozilla-central:mfbt/Vector.h:2e3f6e1ab3b4".to_string()
                ),
                line: Some(88),
            },
        ]
    );

    assert_eq!(frames[1].function.as_deref(), Some("__security_check_cookie"));
    assert_eq!(frames[1].function_offset, Some(0x10));
    assert_eq!(frames[1].file, None);
    assert!(frames[1].inlines.is_empty());

    // Unknown modules.
    assert_eq!(frames[2].module, None);
    assert!(!frames[2].is_symbolicated());
    assert_eq!(frames[3].module, None);
    assert_eq!(frames[3].module_offset, 0x40);

    // Known module, but the offset is outside of all records.
    assert_eq!(frames[4].module.as_deref(), Some("example.pdb"));
    assert_eq!(frames[4].function, None);
    assert_eq!(frames[4].frame, 4);
}

#[tokio::test]
async fn first_mirror_wins() {
    init_logger();
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;
    serve_example(&primary, 1).await;
    serve_example(&secondary, 0).await;
    let cache_dir = TempDir::new().unwrap();
    let symbolicator = Symbolicator::new(&config(&cache_dir, &[&primary, &secondary])).unwrap();

    let result = symbolicator.resolve(&single_frame_job(0x1065)).await;
    assert_eq!(result.modules, [ModuleStatus::Found]);
    assert_eq!(result.stacks[0][0].function.as_deref(), Some(CVT_S));
}

#[tokio::test]
async fn not_found_falls_through_to_next_mirror() {
    init_logger();
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;
    respond_with_status(&primary, 404, 1).await;
    serve_example(&secondary, 1).await;
    let cache_dir = TempDir::new().unwrap();
    let symbolicator = Symbolicator::new(&config(&cache_dir, &[&primary, &secondary])).unwrap();

    let result = symbolicator.resolve(&single_frame_job(0x1065)).await;
    assert_eq!(result.modules, [ModuleStatus::Found]);
}

#[tokio::test]
async fn transient_errors_are_retried() {
    init_logger();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(SYM_PATH))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    serve_example(&server, 1).await;
    let cache_dir = TempDir::new().unwrap();
    let symbolicator = Symbolicator::new(&config(&cache_dir, &[&server])).unwrap();

    let result = symbolicator.resolve(&single_frame_job(0x1065)).await;
    assert_eq!(result.modules, [ModuleStatus::Found]);
}

#[tokio::test]
async fn fetcher_distinguishes_not_found_from_transport_errors() {
    init_logger();
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    respond_with_status(&first, 404, 2).await;
    respond_with_status(&second, 404, 1).await;

    let fetcher = HttpFetcher::new(
        vec![first.uri(), second.uri()],
        Duration::from_secs(5),
        fast_retries(),
    );
    assert_eq!(
        fetcher.fetch(&example_key()).await,
        Err(FetchError::NotFoundAtAnyMirror)
    );

    let broken = MockServer::start().await;
    // 500 is retried until the attempts run out.
    respond_with_status(&broken, 500, 3).await;
    let fetcher = HttpFetcher::new(
        vec![first.uri(), broken.uri()],
        Duration::from_secs(5),
        fast_retries(),
    );
    assert!(matches!(
        fetcher.fetch(&example_key()).await,
        Err(FetchError::TransportError(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_jobs_share_one_download() {
    init_logger();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(SYM_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(example_sym())
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;
    let cache_dir = TempDir::new().unwrap();
    let observer = Arc::new(MetricsObserver::new(RecordingSink::default()));
    let symbolicator = Arc::new(
        Symbolicator::with_observer(&config(&cache_dir, &[&server]), observer.clone()).unwrap(),
    );

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let symbolicator = Arc::clone(&symbolicator);
            tokio::spawn(async move { symbolicator.resolve(&single_frame_job(0x1065)).await })
        })
        .collect();
    for handle in handles {
        let result = handle.await.unwrap();
        assert_eq!(result.modules, [ModuleStatus::Found]);
        assert_eq!(result.stacks[0][0].function.as_deref(), Some(CVT_S));
    }
    let sink = observer.sink();
    assert_eq!(sink.count("crashsym.fetch.success"), 1);
    assert_eq!(sink.count("crashsym.parse.success"), 1);
}

#[tokio::test]
async fn missing_modules_are_remembered() {
    init_logger();
    let server = MockServer::start().await;
    respond_with_status(&server, 404, 1).await;
    let cache_dir = TempDir::new().unwrap();
    let symbolicator = Symbolicator::new(&config(&cache_dir, &[&server])).unwrap();

    for _ in 0..2 {
        let result = symbolicator.resolve(&single_frame_job(0x1065)).await;
        assert_eq!(result.modules, [ModuleStatus::Missing]);
        assert_eq!(result.modules[0].found(), Some(false));
        let frame = &result.stacks[0][0];
        assert_eq!(frame.module.as_deref(), Some("example.pdb"));
        assert_eq!(frame.function, None);
    }
}

#[tokio::test]
async fn transport_errors_are_not_cached() {
    init_logger();
    let server = MockServer::start().await;
    // Three attempts per job.
    respond_with_status(&server, 500, 6).await;
    let cache_dir = TempDir::new().unwrap();
    let symbolicator = Symbolicator::new(&config(&cache_dir, &[&server])).unwrap();

    for _ in 0..2 {
        let result = symbolicator.resolve(&single_frame_job(0x1065)).await;
        assert_eq!(result.modules, [ModuleStatus::Unavailable]);
        assert!(!result.stacks[0][0].is_symbolicated());
    }
    assert_eq!(symbolicator.cache().total_size(), 0);
}

#[tokio::test]
async fn symbol_file_for_another_build_is_invalid() {
    init_logger();
    let other_key = ModuleKey::new("example.pdb", "AA152DEB2D9B76084C4C44205044422E2").unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/example.pdb/{}/example.sym", other_key.debug_id_string())))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(example_sym()))
        .expect(1)
        .mount(&server)
        .await;
    let cache_dir = TempDir::new().unwrap();
    let symbolicator = Symbolicator::new(&config(&cache_dir, &[&server])).unwrap();

    let job = Job::new(
        vec![other_key],
        vec![vec![FrameRequest::new(Some(0), 0x1065)]],
    );
    for _ in 0..2 {
        let result = symbolicator.resolve(&job).await;
        assert_eq!(result.modules, [ModuleStatus::Invalid]);
        assert_eq!(result.stacks[0][0].module.as_deref(), Some("example.pdb"));
        assert_eq!(result.stacks[0][0].function, None);
    }
}

#[tokio::test]
async fn slow_mirrors_time_out() {
    init_logger();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(SYM_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(example_sym())
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;
    let cache_dir = TempDir::new().unwrap();
    let config =
        config(&cache_dir, &[&server]).job_timeout(Some(Duration::from_millis(200)));
    let symbolicator = Symbolicator::new(&config).unwrap();

    let result = symbolicator.resolve(&single_frame_job(0x1065)).await;
    assert_eq!(result.modules, [ModuleStatus::TimedOut]);
    assert_eq!(result.stacks[0][0].module.as_deref(), Some("example.pdb"));
    assert!(!result.stacks[0][0].is_symbolicated());
}

struct CountingSource {
    data: Bytes,
    fetches: AtomicUsize,
}

impl SymbolSource for CountingSource {
    fn fetch<'a>(&'a self, _key: &'a ModuleKey) -> FetchFuture<'a> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.data.clone())
        })
    }
}

#[tokio::test]
async fn custom_source_and_cache_hits() {
    init_logger();
    let cache_dir = TempDir::new().unwrap();
    let source = Arc::new(CountingSource {
        data: Bytes::from(example_sym()),
        fetches: AtomicUsize::new(0),
    });
    let cache = DiskCache::open(DiskCacheConfig::new(cache_dir.path())).unwrap();
    let symbolicator = Symbolicator::from_parts(cache, source.clone());

    let unused = ModuleKey::new("unused.dll", "44E4EC8C2F41492B9369D6B9A059577C2").unwrap();
    let job = Job::new(
        vec![example_key(), unused],
        vec![vec![FrameRequest::new(Some(0), 0x1205)]],
    );
    for _ in 0..2 {
        let result = symbolicator.resolve(&job).await;
        assert_eq!(
            result.modules,
            [ModuleStatus::Found, ModuleStatus::NotRequested]
        );
        assert_eq!(result.modules[1].found(), None);
        assert_eq!(
            result.stacks[0][0].function.as_deref(),
            Some("<folded> mozilla::detail::EmptyHelper()")
        );
    }
    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn raw_cache_entries_are_parsed_without_fetching() {
    init_logger();
    let cache_dir = TempDir::new().unwrap();
    let source = Arc::new(CountingSource {
        data: Bytes::new(),
        fetches: AtomicUsize::new(0),
    });
    let cache = DiskCache::open(DiskCacheConfig::new(cache_dir.path())).unwrap();
    cache
        .put(&example_key(), &SymbolArtifact::Raw(Bytes::from(example_sym())))
        .await
        .unwrap();
    let symbolicator = Symbolicator::from_parts(cache, source.clone());

    let result = symbolicator.resolve(&single_frame_job(0x1065)).await;
    assert_eq!(result.modules, [ModuleStatus::Found]);
    assert_eq!(source.fetches.load(Ordering::SeqCst), 0);

    let entry = symbolicator.cache().get(&example_key()).await.unwrap();
    assert!(matches!(entry.artifact(), SymbolArtifact::Parsed(_)));
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn count(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.starts_with(prefix))
            .count()
    }
}

impl MetricsSink for RecordingSink {
    fn incr(&self, name: &'static str, tags: &[(&'static str, &str)]) {
        let tags: Vec<String> = tags.iter().map(|(k, v)| format!("{k}:{v}")).collect();
        self.events
            .lock()
            .unwrap()
            .push(format!("{name} {}", tags.join(",")));
    }

    fn timing(&self, name: &'static str, _value: Duration, _tags: &[(&'static str, &str)]) {
        self.events.lock().unwrap().push(name.to_string());
    }
}

#[tokio::test]
async fn metrics_observer_sees_the_whole_pipeline() {
    init_logger();
    let server = MockServer::start().await;
    serve_example(&server, 1).await;
    let cache_dir = TempDir::new().unwrap();
    let observer = Arc::new(MetricsObserver::new(RecordingSink::default()));
    let symbolicator =
        Symbolicator::with_observer(&config(&cache_dir, &[&server]), observer.clone()).unwrap();

    symbolicator.resolve(&single_frame_job(0x1065)).await;
    let sink = observer.sink();
    assert_eq!(sink.count("crashsym.fetch.success"), 1);
    assert_eq!(sink.count("crashsym.parse.success"), 1);
    assert_eq!(sink.count("crashsym.cache.miss"), 1);
    assert_eq!(sink.count("crashsym.cache.hit"), 0);
    assert_eq!(sink.count("crashsym.job.resolve_time"), 1);

    symbolicator.resolve(&single_frame_job(0x1065)).await;
    assert_eq!(sink.count("crashsym.cache.hit kind:parsed"), 1);
    assert_eq!(sink.count("crashsym.cache.miss"), 1);
    assert_eq!(sink.count("crashsym.fetch.success"), 1);
    assert_eq!(sink.count("crashsym.job.resolve_time"), 2);
}

#[tokio::test]
async fn cache_write_failures_still_symbolicate() {
    init_logger();
    let server = MockServer::start().await;
    serve_example(&server, 2).await;
    let cache_dir = TempDir::new().unwrap();
    let observer = Arc::new(MetricsObserver::new(RecordingSink::default()));
    let symbolicator =
        Symbolicator::with_observer(&config(&cache_dir, &[&server]), observer.clone()).unwrap();

    // The entry's parent directory can't be created.
    let module_dir = cache_dir.path().join("committed").join("example.pdb");
    std::fs::write(&module_dir, b"not a directory").unwrap();

    for _ in 0..2 {
        let result = symbolicator.resolve(&single_frame_job(0x1065)).await;
        assert_eq!(result.modules, [ModuleStatus::Found]);
        assert_eq!(result.stacks[0][0].function.as_deref(), Some(CVT_S));
    }
    let sink = observer.sink();
    assert_eq!(sink.count("crashsym.cache.write_error"), 2);
    assert_eq!(sink.count("crashsym.cache.hit"), 0);
    assert_eq!(symbolicator.cache().total_size(), 0);
}

#[tokio::test]
async fn invalid_retry_policies_are_rejected() {
    let cache_dir = TempDir::new().unwrap();
    let config = SymbolicatorConfig::new()
        .cache_dir(cache_dir.path())
        .retry_policy(RetryPolicy {
            backoff_factor: f64::NAN,
            ..RetryPolicy::default()
        });
    assert!(matches!(
        Symbolicator::new(&config),
        Err(SetupError::Config(ConfigError::InvalidRetryPolicy(_)))
    ));
}

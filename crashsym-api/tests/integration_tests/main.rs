use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use assert_json_diff::assert_json_eq;
use bytes::Bytes;
use crashsym_api::crashsym::crashsym_cache::{DiskCache, DiskCacheConfig, SymbolArtifact};
use crashsym_api::crashsym::crashsym_table::{parse_sym_file, ModuleKey};
use crashsym_api::crashsym::{FetchError, FetchFuture, SymbolSource, Symbolicator};
use crashsym_api::{Api, ApiError};
use serde_json::json;
use tempfile::TempDir;

const DEBUG_ID: &str = "ABCDEF0123456789ABCDEF01234567890";

fn sym_file(debug_file: &str, debug_id: &str) -> String {
    format!(
        "MODULE windows x86_64 {debug_id} {debug_file}
FILE 0 src/foo.cpp
FUNC 0 c8 0 foo
0 64 10 0
64 64 11 0
"
    )
}

/// Serves symbol files by debug file name and counts the calls.
#[derive(Default)]
struct MapSource {
    files: HashMap<String, Bytes>,
    fetches: AtomicUsize,
}

impl MapSource {
    fn with_file(mut self, debug_file: &str, contents: String) -> Self {
        self.files.insert(debug_file.to_string(), Bytes::from(contents));
        self
    }

    fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl SymbolSource for MapSource {
    fn fetch<'a>(&'a self, key: &'a ModuleKey) -> FetchFuture<'a> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.files
                .get(key.debug_file())
                .cloned()
                .ok_or(FetchError::NotFoundAtAnyMirror)
        })
    }
}

fn symbolicator(cache_dir: &TempDir, source: &Arc<MapSource>) -> Symbolicator {
    let _ = env_logger::builder().is_test(true).try_init();
    let cache = DiskCache::open(DiskCacheConfig::new(cache_dir.path())).unwrap();
    Symbolicator::from_parts(cache, source.clone())
}

fn v4_request(debug_file: &str) -> String {
    json!({
        "stacks": [[[0, 100]]],
        "memoryMap": [[debug_file, DEBUG_ID]],
        "version": 4
    })
    .to_string()
}

#[tokio::test]
async fn v4_request_with_cached_symbols() {
    let cache_dir = TempDir::new().unwrap();
    let source = Arc::new(MapSource::default());
    let symbolicator = symbolicator(&cache_dir, &source);

    let key = ModuleKey::new("a.pdb", DEBUG_ID).unwrap();
    let table = parse_sym_file(sym_file("a.pdb", DEBUG_ID).as_bytes()).unwrap();
    symbolicator
        .cache()
        .put(&key, &SymbolArtifact::Parsed(Arc::new(table)))
        .await
        .unwrap();

    let response = Api::new(&symbolicator)
        .symbolicate(&v4_request("a.pdb"))
        .await
        .unwrap();
    let response: serde_json::Value = serde_json::from_str(&response).unwrap();
    assert_json_eq!(
        response,
        json!({
            "symbolicatedStacks": [[
                {
                    "frame": 0,
                    "module_offset": 100,
                    "module": "a.pdb",
                    "function": "foo",
                    "function_offset": 100,
                    "file": "src/foo.cpp",
                    "line": 11
                }
            ]],
            "knownModules": [true]
        })
    );
    assert_eq!(source.fetch_count(), 0);
}

#[tokio::test]
async fn missing_symbols_are_not_fetched_twice() {
    let cache_dir = TempDir::new().unwrap();
    let source = Arc::new(MapSource::default());
    let symbolicator = symbolicator(&cache_dir, &source);
    let api = Api::new(&symbolicator);

    for _ in 0..2 {
        let response = api.query_api("/symbolicate/v4", &v4_request("a.pdb")).await;
        let response: serde_json::Value = serde_json::from_str(&response).unwrap();
        assert_json_eq!(
            response,
            json!({
                "symbolicatedStacks": [[
                    {
                        "frame": 0,
                        "module_offset": 100,
                        "module": "a.pdb",
                        "function": null,
                        "function_offset": null,
                        "file": null,
                        "line": null
                    }
                ]],
                "knownModules": [false]
            })
        );
    }
    assert_eq!(source.fetch_count(), 1);
}

#[tokio::test]
async fn symbol_file_for_another_build() {
    let cache_dir = TempDir::new().unwrap();
    let other_build = sym_file("a.pdb", "00000000000000000000000000000000F");
    let source = Arc::new(MapSource::default().with_file("a.pdb", other_build));
    let symbolicator = symbolicator(&cache_dir, &source);
    let api = Api::new(&symbolicator);

    for _ in 0..2 {
        let response = api.symbolicate(&v4_request("a.pdb")).await.unwrap();
        let response: serde_json::Value = serde_json::from_str(&response).unwrap();
        assert_eq!(response["symbolicatedStacks"][0][0]["function"], json!(null));
        assert_eq!(response["knownModules"], json!([false]));
    }
    assert_eq!(source.fetch_count(), 1);

    let key = ModuleKey::new("a.pdb", DEBUG_ID).unwrap();
    let entry = symbolicator.cache().get(&key).await.unwrap();
    assert!(matches!(entry.artifact(), SymbolArtifact::Invalid(_)));
}

#[tokio::test]
async fn v5_jobs_are_independent() {
    let cache_dir = TempDir::new().unwrap();
    let source = Arc::new(MapSource::default().with_file("a.pdb", sym_file("a.pdb", DEBUG_ID)));
    let symbolicator = symbolicator(&cache_dir, &source);

    let request = json!({
        "jobs": [
            {
                "memoryMap": [["a.pdb", DEBUG_ID]],
                "stacks": [[[0, 100], [null, 5]]]
            },
            {
                "memoryMap": [["b.pdb", DEBUG_ID], ["a.pdb", DEBUG_ID]],
                "stacks": [[[0, 100]], [[1, 300]]]
            }
        ],
        "version": 5
    });
    let response = Api::new(&symbolicator)
        .query_api("/symbolicate/v5", &request.to_string())
        .await;
    let response: serde_json::Value = serde_json::from_str(&response).unwrap();

    let unknown = |frame: usize, offset: u64, module: serde_json::Value| {
        json!({
            "frame": frame,
            "module_offset": offset,
            "module": module,
            "function": null,
            "function_offset": null,
            "file": null,
            "line": null
        })
    };
    assert_json_eq!(
        response,
        json!({
            "results": [
                {
                    "stacks": [[
                        {
                            "frame": 0,
                            "module_offset": 100,
                            "module": "a.pdb",
                            "function": "foo",
                            "function_offset": 100,
                            "file": "src/foo.cpp",
                            "line": 11
                        },
                        unknown(1, 5, json!(null))
                    ]],
                    "found_modules": {
                        "a.pdb/ABCDEF0123456789ABCDEF01234567890": true
                    }
                },
                {
                    "stacks": [
                        [unknown(0, 100, json!("b.pdb"))],
                        // Past the end of foo.
                        [unknown(0, 300, json!("a.pdb"))]
                    ],
                    "found_modules": {
                        "b.pdb/ABCDEF0123456789ABCDEF01234567890": false,
                        "a.pdb/ABCDEF0123456789ABCDEF01234567890": true
                    }
                }
            ]
        })
    );
    // One fetch per distinct module.
    assert_eq!(source.fetch_count(), 2);
}

#[tokio::test]
async fn malformed_requests_are_errors() {
    let cache_dir = TempDir::new().unwrap();
    let source = Arc::new(MapSource::default());
    let symbolicator = symbolicator(&cache_dir, &source);
    let api = Api::new(&symbolicator);

    let response = api.query_api("/symbolicate/v4", "{\"stacks\": ").await;
    let response: serde_json::Value = serde_json::from_str(&response).unwrap();
    assert!(response["error"]
        .as_str()
        .unwrap()
        .starts_with("Couldn't parse request"));

    assert!(matches!(
        api.query_api_result("/source/v1", "{}").await,
        Err(ApiError::UnrecognizedUrl(_))
    ));
    assert!(matches!(
        api.query_api_result("/symbolicate/v5", &v4_request("a.pdb")).await,
        Err(ApiError::ParseRequestErrorContents(_))
    ));

    let bad_module = json!({
        "stacks": [[[0, 100]]],
        "memoryMap": [["../a.pdb", DEBUG_ID]]
    });
    assert!(matches!(
        api.symbolicate(&bad_module.to_string()).await,
        Err(ApiError::InvalidModule { .. })
    ));
    assert_eq!(source.fetch_count(), 0);
}

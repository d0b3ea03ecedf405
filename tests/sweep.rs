//! End-to-end sweeps: registry file in, CSV files out.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use a3s_sweep::backends::{CordisApi, StaticBackend};
use a3s_sweep::config::DelaySettings;
use a3s_sweep::content::{ContentAcquirer, StaticContentFetcher};
use a3s_sweep::delay::AdaptiveDelay;
use a3s_sweep::fetcher_http::HttpDownloader;
use a3s_sweep::proxy::ProxyPool;
use a3s_sweep::{
    BackendKind, CsvSink, Orchestrator, Phase, Registry, SearchHit, SinkName, SweepRequest,
};
use tokio::sync::mpsc::unbounded_channel;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn write_registry(dir: &Path) -> PathBuf {
    let path = dir.join("codes.csv");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "code,label").unwrap();
    writeln!(file, "01.0,Cotton").unwrap();
    writeln!(file, "02.0,Wool").unwrap();
    path
}

fn words(n: usize, word: &str) -> String {
    vec![word; n].join(" ")
}

fn read_rows(path: &Path) -> Vec<csv::StringRecord> {
    csv::Reader::from_path(path)
        .unwrap()
        .records()
        .map(|r| r.unwrap())
        .collect()
}

fn sink(dir: &Path, backend: BackendKind) -> CsvSink {
    CsvSink::create(
        dir,
        &SinkName {
            from_code: "01.0",
            to_code: "01.0",
            backend,
            worker_id: 1,
        },
    )
    .unwrap()
}

#[tokio::test]
async fn test_sweep_writes_kept_and_omitted_files() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::load_csv(write_registry(dir.path())).unwrap();

    let backend = StaticBackend::new(BackendKind::DuckDuckGo).with_hits(
        "Cotton",
        vec![
            SearchHit::new("https://a.org/short", "Short note", "A short note"),
            SearchHit::new("https://a.org/long", "Cotton report", "Visit: www.a.org"),
        ],
    );
    let fetcher = StaticContentFetcher::new()
        .with_page("https://a.org/short", words(10, "cotton"))
        .with_page("https://a.org/long", words(50, "cotton"));
    let out = dir.path().join("out");
    let sink = Arc::new(sink(&out, BackendKind::DuckDuckGo));
    let kept_path = sink.kept_path().to_path_buf();
    let omitted_path = sink.omitted_path().to_path_buf();

    let orchestrator = Orchestrator::new(Arc::new(backend), Arc::new(fetcher), sink);
    let (tx, _rx) = unbounded_channel();
    let outcome = orchestrator
        .run_sweep(&registry, &SweepRequest::new("01.0", "01.0"), &tx)
        .await
        .unwrap();

    assert_eq!(outcome.phase, Phase::Done);
    assert_eq!(outcome.output.kept_path.as_deref(), Some(kept_path.as_path()));

    let kept = read_rows(&kept_path);
    assert_eq!(kept.len(), 1);
    assert_eq!(&kept[0][0], "01.0");
    assert_eq!(&kept[0][1], "Cotton");
    assert_eq!(&kept[0][4], "https://a.org/long");
    assert_eq!(&kept[0][5], "Total words: 50 | Cotton: 50");
    assert!(!kept[0][3].contains("www.a.org"));

    let omitted = read_rows(&omitted_path);
    assert_eq!(omitted.len(), 1);
    assert_eq!(&omitted[0][3], "https://a.org/short");
    assert_eq!(&omitted[0][5], "Low word count: 10 (minimum 30)");
}

#[tokio::test]
async fn test_sweep_without_kept_results_removes_empty_file() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::load_csv(write_registry(dir.path())).unwrap();

    let backend = StaticBackend::new(BackendKind::DuckDuckGo)
        .with_hits("Cotton", vec![SearchHit::new("https://a.org/short", "Short", "")]);
    let fetcher = StaticContentFetcher::new().with_page("https://a.org/short", words(5, "cotton"));
    let sink = Arc::new(sink(dir.path(), BackendKind::DuckDuckGo));
    let kept_path = sink.kept_path().to_path_buf();

    let orchestrator = Orchestrator::new(Arc::new(backend), Arc::new(fetcher), sink);
    let (tx, _rx) = unbounded_channel();
    let outcome = orchestrator
        .run_sweep(&registry, &SweepRequest::new("01.0", "01.0"), &tx)
        .await
        .unwrap();

    assert!(outcome.output.kept_path.is_none());
    assert!(!kept_path.exists());
    assert_eq!(read_rows(outcome.output.omitted_path.as_deref().unwrap()).len(), 1);
}

#[tokio::test]
async fn test_api_sweep_over_http() {
    let server = MockServer::start().await;
    let bindings = format!(
        r#"{{"results":{{"bindings":[
            {{"pubTitle":{{"value":"Cotton yields"}},"pubUrl":{{"value":"{base}/docs/long.html"}},
              "projectTitle":{{"value":"COT"}},"projectDesc":{{"value":"Cotton."}}}},
            {{"pubTitle":{{"value":"Cotton notes"}},"pubUrl":{{"value":"{base}/docs/short.html"}}}},
            {{"pubTitle":{{"value":"Cotton genome"}}}}
        ]}}}}"#,
        base = server.uri()
    );
    Mock::given(method("POST"))
        .and(path("/sparql"))
        .respond_with(ResponseTemplate::new(200).set_body_string(bindings))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sparql"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"results":{"bindings":[]}}"#))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/docs/long.html"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            format!("<html><body><main><p>{}</p></main></body></html>", words(60, "cotton")),
            "text/html",
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/docs/short.html"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "<html><body><p>cotton is short</p></body></html>",
            "text/html",
        ))
        .mount(&server)
        .await;

    let delay = Arc::new(AdaptiveDelay::new(&DelaySettings {
        initial_ms: 0,
        floor_ms: 0,
        ceiling_ms: 0,
        jitter: 0.0,
    }));
    let downloader = Arc::new(
        HttpDownloader::new(delay, Arc::new(ProxyPool::new())).with_retry(1, Duration::ZERO),
    );
    let backend = CordisApi::new(Arc::clone(&downloader))
        .with_endpoint(format!("{}/sparql", server.uri()))
        .with_page_size(3);
    let fetcher = ContentAcquirer::new(downloader);

    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::load_csv(write_registry(dir.path())).unwrap();
    let sink = Arc::new(sink(dir.path(), BackendKind::CordisApi));
    let kept_path = sink.kept_path().to_path_buf();
    let omitted_path = sink.omitted_path().to_path_buf();

    let orchestrator = Orchestrator::new(Arc::new(backend), Arc::new(fetcher), sink);
    let (tx, mut rx) = unbounded_channel();
    let outcome = orchestrator
        .run_sweep(&registry, &SweepRequest::new("01.0", "01.0"), &tx)
        .await
        .unwrap();

    assert_eq!(outcome.stats.total_urls_found, 3);
    assert_eq!(outcome.stats.kept, 1);
    assert_eq!(outcome.stats.omitted, 2);
    assert_eq!(outcome.stats.skipped_low_words, 2);

    let kept = read_rows(&kept_path);
    assert!(kept[0][4].ends_with("/docs/long.html"));
    let omitted = read_rows(&omitted_path);
    assert!(omitted[0][3].ends_with("/docs/short.html"));
    assert_eq!(&omitted[1][3], "cordis://Cotton genome");

    let mut last = None;
    while let Ok(event) = rx.try_recv() {
        last = Some(event);
    }
    assert_eq!(last.unwrap().phase, Phase::Done);
}

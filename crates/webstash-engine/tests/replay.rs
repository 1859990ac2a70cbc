//! End-to-end replay: a prepared archive is served offline through the real
//! proxy server, with the bootstrap injected and link rewriting applied.

use std::path::PathBuf;
use std::sync::Arc;
use webstash_core::header::Header;
use webstash_core::{DownloadPolicy, Settings};
use webstash_engine::archive::ArchiveWriter;
use webstash_engine::client::HttpClient;
use webstash_engine::header_store::HeaderStore;
use webstash_engine::{server, Engine};

const PAGE: &str = "<html><head>\
                    <script src=\"https://cdn.b.com/lib.js\" integrity=\"sha384-abc\"></script>\
                    </head><body><img src=\"pic.png\">hi</body></html>";

fn build_archive(dir: &tempfile::TempDir, inject_js: bool) -> (PathBuf, Option<PathBuf>) {
    let archive = dir.path().join("session.zip");
    let writer = ArchiveWriter::open(archive.clone()).unwrap();
    writer.write("url", b"http://a.com/", 0, false);

    let mut header = Header::new();
    header.append("Content-Type", "text/html; charset=utf-8");
    header.append("Content-Length", PAGE.len().to_string());
    let mut headers = HeaderStore::new();
    headers.write("http://a.com/", 200, header);
    writer.write("headers", headers.serialize().as_bytes(), 0, false);
    writer.write("http/a.com/index", PAGE.as_bytes(), 0, false);
    assert!(writer.close());

    let inject = inject_js.then(|| {
        let path = dir.path().join("inject.js");
        std::fs::write(&path, "console.log('replay');").unwrap();
        path
    });
    (archive, inject)
}

async fn start_proxy(settings: Settings) -> (Arc<Engine>, u16) {
    let client = Arc::new(HttpClient::new(None).unwrap());
    let engine = Arc::new(Engine::new(settings, client).unwrap());
    let listener = server::bind().await.unwrap();
    let port = listener.local_addr().unwrap().port();
    engine.set_local_server_url(&format!("http://127.0.0.1:{port}/"));
    let run_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        server::run(run_engine, listener).await.unwrap();
    });
    (engine, port)
}

#[tokio::test]
async fn replays_a_recorded_page_offline() {
    let dir = tempfile::tempdir().unwrap();
    let (archive, inject_js) = build_archive(&dir, true);
    let settings = Settings {
        input_file: Some(archive),
        inject_js_file: inject_js,
        download_policy: DownloadPolicy::Never,
        ..Settings::default()
    };
    let (engine, port) = start_proxy(settings).await;

    let http = reqwest::Client::new();
    let response = http
        .get(format!("http://127.0.0.1:{port}/"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "no-store"
    );
    let body = response.text().await.unwrap();
    assert!(body.contains("hi"), "{body}");
    assert!(!body.contains("integrity"), "{body}");
    assert!(body.contains("__webrecorder = {"), "{body}");
    assert!(body.contains("src=\"/https://cdn.b.com/lib.js\""), "{body}");
    assert!(body.contains("src=\"/pic.png\""), "{body}");

    // the bootstrap payload itself
    let response = http
        .get(format!("http://127.0.0.1:{port}/__webrecorder.js"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "console.log('replay');");

    // unknown entries stay 404 offline
    let response = http
        .get(format!("http://127.0.0.1:{port}/unknown.css"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);

    engine.initiate_shutdown();
}

#[tokio::test]
async fn bootstrap_is_omitted_without_an_inject_file() {
    let dir = tempfile::tempdir().unwrap();
    let (archive, _) = build_archive(&dir, false);
    let settings = Settings {
        input_file: Some(archive),
        download_policy: DownloadPolicy::Never,
        ..Settings::default()
    };
    let (engine, port) = start_proxy(settings).await;

    let body = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{port}/"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(!body.contains("__webrecorder"), "{body}");
    // link rewriting still happens
    assert!(body.contains("src=\"/pic.png\""), "{body}");

    engine.initiate_shutdown();
}

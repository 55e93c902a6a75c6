//! Engine-level behavior across process boundaries: session snapshots,
//! restore-and-resume, and admission-control adjustments.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use grapnel::engine::{DownloadEngine, DownloadState, EngineConfig};
use grapnel::options::DownloadOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    let id = NEXT.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("{prefix}_{}_{id}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 13 + 5) as u8).collect()
}

#[derive(Clone)]
struct SlowOrigin {
    data: Arc<Vec<u8>>,
    delay: Duration,
}

async fn slow_handler(
    State(origin): State<SlowOrigin>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let len = origin.data.len() as u64;
    if method == Method::HEAD {
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, len)
            .header(header::ACCEPT_RANGES, "bytes")
            .body(Body::empty())
            .expect("head response");
    }

    let (start, end) = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("bytes="))
        .and_then(|spec| spec.split_once('-'))
        .and_then(|(a, b)| {
            let start: u64 = a.parse().ok()?;
            let end: u64 = if b.is_empty() {
                len.saturating_sub(1)
            } else {
                b.parse().ok()?
            };
            Some((start, end.min(len - 1)))
        })
        .unwrap_or((0, len.saturating_sub(1)));

    let slice = origin.data[start as usize..=end as usize].to_vec();
    let delay = origin.delay;
    let stream = futures_util::stream::unfold((slice, 0usize), move |(data, pos)| async move {
        if pos >= data.len() {
            return None;
        }
        tokio::time::sleep(delay).await;
        let end = (pos + 16 * 1024).min(data.len());
        let piece = data[pos..end].to_vec();
        Some((Ok::<Vec<u8>, std::io::Error>(piece), (data, end)))
    });
    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{len}"))
        .body(Body::from_stream(stream))
        .expect("206 response")
}

async fn serve_slow(data: Vec<u8>, delay: Duration) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let router = Router::new()
        .route("/file.bin", get(slow_handler))
        .with_state(SlowOrigin {
            data: Arc::new(data),
            delay,
        });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (addr, handle)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn paused_downloads_survive_an_engine_restart() {
    let data = payload(1024 * 1024);
    let (addr, server) = serve_slow(data.clone(), Duration::from_millis(10)).await;
    let dir = unique_temp_dir("grapnel_session_restart");
    let session_file = dir.join("session.json");

    let options = DownloadOptions {
        dir: Some(dir.clone()),
        out: Some("carried.dat".to_string()),
        split: 1,
        ..DownloadOptions::default()
    };

    // First engine: start, pause mid-flight, shut down.
    let engine = Arc::new(
        DownloadEngine::new(EngineConfig {
            session_file: Some(session_file.clone()),
            ..EngineConfig::default()
        })
        .expect("engine"),
    );
    let gid = engine
        .add_uri(
            vec![format!("http://{addr}/file.bin")],
            options.clone(),
            3,
        )
        .expect("add");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(engine.pause(&gid));
    engine.shutdown().await;
    assert!(session_file.exists());

    // Second engine: restore, confirm the paused entry, resume to the end.
    let engine = Arc::new(
        DownloadEngine::new(EngineConfig {
            session_file: Some(session_file.clone()),
            ..EngineConfig::default()
        })
        .expect("engine"),
    );
    let restored = engine.load_session().await.expect("load session");
    assert_eq!(restored, 1);

    let statuses = engine.statuses();
    assert_eq!(statuses.len(), 1);
    let restored_gid = statuses[0].gid.clone();
    assert_eq!(restored_gid, gid, "the GID is immutable across restarts");
    assert_eq!(statuses[0].state, DownloadState::Paused);

    assert!(engine.resume(&restored_gid));
    engine.run().await.expect("restored download completes");
    assert_eq!(
        std::fs::read(dir.join("carried.dat")).expect("read output"),
        data
    );

    server.abort();
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn completed_downloads_are_not_persisted_in_the_session() {
    let data = payload(64 * 1024);
    let (addr, server) = serve_slow(data, Duration::from_millis(1)).await;
    let dir = unique_temp_dir("grapnel_session_done");
    let session_file = dir.join("session.json");

    let engine = Arc::new(
        DownloadEngine::new(EngineConfig {
            session_file: Some(session_file.clone()),
            ..EngineConfig::default()
        })
        .expect("engine"),
    );
    engine
        .add_uri(
            vec![format!("http://{addr}/file.bin")],
            DownloadOptions {
                dir: Some(dir.clone()),
                out: Some("done.dat".to_string()),
                split: 1,
                ..DownloadOptions::default()
            },
            0,
        )
        .expect("add");
    engine.run().await.expect("download completes");
    engine.shutdown().await;

    let raw = std::fs::read_to_string(&session_file).expect("session exists");
    let session: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
    assert_eq!(
        session["downloads"].as_array().map(|a| a.len()),
        Some(0),
        "terminal downloads do not re-enter the next session"
    );

    server.abort();
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn raising_max_concurrent_dispatches_queued_downloads() {
    let data = payload(256 * 1024);
    let (addr, server) = serve_slow(data, Duration::from_millis(20)).await;
    let dir = unique_temp_dir("grapnel_session_slots");

    let engine = Arc::new(
        DownloadEngine::new(EngineConfig {
            max_concurrent: 1,
            ..EngineConfig::default()
        })
        .expect("engine"),
    );
    let opts = |name: &str| DownloadOptions {
        dir: Some(dir.clone()),
        out: Some(name.to_string()),
        split: 1,
        ..DownloadOptions::default()
    };
    for i in 0..3 {
        engine
            .add_uri(
                vec![format!("http://{addr}/file.bin")],
                opts(&format!("slot{i}.dat")),
                0,
            )
            .expect("add");
    }
    assert_eq!(engine.active_count(), 1);
    assert_eq!(engine.pending_count(), 2);

    engine.set_max_concurrent(3);
    assert_eq!(engine.pending_count(), 0);
    assert_eq!(engine.active_count(), 3);

    engine.run().await.expect("all downloads complete");
    for i in 0..3 {
        assert!(dir.join(format!("slot{i}.dat")).exists());
    }

    server.abort();
    let _ = std::fs::remove_dir_all(dir);
}

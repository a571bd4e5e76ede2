//! Integration tests for the worker server

use bytes::Bytes;
use common::wire::{WORKER_BUSY_HEADER, WORKER_ID_HEADER, WORKER_TIME_HEADER};
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::Notify;
use worker::{FixedProvider, Handler, Worker, WorkerConfig};

fn config(socket_path: PathBuf, max_requests: u64) -> WorkerConfig {
    WorkerConfig {
        id: 3,
        app_name: "test".to_string(),
        socket_path,
        max_requests,
        control_socket: None,
    }
}

fn echo_path() -> Handler {
    Handler::from_fn(|request: Request<Bytes>| async move {
        Ok(Response::new(Bytes::from(request.uri().path().to_string())))
    })
}

async fn wait_for_socket(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("socket {} never appeared", path.display());
}

/// Send one GET over a fresh connection
async fn get(socket: &Path, path: &str) -> (StatusCode, HeaderMap, Bytes) {
    let stream = UnixStream::connect(socket).await.unwrap();
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(connection);

    let request = Request::get(path)
        .header(http::header::HOST, "localhost")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    (parts.status, parts.headers, body)
}

#[tokio::test]
async fn test_ready_probe_and_request_headers() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("w.sock");
    let worker = Worker::new(
        config(socket.clone(), 0),
        Arc::new(FixedProvider::new(echo_path())),
    );
    let shutdown = worker.shutdown_token();
    let handle = tokio::spawn(worker.run());
    wait_for_socket(&socket).await;

    let (status, _, body) = get(&socket, "/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from("ok"));

    let (status, headers, body) = get(&socket, "/hello").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from("/hello"));
    assert_eq!(headers[WORKER_ID_HEADER], "3");
    assert!(headers.contains_key(WORKER_TIME_HEADER));
    assert!(!headers.contains_key(WORKER_BUSY_HEADER));

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker did not stop")
        .unwrap()
        .unwrap();
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_second_request_gets_busy_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("w.sock");
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let handler = {
        let entered = entered.clone();
        let release = release.clone();
        Handler::from_fn(move |_request| {
            let entered = entered.clone();
            let release = release.clone();
            async move {
                entered.notify_one();
                release.notified().await;
                Ok(Response::new(Bytes::from("slow")))
            }
        })
    };

    let worker = Worker::new(config(socket.clone(), 0), Arc::new(FixedProvider::new(handler)));
    let shutdown = worker.shutdown_token();
    let handle = tokio::spawn(worker.run());
    wait_for_socket(&socket).await;

    let slow = {
        let socket = socket.clone();
        tokio::spawn(async move { get(&socket, "/slow").await })
    };
    entered.notified().await;

    let (status, headers, _) = get(&socket, "/other").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(headers[WORKER_BUSY_HEADER], "1");
    assert_eq!(headers[http::header::RETRY_AFTER], "0");

    // Readiness is still answered while busy
    let (status, _, _) = get(&socket, "/ready").await;
    assert_eq!(status, StatusCode::OK);

    release.notify_one();
    let (status, _, body) = slow.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from("slow"));

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_worker_retires_after_max_requests() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("w.sock");
    let worker = Worker::new(
        config(socket.clone(), 2),
        Arc::new(FixedProvider::new(echo_path())),
    );
    let handle = tokio::spawn(worker.run());
    wait_for_socket(&socket).await;

    assert_eq!(get(&socket, "/1").await.0, StatusCode::OK);
    let (status, _, body) = get(&socket, "/2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from("/2"));

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker did not retire")
        .unwrap()
        .unwrap();
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_graceful_shutdown_finishes_inflight_request() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("w.sock");
    let entered = Arc::new(Notify::new());

    let handler = {
        let entered = entered.clone();
        Handler::from_fn(move |_request| {
            let entered = entered.clone();
            async move {
                entered.notify_one();
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(Response::new(Bytes::from("done")))
            }
        })
    };

    let worker = Worker::new(config(socket.clone(), 0), Arc::new(FixedProvider::new(handler)));
    let shutdown = worker.shutdown_token();
    let handle = tokio::spawn(worker.run());
    wait_for_socket(&socket).await;

    let request = {
        let socket = socket.clone();
        tokio::spawn(async move { get(&socket, "/work").await })
    };
    entered.notified().await;
    shutdown.cancel();

    let (status, _, body) = request.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from("done"));

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_handler_error_becomes_500() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("w.sock");
    let handler = Handler::from_fn(|_request| async move {
        Err(worker::WorkerError::handler("boom"))
    });
    let worker = Worker::new(config(socket.clone(), 0), Arc::new(FixedProvider::new(handler)));
    let shutdown = worker.shutdown_token();
    let handle = tokio::spawn(worker.run());
    wait_for_socket(&socket).await;

    let (status, _, _) = get(&socket, "/").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    // The worker keeps serving after a failed request
    let (status, _, _) = get(&socket, "/ready").await;
    assert_eq!(status, StatusCode::OK);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

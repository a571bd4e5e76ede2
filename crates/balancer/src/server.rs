//! Request admission, queueing and forwarding.

use crate::client::{UnixClient, UpstreamReply};
use crate::config::{AccessLogFormat, BalancerConfig, DiscoveryMode};
use crate::discovery;
use crate::error::Result;
use crate::metrics::MetricsRegistry;
use crate::probe;
use crate::upstream::UpstreamSet;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use bytes::Bytes;
use common::format::{AccessRecord, timestamp};
use common::wire::{
    Health, INTERNAL_HEADERS, Ports, STATUS_PATH, StatusSnapshot, WORKER_ID_HEADER,
    WORKER_TIME_HEADER,
};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri, Version, header};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Counters reported to the platform controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalancerStats {
    pub requests: u64,
    pub inflight: usize,
    pub queued: usize,
    pub upstreams: usize,
    pub ready: usize,
    pub failures: u64,
}

/// A request waiting for capacity.
struct Job {
    request: Request<Bytes>,
    reply: oneshot::Sender<Response<Bytes>>,
    enqueued_at: Instant,
}

struct Inner {
    config: BalancerConfig,
    client: UnixClient,
    upstreams: Mutex<UpstreamSet>,
    queue: Mutex<VecDeque<Job>>,
    /// Admitted requests not yet answered
    inflight: AtomicUsize,
    requests: AtomicU64,
    failures: AtomicU64,
    started: Instant,
    metrics: Option<Arc<MetricsRegistry>>,
    tasks: TaskTracker,
}

/// Load balancer for one application pool
#[derive(Clone)]
pub struct LoadBalancer {
    inner: Arc<Inner>,
}

/// The parts of a request needed to send it again.
struct Replayable {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
}

impl Replayable {
    fn new(request: Request<Bytes>) -> Self {
        let (parts, body) = request.into_parts();
        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body,
        }
    }

    fn build(&self) -> Request<Bytes> {
        let mut request = Request::new(self.body.clone());
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.version_mut() = self.version;
        *request.headers_mut() = self.headers.clone();
        request
    }
}

impl LoadBalancer {
    /// Create a load balancer
    pub fn new(config: BalancerConfig, metrics: Option<Arc<MetricsRegistry>>) -> Self {
        let client = UnixClient::new(config.connect_timeout, config.read_timeout);
        Self {
            inner: Arc::new(Inner {
                config,
                client,
                upstreams: Mutex::new(UpstreamSet::new()),
                queue: Mutex::new(VecDeque::new()),
                inflight: AtomicUsize::new(0),
                requests: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                started: Instant::now(),
                metrics,
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.inner.config
    }

    pub(crate) fn client(&self) -> &UnixClient {
        &self.inner.client
    }

    /// Run `f` with exclusive access to the upstream table.
    pub fn with_upstreams<T>(&self, f: impl FnOnce(&mut UpstreamSet) -> T) -> T {
        f(&mut self.inner.upstreams.lock())
    }

    /// Answer one client request.
    pub async fn fetch(&self, request: Request<Bytes>) -> Response<Bytes> {
        let started = Instant::now();
        self.inner.requests.fetch_add(1, Ordering::Relaxed);

        let response = self.route(request).await;

        if let Some(metrics) = &self.inner.metrics {
            metrics.record_request(response.status().as_u16(), started.elapsed());
        }
        response
    }

    async fn route(&self, request: Request<Bytes>) -> Response<Bytes> {
        if request.uri().path() == STATUS_PATH {
            return json_response(StatusCode::OK, &self.status());
        }

        if !self.inner.upstreams.lock().has_available(Instant::now()) {
            self.reject("degraded");
            let body = serde_json::json!({
                "status": Health::Degraded,
                "app": self.inner.config.app_name,
            });
            return json_response(StatusCode::SERVICE_UNAVAILABLE, &body);
        }

        if let Some(socket) = self.try_admit() {
            return self.dispatch(request, socket).await;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut queue = self.inner.queue.lock();
            if queue.len() >= self.inner.config.max_queue {
                drop(queue);
                self.reject("busy");
                return unavailable("Server busy");
            }
            queue.push_back(Job {
                request,
                reply: reply_tx,
                enqueued_at: Instant::now(),
            });
        }
        debug!("Request queued");
        // Capacity may have been freed between the admission check and the push
        self.drain();

        reply_rx
            .await
            .unwrap_or_else(|_| unavailable("Service Unavailable"))
    }

    /// Take a slot and reserve an idle socket for it in one step.
    fn try_admit(&self) -> Option<PathBuf> {
        let mut upstreams = self.inner.upstreams.lock();
        let capacity = upstreams.len();
        let inflight = self.inner.inflight.load(Ordering::Acquire);
        if inflight >= capacity {
            return None;
        }
        let socket = upstreams.acquire_next(Instant::now())?;
        self.inner.inflight.store(inflight + 1, Ordering::Release);
        Some(socket)
    }

    /// Forward an admitted request, then release its slot and drain.
    async fn dispatch(&self, request: Request<Bytes>, socket: PathBuf) -> Response<Bytes> {
        let response = self.forward(request, socket).await;
        {
            let _upstreams = self.inner.upstreams.lock();
            self.inner.inflight.fetch_sub(1, Ordering::AcqRel);
        }
        self.drain();
        response
    }

    /// Send to the reserved `first` socket, moving on through the pool on
    /// busy replies and connection failures.
    async fn forward(&self, request: Request<Bytes>, first: PathBuf) -> Response<Bytes> {
        let started = Instant::now();
        let request = Replayable::new(request);
        let attempts = self.inner.upstreams.lock().len().max(1);
        let mut reserved = Some(first);

        for _ in 0..attempts {
            let socket = match reserved.take() {
                Some(socket) => socket,
                None => match self.inner.upstreams.lock().acquire_next(Instant::now()) {
                    Some(socket) => socket,
                    None => break,
                },
            };

            let outcome = self.inner.client.send(&socket, request.build()).await;
            self.inner.upstreams.lock().release(&socket);

            match outcome {
                Ok(UpstreamReply::Busy) => {
                    debug!(socket = %socket.display(), "Worker busy, trying next");
                }
                Ok(UpstreamReply::Response(response)) => {
                    return self.finish(&request, response, started);
                }
                Err(e) if !e.quarantines() => {
                    warn!(socket = %socket.display(), error = %e, "Upstream timed out");
                    self.record_failure();
                    return timeout_response("Gateway Timeout");
                }
                Err(e) => {
                    warn!(socket = %socket.display(), error = %e, "Upstream failed, quarantining");
                    self.record_failure();
                    let until = Instant::now() + self.inner.config.quarantine;
                    self.inner.upstreams.lock().quarantine(&socket, until);
                }
            }
        }

        self.reject("exhausted");
        unavailable("Service Unavailable")
    }

    /// Strip internal headers and write the access log record.
    fn finish(
        &self,
        request: &Replayable,
        response: Response<Bytes>,
        started: Instant,
    ) -> Response<Bytes> {
        let (mut parts, body) = response.into_parts();

        let worker = parts
            .headers
            .get(WORKER_TIME_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
            .map(|ms| Duration::from_secs_f64(ms / 1e3));
        let worker_id = parts
            .headers
            .get(WORKER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        for name in INTERNAL_HEADERS {
            parts.headers.remove(name);
        }

        let format = self.inner.config.access_log;
        if format != AccessLogFormat::Off {
            let record = AccessRecord {
                timestamp: timestamp(),
                method: request.method.to_string(),
                path: request
                    .uri
                    .path_and_query()
                    .map(|pq| pq.to_string())
                    .unwrap_or_else(|| "/".to_string()),
                status: parts.status.as_u16(),
                bytes: body.len(),
                total: started.elapsed(),
                worker,
                worker_id,
            };
            info!(target: "rip::access", "{}", record.render(format == AccessLogFormat::Json));
        }

        Response::from_parts(parts, body)
    }

    /// Move queued jobs onto free capacity, expiring stale ones.
    pub fn drain(&self) {
        loop {
            let (job, socket) = {
                let mut queue = self.inner.queue.lock();
                let Some(front) = queue.front() else {
                    break;
                };

                if front.reply.is_closed() {
                    queue.pop_front();
                    continue;
                }
                if front.enqueued_at.elapsed() > self.inner.config.queue_timeout {
                    if let Some(job) = queue.pop_front() {
                        self.reject("queue_timeout");
                        let _ = job.reply.send(timeout_response("Queue timeout"));
                    }
                    continue;
                }
                let Some(socket) = self.try_admit() else {
                    break;
                };
                match queue.pop_front() {
                    Some(job) => (job, socket),
                    None => {
                        self.cancel_admission(&socket);
                        break;
                    }
                }
            };

            let lb = self.clone();
            self.inner.tasks.spawn(async move {
                let response = lb.dispatch(job.request, socket).await;
                let _ = job.reply.send(response);
            });
        }
    }

    /// Undo a [`LoadBalancer::try_admit`] whose request went away.
    fn cancel_admission(&self, socket: &Path) {
        let mut upstreams = self.inner.upstreams.lock();
        upstreams.release(socket);
        self.inner.inflight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Periodic queue maintenance and gauge refresh.
    pub fn tick(&self) {
        self.drain();
        if let Some(metrics) = &self.inner.metrics {
            let stats = self.stats();
            metrics.set_inflight(stats.inflight);
            metrics.set_queue_depth(stats.queued);
            metrics.set_ready_workers(stats.ready);
        }
    }

    /// Body of `GET /status`.
    pub fn status(&self) -> StatusSnapshot {
        let (workers, ready, available) = {
            let upstreams = self.inner.upstreams.lock();
            let now = Instant::now();
            (upstreams.len(), upstreams.ready_count(now), upstreams.has_available(now))
        };
        StatusSnapshot {
            status: if available {
                Health::Healthy
            } else {
                Health::Degraded
            },
            app: self.inner.config.app_name.clone(),
            workers,
            ready,
            ports: Ports {
                http: self.inner.config.http_port,
            },
            uptime: self.inner.started.elapsed().as_secs_f64(),
        }
    }

    pub fn stats(&self) -> BalancerStats {
        let (upstreams, ready) = {
            let set = self.inner.upstreams.lock();
            (set.len(), set.ready_count(Instant::now()))
        };
        BalancerStats {
            requests: self.inner.requests.load(Ordering::Relaxed),
            inflight: self.inner.inflight.load(Ordering::Acquire),
            queued: self.inner.queue.lock().len(),
            upstreams,
            ready,
            failures: self.inner.failures.load(Ordering::Relaxed),
        }
    }

    /// Tracked sockets in selection order.
    pub fn upstream_sockets(&self) -> Vec<PathBuf> {
        self.inner
            .upstreams
            .lock()
            .iter()
            .map(|u| u.socket.clone())
            .collect()
    }

    /// Start probing, discovery and the queue ticker.
    pub fn spawn_background(&self, shutdown: &CancellationToken) -> Result<()> {
        let tasks = &self.inner.tasks;

        if self.inner.config.discovery == DiscoveryMode::Control {
            let listener = discovery::bind_control(&self.inner.config.control_socket)?;
            tasks.spawn(discovery::control_loop(self.clone(), listener, shutdown.clone()));
        } else {
            tasks.spawn(discovery::scan_loop(self.clone(), shutdown.clone()));
        }
        tasks.spawn(probe::probe_loop(self.clone(), shutdown.clone()));

        let lb = self.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let mut interval = tokio::time::interval(lb.inner.config.drain_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => lb.tick(),
                }
            }
        });
        Ok(())
    }

    /// Router feeding every request into [`LoadBalancer::fetch`].
    pub fn router(&self) -> Router {
        Router::new().fallback(proxy_handler).with_state(self.clone())
    }

    /// Serve the public HTTP surface until `shutdown` is cancelled.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        self.spawn_background(&shutdown)?;
        self.serve_started(listener, shutdown).await
    }

    /// Serve after [`LoadBalancer::spawn_background`] has already run.
    pub async fn serve_started(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!(
            app = %self.inner.config.app_name,
            addr = ?listener.local_addr().ok(),
            discovery = ?self.inner.config.discovery,
            "Load balancer listening"
        );

        let token = shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await?;

        shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        if self.inner.config.discovery == DiscoveryMode::Control {
            discovery::remove_control(&self.inner.config.control_socket);
        }
        info!(app = %self.inner.config.app_name, "Load balancer stopped");
        Ok(())
    }

    fn reject(&self, reason: &str) {
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_rejection(reason);
        }
    }

    fn record_failure(&self) {
        self.inner.failures.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_upstream_failure();
        }
    }
}

async fn proxy_handler(
    State(lb): State<LoadBalancer>,
    request: Request<Body>,
) -> Response<Body> {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, lb.inner.config.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            debug!(error = %e, "Rejected request body");
            return text_response(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large").map(Body::from);
        }
    };
    lb.fetch(Request::from_parts(parts, body)).await.map(Body::from)
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from_static(body.as_bytes()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn unavailable(body: &'static str) -> Response<Bytes> {
    let mut response = text_response(StatusCode::SERVICE_UNAVAILABLE, body);
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
    response
}

fn timeout_response(body: &'static str) -> Response<Bytes> {
    let mut response = text_response(StatusCode::GATEWAY_TIMEOUT, body);
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
    response
}

fn json_response(status: StatusCode, value: &impl Serialize) -> Response<Bytes> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(Bytes::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balancer() -> LoadBalancer {
        let mut config = BalancerConfig::new("unit", 8080);
        config.access_log = AccessLogFormat::Off;
        LoadBalancer::new(config, Some(Arc::new(MetricsRegistry::new())))
    }

    #[tokio::test]
    async fn test_status_is_answered_directly() {
        let lb = balancer();
        let response = lb
            .fetch(Request::get("/status").body(Bytes::new()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let snapshot: StatusSnapshot = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(snapshot.status, Health::Degraded);
        assert_eq!(snapshot.app, "unit");
        assert_eq!(snapshot.workers, 0);
        assert_eq!(snapshot.ports.http, 8080);
    }

    #[tokio::test]
    async fn test_empty_pool_is_degraded() {
        let lb = balancer();
        let response = lb
            .fetch(Request::get("/anything").body(Bytes::new()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["app"], "unit");
        assert_eq!(lb.stats().requests, 1);
    }

    #[tokio::test]
    async fn test_all_sockets_failing_is_503_and_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let lb = balancer();
        let sockets: Vec<PathBuf> = (0..2).map(|i| dir.path().join(format!("{}.sock", i))).collect();
        lb.with_upstreams(|set| {
            for socket in &sockets {
                set.insert(socket.clone());
                set.set_ready(socket, true);
            }
        });

        let response = lb
            .fetch(Request::get("/").body(Bytes::new()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");

        let stats = lb.stats();
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.ready, 0);
        assert_eq!(stats.inflight, 0);
    }

    #[test]
    fn test_replayable_request_keeps_everything() {
        let request = Request::post("/submit?x=1")
            .header("x-test", "yes")
            .body(Bytes::from("payload"))
            .unwrap();
        let replay = Replayable::new(request);

        let first = replay.build();
        let second = replay.build();
        assert_eq!(first.method(), Method::POST);
        assert_eq!(second.uri(), "/submit?x=1");
        assert_eq!(second.headers()["x-test"], "yes");
        assert_eq!(second.body(), &Bytes::from("payload"));
    }
}

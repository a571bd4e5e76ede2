//! HTTP/1.1 client for worker sockets.

use bytes::Bytes;
use common::wire::{READY_PATH, WORKER_BUSY_HEADER};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::debug;

/// Failure talking to a worker socket.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error("no response within {0:?}")]
    ReadTimeout(Duration),

    #[error("transport error: {0}")]
    Transport(#[from] hyper::Error),
}

impl ClientError {
    /// Whether the socket should be quarantined for this failure.
    ///
    /// A read timeout only means the worker is slow.
    pub fn quarantines(&self) -> bool {
        !matches!(self, ClientError::ReadTimeout(_))
    }
}

/// What a worker answered.
///
/// The busy sentinel is its own variant so it cannot be mistaken for a
/// response meant for the client.
#[derive(Debug)]
pub enum UpstreamReply {
    /// The worker was already occupied; try another socket
    Busy,
    /// A real response
    Response(Response<Bytes>),
}

/// Client issuing one connection per request.
#[derive(Debug, Clone)]
pub struct UnixClient {
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl UnixClient {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
        }
    }

    /// Send `request` to the worker at `socket`.
    pub async fn send(
        &self,
        socket: &Path,
        request: Request<Bytes>,
    ) -> Result<UpstreamReply, ClientError> {
        let mut sender = tokio::time::timeout(self.connect_timeout, connect(socket))
            .await
            .map_err(|_| ClientError::ConnectTimeout(self.connect_timeout))??;

        let request = request.map(Full::new);
        let exchange = async {
            let response = sender.send_request(request).await?;
            let (parts, body) = response.into_parts();
            let body = body.collect().await?.to_bytes();
            Ok::<_, hyper::Error>(Response::from_parts(parts, body))
        };
        let response = tokio::time::timeout(self.read_timeout, exchange)
            .await
            .map_err(|_| ClientError::ReadTimeout(self.read_timeout))??;

        if is_busy(&response) {
            return Ok(UpstreamReply::Busy);
        }
        Ok(UpstreamReply::Response(response))
    }

    /// `GET /ready` with a deadline; true only for `200 ok`.
    pub async fn probe(&self, socket: &Path, deadline: Duration) -> bool {
        let request = match Request::get(READY_PATH)
            .header(http::header::HOST, "localhost")
            .body(Bytes::new())
        {
            Ok(request) => request,
            Err(_) => return false,
        };

        let probe = UnixClient::new(deadline.min(self.connect_timeout), deadline);
        match probe.send(socket, request).await {
            Ok(UpstreamReply::Response(response)) => {
                response.status() == StatusCode::OK && response.body().as_ref() == b"ok"
            }
            Ok(UpstreamReply::Busy) => false,
            Err(e) => {
                debug!(socket = %socket.display(), error = %e, "Probe failed");
                false
            }
        }
    }
}

async fn connect(socket: &Path) -> Result<http1::SendRequest<Full<Bytes>>, ClientError> {
    let stream = UnixStream::connect(socket).await?;
    let (sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "Upstream connection closed with error");
        }
    });
    Ok(sender)
}

fn is_busy(response: &Response<Bytes>) -> bool {
    response.status() == StatusCode::SERVICE_UNAVAILABLE
        && response
            .headers()
            .get(WORKER_BUSY_HEADER)
            .is_some_and(|v| v.as_bytes() == b"1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_detection() {
        let mut response = Response::new(Bytes::new());
        *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
        assert!(!is_busy(&response));

        response
            .headers_mut()
            .insert(WORKER_BUSY_HEADER, http::HeaderValue::from_static("1"));
        assert!(is_busy(&response));

        // The header alone is not enough
        *response.status_mut() = StatusCode::OK;
        assert!(!is_busy(&response));
    }

    #[test]
    fn test_read_timeout_does_not_quarantine() {
        assert!(!ClientError::ReadTimeout(Duration::from_secs(1)).quarantines());
        assert!(ClientError::ConnectTimeout(Duration::from_millis(1)).quarantines());
    }

    #[tokio::test]
    async fn test_missing_socket_is_a_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = UnixClient::new(Duration::from_millis(100), Duration::from_secs(1));
        let request = Request::get("/").body(Bytes::new()).unwrap();

        let result = client.send(&dir.path().join("gone.sock"), request).await;
        assert!(matches!(result, Err(ClientError::Connect(_))));
        assert!(!client.probe(&dir.path().join("gone.sock"), Duration::from_millis(100)).await);
    }
}

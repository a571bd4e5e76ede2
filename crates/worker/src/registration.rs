//! Best-effort announcements to the load balancer's control socket.

use crate::error::{Result, WorkerError};
use bytes::Bytes;
use common::wire::{CONTROL_PATH, ControlMessage};
use http::Request;
use http_body_util::Full;
use hyper_util::rt::TokioIo;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::debug;

/// Upper bound on one announcement round trip.
const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);

/// Client for the control socket.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket: PathBuf,
}

impl ControlClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    /// Deliver one message and wait for the acknowledgement.
    pub async fn send(&self, message: &ControlMessage) -> Result<()> {
        let body = serde_json::to_vec(message)
            .map_err(|e| WorkerError::Control(e.to_string()))?;

        tokio::time::timeout(CONTROL_TIMEOUT, self.exchange(body))
            .await
            .map_err(|_| WorkerError::Control("timed out".to_string()))?
    }

    async fn exchange(&self, body: Vec<u8>) -> Result<()> {
        let stream = UnixStream::connect(&self.socket).await?;
        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "Control connection closed with error");
            }
        });

        let request = Request::post(CONTROL_PATH)
            .header(http::header::HOST, "localhost")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))?;
        let response = sender.send_request(request).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(WorkerError::Control(format!(
                "control socket answered {}",
                response.status()
            )))
        }
    }

    /// Send without waiting; failures are only logged.
    pub fn notify(&self, message: ControlMessage) {
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.send(&message).await {
                debug!(socket = %client.socket.display(), error = %e, "Control message not delivered");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_unanswered_announcement_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        // Accepts into the backlog but never answers
        let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

        let client = ControlClient::new(&path);
        let started = Instant::now();
        let result = client
            .send(&ControlMessage::Deregister {
                app: "blog".to_string(),
                worker_id: 0,
                socket: "/tmp/rip-blog-0.sock".to_string(),
            })
            .await;

        assert!(matches!(result, Err(WorkerError::Control(_))));
        assert!(started.elapsed() >= CONTROL_TIMEOUT);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}

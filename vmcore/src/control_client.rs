//! Monitor Control-API Client (SPEC_FULL.md §4.D).
//!
//! A minimal HTTP/1.1 client speaking to the hypervisor monitor over a Unix
//! domain socket, grounded on `qarax-node`'s `send_api_request` but rebuilt
//! against `hyper` 1.x's `client::conn::http1` + `hyper_util`'s `TokioIo`
//! adapter instead of the vendored `firecracker_rust_sdk`'s hyper 0.14 +
//! `hyperlocal` stack.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1 as hyper_http1;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

use crate::error::{CoreError, Result};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, std::convert::Infallible>;

fn boxed_body(bytes: Bytes) -> BoxBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Poll for the monitor's API socket to appear, backing off from 100ms
    /// up to 500ms between attempts.
    pub async fn wait_for_socket(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = Duration::from_millis(100);
        loop {
            if self.socket_path.exists() && UnixStream::connect(&self.socket_path).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::SocketTimeout(self.socket_path.clone()));
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_millis(500));
        }
    }

    async fn connect(&self) -> Result<hyper_http1::SendRequest<BoxBody>> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(CoreError::SpawnFailed)?;
        let io = TokioIo::new(stream);
        let (sender, conn) = hyper_http1::handshake(io)
            .await
            .map_err(|e| CoreError::MonitorApi {
                path: self.socket_path.display().to_string(),
                message: e.to_string(),
            })?;
        tokio::spawn(async move {
            let _ = conn.await;
        });
        Ok(sender)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut sender = self.connect().await?;
        let uri: Uri = format!("http://localhost{path}")
            .parse()
            .expect("static path is always a valid URI");
        let body_bytes: Bytes = match &body {
            Some(v) => serde_json::to_vec(v)?.into(),
            None => Bytes::new(),
        };
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("host", "localhost")
            .header("content-type", "application/json")
            .body(boxed_body(body_bytes))
            .expect("request builder invariants upheld");

        let resp: Response<Incoming> =
            sender
                .send_request(req)
                .await
                .map_err(|e| CoreError::MonitorApi {
                    path: path.to_string(),
                    message: e.to_string(),
                })?;

        let status = resp.status();
        if !(status.is_success() || status == StatusCode::NO_CONTENT) {
            return Err(CoreError::MonitorApi {
                path: path.to_string(),
                message: format!("unexpected status {status}"),
            });
        }
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        self.request(Method::PUT, "/api/v1/vm.pause", None).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(Method::PUT, "/api/v1/vm.resume", None).await
    }

    pub async fn snapshot(&self, destination_dir: &Path) -> Result<()> {
        let body = serde_json::json!({
            "destination_url": format!("file://{}", destination_dir.display()),
        });
        self.request(Method::PUT, "/api/v1/vm.snapshot", Some(body))
            .await
    }

    /// `vm.shutdown` and `vmm.shutdown` both treat a request failure as
    /// success: the monitor process is expected to exit (and possibly tear
    /// down its socket) as a side effect of the call, so the supervisor's
    /// liveness check, not this response, is the authority on whether it
    /// actually did (SPEC_FULL.md §4.C).
    pub async fn shutdown_vm(&self) -> Result<()> {
        match self.request(Method::PUT, "/api/v1/vm.shutdown", None).await {
            Ok(()) => Ok(()),
            Err(CoreError::MonitorApi { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn shutdown_vmm(&self) -> Result<()> {
        match self.request(Method::PUT, "/api/v1/vmm.shutdown", None).await {
            Ok(()) => Ok(()),
            Err(CoreError::MonitorApi { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

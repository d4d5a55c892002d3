use std::collections::HashMap;
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::{Method, Request, Uri};
use hyper::body::Body;
use hyper::client::connect::{Connected, Connection};
use hyper::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{ContainerState, ContainerStatus, DriverError, ExecResult, HypervisorDriver};

/// LXD speaks its REST API over a local unix socket, so requests carry a
/// dummy authority and the connector ignores the URI entirely.
const LXD_AUTHORITY: &str = "http://lxd";

pub struct UnixConnection(UnixStream);

impl AsyncRead for UnixConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for UnixConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

impl Connection for UnixConnection {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

#[derive(Clone)]
pub struct UnixConnector {
    socket: Arc<PathBuf>,
}

impl tower::Service<Uri> for UnixConnector {
    type Response = UnixConnection;
    type Error = std::io::Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        let socket = Arc::clone(&self.socket);
        Box::pin(async move { UnixStream::connect(socket.as_path()).await.map(UnixConnection) })
    }
}

/// Envelope wrapping every LXD API response.
#[derive(Debug, Deserialize)]
struct LxdResponse {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_code: u16,
    #[serde(default)]
    operation: String,
    #[serde(default)]
    metadata: Value,
}

/// The operation object returned when waiting on an async LXD operation.
#[derive(Debug, Deserialize)]
struct LxdOperation {
    status_code: u16,
    #[serde(default)]
    err: String,
    #[serde(default)]
    metadata: Value,
}

pub struct LxdDriver {
    client: Client<UnixConnector>,
    project: String,
    operation_timeout: Duration,
}

impl LxdDriver {
    pub fn new(socket: impl Into<PathBuf>, project: impl Into<String>, operation_timeout: Duration) -> Self {
        let connector = UnixConnector {
            socket: Arc::new(socket.into()),
        };

        Self {
            client: Client::builder().build(connector),
            project: project.into(),
            operation_timeout,
        }
    }

    fn uri(&self, path: &str) -> String {
        let separator = if path.contains('?') { '&' } else { '?' };
        format!("{LXD_AUTHORITY}{path}{separator}project={}", self.project)
    }

    async fn round_trip(
        &self,
        method: Method,
        path: &str,
        body: Body,
        headers: &[(&str, String)],
        deadline: Duration,
    ) -> Result<hyper::Response<Body>, DriverError> {
        let mut request = Request::builder().method(method).uri(self.uri(path));
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        let request = request
            .body(body)
            .map_err(|err| DriverError::Protocol(err.to_string()))?;

        match timeout(deadline, self.client.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(DriverError::Unavailable(err.to_string())),
            Err(_) => Err(DriverError::Timeout(deadline)),
        }
    }

    async fn read_envelope(response: hyper::Response<Body>) -> Result<LxdResponse, DriverError> {
        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|err| DriverError::Unavailable(err.to_string()))?;

        let envelope: LxdResponse = serde_json::from_slice(&bytes)
            .map_err(|err| DriverError::Protocol(format!("malformed response: {err}")))?;

        if envelope.kind == "error" {
            if envelope.error_code == 404 {
                return Err(DriverError::NotFound);
            }
            return Err(DriverError::Protocol(envelope.error));
        }

        Ok(envelope)
    }

    /// Issue a request and, when LXD answers with a background operation,
    /// wait for it to finish. Returns the final metadata.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        deadline: Duration,
    ) -> Result<Value, DriverError> {
        let body = match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        };

        let response = self.round_trip(method, path, body, &[], deadline).await?;
        let envelope = Self::read_envelope(response).await?;

        if envelope.kind != "async" {
            return Ok(envelope.metadata);
        }

        let wait_path = format!("{}/wait?timeout={}", envelope.operation, deadline.as_secs());
        let response = self
            .round_trip(Method::GET, &wait_path, Body::empty(), &[], deadline)
            .await?;
        let envelope = Self::read_envelope(response).await?;

        let operation: LxdOperation = serde_json::from_value(envelope.metadata)
            .map_err(|err| DriverError::Protocol(format!("malformed operation: {err}")))?;

        if operation.status_code != 200 {
            if operation.err.contains("not found") {
                return Err(DriverError::NotFound);
            }
            return Err(DriverError::Protocol(operation.err));
        }

        Ok(operation.metadata)
    }

    async fn change_state(&self, name: &str, body: Value, deadline: Duration) -> Result<(), DriverError> {
        self.call(
            Method::PUT,
            &format!("/1.0/instances/{name}/state"),
            Some(body),
            deadline,
        )
        .await
        .map(|_| ())
    }

    async fn push_once(
        &self,
        file_path: &str,
        headers: &[(&str, String)],
        content: &[u8],
    ) -> Result<(), DriverError> {
        let response = self
            .round_trip(
                Method::POST,
                file_path,
                Body::from(content.to_vec()),
                headers,
                self.operation_timeout,
            )
            .await?;
        Self::read_envelope(response).await.map(|_| ())
    }

    async fn fetch_log_file(&self, path: &str) -> Result<String, DriverError> {
        let response = self
            .round_trip(Method::GET, path, Body::empty(), &[], self.operation_timeout)
            .await?;

        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|err| DriverError::Unavailable(err.to_string()))?;

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn parse_status(raw: &str) -> Result<ContainerStatus, DriverError> {
    match raw {
        "Running" => Ok(ContainerStatus::Running),
        "Frozen" => Ok(ContainerStatus::Frozen),
        "Stopped" => Ok(ContainerStatus::Stopped),
        other => Err(DriverError::Protocol(format!(
            "unexpected instance status: {other}"
        ))),
    }
}

/// Pick the first global IPv4 from the instance state's network map,
/// skipping the loopback interface.
fn parse_ipv4(metadata: &Value) -> Option<Ipv4Addr> {
    let network = metadata.get("network")?.as_object()?;

    for (interface, details) in network {
        if interface == "lo" {
            continue;
        }
        let addresses = details.get("addresses")?.as_array()?;
        for address in addresses {
            if address.get("family").and_then(Value::as_str) != Some("inet") {
                continue;
            }
            if address.get("scope").and_then(Value::as_str) == Some("local") {
                continue;
            }
            if let Some(ip) = address
                .get("address")
                .and_then(Value::as_str)
                .and_then(|raw| raw.parse().ok())
            {
                return Some(ip);
            }
        }
    }

    None
}

#[async_trait]
impl HypervisorDriver for LxdDriver {
    async fn clone_image(
        &self,
        source_alias: &str,
        new_name: &str,
        profiles: &[String],
    ) -> Result<(), DriverError> {
        // A previous attempt may have left the container behind.
        if self.state(new_name).await.is_ok() {
            debug!(container = new_name, "container already exists, reusing");
            return Ok(());
        }

        self.call(
            Method::POST,
            "/1.0/instances",
            Some(json!({
                "name": new_name,
                "source": { "type": "image", "alias": source_alias },
                "profiles": profiles,
            })),
            self.operation_timeout,
        )
        .await
        .map(|_| ())
    }

    async fn start(&self, name: &str) -> Result<(), DriverError> {
        if self.state(name).await?.status == ContainerStatus::Running {
            return Ok(());
        }

        self.change_state(
            name,
            json!({ "action": "start", "timeout": self.operation_timeout.as_secs() }),
            self.operation_timeout,
        )
        .await
    }

    async fn stop(&self, name: &str, force: bool, deadline: Duration) -> Result<(), DriverError> {
        if self.state(name).await?.status == ContainerStatus::Stopped {
            return Ok(());
        }

        self.change_state(
            name,
            json!({ "action": "stop", "force": force, "timeout": deadline.as_secs() }),
            deadline,
        )
        .await
    }

    async fn freeze(&self, name: &str) -> Result<(), DriverError> {
        self.change_state(
            name,
            json!({ "action": "freeze", "timeout": self.operation_timeout.as_secs() }),
            self.operation_timeout,
        )
        .await
    }

    async fn unfreeze(&self, name: &str) -> Result<(), DriverError> {
        self.change_state(
            name,
            json!({ "action": "unfreeze", "timeout": self.operation_timeout.as_secs() }),
            self.operation_timeout,
        )
        .await
    }

    async fn delete(&self, name: &str) -> Result<(), DriverError> {
        self.call(
            Method::DELETE,
            &format!("/1.0/instances/{name}"),
            None,
            self.operation_timeout,
        )
        .await
        .map(|_| ())
    }

    async fn state(&self, name: &str) -> Result<ContainerState, DriverError> {
        let metadata = self
            .call(
                Method::GET,
                &format!("/1.0/instances/{name}/state"),
                None,
                self.operation_timeout,
            )
            .await?;

        let status = metadata
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Protocol("instance state is missing a status".into()))?;

        Ok(ContainerState {
            status: parse_status(status)?,
            ipv4: parse_ipv4(&metadata),
        })
    }

    async fn push_file(
        &self,
        name: &str,
        path: &str,
        content: &[u8],
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<(), DriverError> {
        let file_path = format!(
            "/1.0/instances/{name}/files?path={}",
            urlencode(path)
        );

        let mut headers: Vec<(&str, String)> = vec![
            ("X-LXD-type", "file".to_string()),
            ("X-LXD-write", "overwrite".to_string()),
        ];
        if let Some(mode) = mode {
            headers.push(("X-LXD-mode", format!("{mode:o}")));
        }
        if let Some(uid) = uid {
            headers.push(("X-LXD-uid", uid.to_string()));
        }
        if let Some(gid) = gid {
            headers.push(("X-LXD-gid", gid.to_string()));
        }

        match self.push_once(&file_path, &headers, content).await {
            Ok(()) => Ok(()),
            Err(DriverError::Protocol(first)) => {
                // Most likely a missing parent directory; create it and
                // retry once.
                if let Some(parent) = Path::new(path).parent().and_then(Path::to_str) {
                    if !parent.is_empty() && parent != "/" {
                        self.exec(name, &["mkdir", "-p", parent], None).await?;
                        return self.push_once(&file_path, &headers, content).await;
                    }
                }
                Err(DriverError::Protocol(first))
            }
            Err(err) => Err(err),
        }
    }

    async fn pull_file(&self, name: &str, path: &str) -> Result<Vec<u8>, DriverError> {
        let response = self
            .round_trip(
                Method::GET,
                &format!("/1.0/instances/{name}/files?path={}", urlencode(path)),
                Body::empty(),
                &[],
                self.operation_timeout,
            )
            .await?;

        if response.status() == http::StatusCode::NOT_FOUND {
            return Err(DriverError::NotFound);
        }
        if !response.status().is_success() {
            return Err(DriverError::Protocol(format!(
                "file pull failed with status {}",
                response.status()
            )));
        }

        hyper::body::to_bytes(response.into_body())
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|err| DriverError::Unavailable(err.to_string()))
    }

    async fn exec(
        &self,
        name: &str,
        argv: &[&str],
        env: Option<&HashMap<String, String>>,
    ) -> Result<ExecResult, DriverError> {
        let metadata = self
            .call(
                Method::POST,
                &format!("/1.0/instances/{name}/exec"),
                Some(json!({
                    "command": argv,
                    "environment": env.cloned().unwrap_or_default(),
                    "record-output": true,
                    "wait-for-websocket": false,
                    "interactive": false,
                })),
                self.operation_timeout,
            )
            .await?;

        let exit_code = metadata
            .get("return")
            .and_then(Value::as_i64)
            .ok_or_else(|| DriverError::Protocol("exec result is missing an exit code".into()))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(output) = metadata.get("output").and_then(Value::as_object) {
            if let Some(path) = output.get("1").and_then(Value::as_str) {
                stdout = self.fetch_log_file(path).await.unwrap_or_default();
            }
            if let Some(path) = output.get("2").and_then(Value::as_str) {
                stderr = self.fetch_log_file(path).await.unwrap_or_default();
            }
        }

        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn snapshot_create(&self, name: &str, snap: &str) -> Result<(), DriverError> {
        self.call(
            Method::POST,
            &format!("/1.0/instances/{name}/snapshots"),
            Some(json!({ "name": snap })),
            self.operation_timeout,
        )
        .await
        .map(|_| ())
    }

    async fn snapshot_restore(&self, name: &str, snap: &str) -> Result<(), DriverError> {
        self.call(
            Method::PUT,
            &format!("/1.0/instances/{name}"),
            Some(json!({ "restore": snap })),
            self.operation_timeout,
        )
        .await
        .map(|_| ())
    }

    async fn snapshot_delete(&self, name: &str, snap: &str) -> Result<(), DriverError> {
        match self
            .call(
                Method::DELETE,
                &format!("/1.0/instances/{name}/snapshots/{snap}"),
                None,
                self.operation_timeout,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(DriverError::NotFound) => {
                warn!(container = name, snapshot = snap, "snapshot already gone");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn snapshots_list(&self, name: &str) -> Result<Vec<String>, DriverError> {
        let metadata = self
            .call(
                Method::GET,
                &format!("/1.0/instances/{name}/snapshots"),
                None,
                self.operation_timeout,
            )
            .await?;

        let entries = metadata
            .as_array()
            .ok_or_else(|| DriverError::Protocol("snapshot list is not an array".into()))?;

        Ok(entries
            .iter()
            .filter_map(Value::as_str)
            .map(|url| url.rsplit('/').next().unwrap_or(url).to_string())
            .collect())
    }
}

fn urlencode(path: &str) -> String {
    path.replace('%', "%25").replace(' ', "%20").replace('?', "%3F").replace('&', "%26")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_running_state_with_ip() {
        let metadata = json!({
            "status": "Running",
            "network": {
                "lo": {
                    "addresses": [
                        { "family": "inet", "address": "127.0.0.1", "scope": "local" }
                    ]
                },
                "eth0": {
                    "addresses": [
                        { "family": "inet6", "address": "fd42::1", "scope": "global" },
                        { "family": "inet", "address": "10.140.77.5", "scope": "global" }
                    ]
                }
            }
        });

        assert_eq!(parse_status("Running").unwrap(), ContainerStatus::Running);
        assert_eq!(parse_ipv4(&metadata), Some("10.140.77.5".parse().unwrap()));
    }

    #[test]
    fn stopped_state_has_no_ip() {
        let metadata = json!({ "status": "Stopped", "network": null });
        assert_eq!(parse_status("Stopped").unwrap(), ContainerStatus::Stopped);
        assert_eq!(parse_ipv4(&metadata), None);
    }

    #[test]
    fn unknown_status_is_a_protocol_error() {
        assert!(matches!(
            parse_status("Restarting"),
            Err(DriverError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn error_envelope_maps_missing_containers() {
        let body = serde_json::json!({
            "type": "error",
            "error": "Instance not found",
            "error_code": 404,
        })
        .to_string();
        let response = hyper::Response::new(Body::from(body));

        assert!(matches!(
            LxdDriver::read_envelope(response).await,
            Err(DriverError::NotFound)
        ));
    }
}
